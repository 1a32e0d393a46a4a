use std::fmt::{Display, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, trace, warn};
use crate::buffers::descriptor::{IoDescriptor, OpKind};
use crate::buffers::descriptor_pool::{DescriptorPool, NoResources};
use crate::config::AddressFamily;
use crate::io_port::SocketIo;
use crate::reorder::{PendingSend, ReorderBuffer};
use crate::sequence::Sequence;

/// Stable identifier of a registered connection. It is stored in every descriptor that is
///  posted on the connection's socket, and is used to find the connection when the descriptor
///  comes back with a completion.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ConnectionId(u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl ConnectionId {
    pub fn from_raw(value: u64) -> ConnectionId {
        ConnectionId(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EndpointKind {
    /// a TCP listener: posts accepts, never receives or sends
    Listener,
    /// an accepted TCP connection
    Stream,
    /// a UDP socket, echoing to whoever sent each datagram
    Datagram,
}
impl EndpointKind {
    /// Accepted connections start receiving at sequence 1 - sequence 0 is taken by the data that
    ///  came with the accept
    fn first_receive_sequence(&self) -> Sequence {
        match self {
            EndpointKind::Stream => Sequence::from_raw(1),
            EndpointKind::Listener | EndpointKind::Datagram => Sequence::ZERO,
        }
    }
}

#[derive(Debug, Error)]
pub enum PostError {
    #[error("connection is closing")]
    Closing,
    #[error(transparent)]
    NoResources(#[from] NoResources),
    #[error("socket refused the operation: {0}")]
    Failed(#[source] io::Error),
}

/// A registered socket - an accepted connection, a listener, or a datagram endpoint - with its
///  lock-guarded bookkeeping.
pub struct Connection {
    id: ConnectionId,
    kind: EndpointKind,
    family: AddressFamily,
    peer_addr: Option<SocketAddr>,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub fn new(id: ConnectionId, kind: EndpointKind, family: AddressFamily, peer_addr: Option<SocketAddr>, socket: Arc<dyn SocketIo>) -> Connection {
        Connection {
            id,
            kind,
            family,
            peer_addr,
            state: Mutex::new(ConnectionState {
                id,
                kind,
                socket: Some(socket),
                outstanding_operations: 0,
                closing: false,
                aborted: false,
                destroyed: false,
                deferred_receives: 0,
                reorder: ReorderBuffer::new(kind.first_receive_sequence()),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// All changes to sequence counters, the out-of-order list and the outstanding count happen
    ///  while holding this lock. Posting operations while holding it is safe because sockets
    ///  never complete an operation from inside the posting call.
    pub fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap()
    }
}

/// The mutable part of a [Connection].
///
/// The connection may be destroyed once it is closing, has no operations in flight and no
///  completed receives waiting to be echoed - see [ConnectionState::is_destroyable].
pub struct ConnectionState {
    id: ConnectionId,
    kind: EndpointKind,
    /// `None` after destruction
    socket: Option<Arc<dyn SocketIo>>,
    outstanding_operations: usize,
    closing: bool,
    /// closed because of an error: nothing more is echoed
    aborted: bool,
    destroyed: bool,
    /// receives that could not be posted for lack of descriptors, and are posted as soon as
    ///  descriptors become available again
    deferred_receives: usize,
    reorder: ReorderBuffer,
}

impl ConnectionState {
    pub fn outstanding_operations(&self) -> usize {
        self.outstanding_operations
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn deferred_receives(&self) -> usize {
        self.deferred_receives
    }

    pub fn reorder(&self) -> &ReorderBuffer {
        &self.reorder
    }

    /// Allocates a receive descriptor and posts it. If the pool is exhausted, the receive is
    ///  remembered as deferred and [PostError::NoResources] is returned.
    pub fn post_new_receive(&mut self, pool: &DescriptorPool) -> Result<(), PostError> {
        if self.closing {
            return Err(PostError::Closing);
        }

        match pool.allocate(OpKind::Receive, pool.buf_size()) {
            Ok(descriptor) => self.post_receive(descriptor, pool),
            Err(e) => {
                self.deferred_receives += 1;
                debug!("connection {}: deferring receive - {}", self.id, e);
                Err(e.into())
            }
        }
    }

    /// Assigns the next receive sequence to the descriptor and posts it. Both happen under the
    ///  connection's lock, so sequence numbers are in post order.
    ///
    /// If the socket refuses the receive synchronously, its sequence slot is marked as skipped
    ///  so that it does not hold back the sends behind it.
    pub fn post_receive(&mut self, mut descriptor: IoDescriptor, pool: &DescriptorPool) -> Result<(), PostError> {
        if self.closing {
            pool.release(descriptor);
            return Err(PostError::Closing);
        }
        let Some(socket) = self.socket.clone() else {
            pool.release(descriptor);
            return Err(PostError::Closing);
        };

        if descriptor.capacity() < pool.buf_size() {
            pool.refill(&mut descriptor);
        }

        let sequence = self.reorder.assign_receive_sequence();
        descriptor.set_kind(OpKind::Receive);
        descriptor.set_connection(self.id);
        descriptor.set_sequence(Some(sequence));
        descriptor.set_peer_addr(None);
        descriptor.truncate(0);

        match socket.post_receive(descriptor) {
            Ok(()) => {
                trace!("connection {}: posted receive {}", self.id, sequence);
                self.outstanding_operations += 1;
                Ok(())
            }
            Err(failure) => {
                warn!("connection {}: posting receive {} failed: {}", self.id, sequence, failure.error);
                pool.release(failure.descriptor);
                self.insert_pending_send(sequence, PendingSend::Skipped, pool);
                self.drain_sends(pool);
                Err(PostError::Failed(failure.error))
            }
        }
    }

    pub fn post_accept(&mut self, mut descriptor: IoDescriptor, pool: &DescriptorPool) -> Result<(), PostError> {
        let socket = match (&self.socket, self.closing) {
            (Some(socket), false) => socket.clone(),
            _ => {
                pool.release(descriptor);
                return Err(PostError::Closing);
            }
        };

        descriptor.set_kind(OpKind::Accept);
        descriptor.set_connection(self.id);
        descriptor.set_sequence(None);
        descriptor.truncate(0);

        match socket.post_accept(descriptor) {
            Ok(()) => {
                self.outstanding_operations += 1;
                Ok(())
            }
            Err(failure) => {
                pool.release(failure.descriptor);
                Err(PostError::Failed(failure.error))
            }
        }
    }

    /// Puts a completed receive (or a skipped slot) into the out-of-order list at its sequence
    ///  position. Invalid entries are logged and released.
    pub fn insert_pending_send(&mut self, sequence: Sequence, entry: PendingSend, pool: &DescriptorPool) {
        if self.aborted {
            // the list was discarded, this entry could only wait behind a gap forever
            if let PendingSend::Payload(descriptor) = entry {
                pool.release(descriptor);
            }
            return;
        }
        if let Err(PendingSend::Payload(rejected)) = self.reorder.insert(sequence, entry) {
            pool.release(rejected);
        }
    }

    /// Issues sends for all entries at the head of the out-of-order list that are next in
    ///  sequence, stopping at the first gap. Returns the number of sends that were posted.
    ///
    /// A send slot counts as consumed even if posting the send fails: a stream connection is
    ///  closed in that case, a datagram endpoint just loses that one echo.
    pub fn drain_sends(&mut self, pool: &DescriptorPool) -> usize {
        let mut num_posted = 0;
        while let Some((sequence, pending)) = self.reorder.pop_releasable() {
            let PendingSend::Payload(descriptor) = pending else {
                trace!("connection {}: passing over skipped sequence {}", self.id, sequence);
                continue;
            };

            let Some(socket) = self.socket.clone() else {
                pool.release(descriptor);
                continue;
            };

            match socket.post_send(descriptor) {
                Ok(()) => {
                    trace!("connection {}: posted send {}", self.id, sequence);
                    self.outstanding_operations += 1;
                    num_posted += 1;
                }
                Err(failure) => {
                    pool.release(failure.descriptor);
                    match self.kind {
                        EndpointKind::Datagram => {
                            warn!("connection {}: posting send {} failed - dropping datagram: {}", self.id, sequence, failure.error);
                        }
                        _ => {
                            debug!("connection {}: posting send {} failed - closing: {}", self.id, sequence, failure.error);
                            self.begin_close(true, pool);
                        }
                    }
                }
            }
        }
        num_posted
    }

    /// Marks the connection as closing. A graceful close lets buffered sends and in-flight
    ///  operations run their course. A fatal close discards buffered sends - they can never be
    ///  echoed in order - and closes the socket, aborting everything that is still in flight.
    pub fn begin_close(&mut self, fatal: bool, pool: &DescriptorPool) {
        if !self.closing {
            debug!("connection {}: closing ({})", self.id, if fatal { "fatal" } else { "graceful" });
        }
        self.closing = true;
        self.deferred_receives = 0;

        if fatal {
            self.aborted = true;
            for descriptor in self.reorder.discard_pending() {
                pool.release(descriptor);
            }
            if let Some(socket) = &self.socket {
                socket.close();
            }
        }
    }

    /// Posts receives that were deferred (for lack of descriptors, or refused by a datagram
    ///  socket), as far as descriptors are
    ///  available now
    pub fn resume_deferred_receives(&mut self, pool: &DescriptorPool) -> Result<(), PostError> {
        let num_deferred = std::mem::take(&mut self.deferred_receives);
        for i in 0..num_deferred {
            if let Err(e) = self.post_new_receive(pool) {
                // the failed attempt itself is re-registered by the caller or by post_new_receive
                if !self.closing {
                    self.deferred_receives += num_deferred - i - 1;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remembers a receive that could not be posted, so that it is retried later
    pub fn defer_receive(&mut self) {
        if !self.closing {
            self.deferred_receives += 1;
        }
    }

    /// to be called once for every completion, before it is handled
    pub fn finish_operation(&mut self) {
        if self.outstanding_operations == 0 {
            warn!("connection {}: completion without outstanding operation", self.id);
            return;
        }
        self.outstanding_operations -= 1;
    }

    pub fn is_destroyable(&self) -> bool {
        !self.destroyed
            && self.closing
            && self.outstanding_operations == 0
            && self.reorder.is_empty()
    }

    /// Marks the connection as destroyed if it is destroyable, returning its socket for closing.
    ///  This returns `Some` at most once per connection.
    pub fn mark_destroyed(&mut self) -> Option<Arc<dyn SocketIo>> {
        if !self.is_destroyable() {
            return None;
        }
        self.destroyed = true;
        self.socket.take()
    }
}
