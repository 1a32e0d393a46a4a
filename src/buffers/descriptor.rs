use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use bytes::BytesMut;
use crate::buffers::descriptor_pool::DescriptorLease;
use crate::connection::ConnectionId;
use crate::sequence::Sequence;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum OpKind {
    Accept,
    Receive,
    Send,
}

/// The per-operation record of one asynchronous accept, receive or send: the data buffer plus
///  everything needed to handle the operation's completion.
///
/// A descriptor is owned by whoever currently drives the operation: the socket layer while the
///  operation is in flight, the completion handler once it completed. It is handed back verbatim
///  with the completion, so [IoDescriptor::connection] identifies the connection a completion
///  belongs to.
///
/// Descriptors are created by a [crate::buffers::descriptor_pool::DescriptorPool]; every live
///  descriptor counts towards the pool's outstanding count until it is dropped or released.
pub struct IoDescriptor {
    kind: OpKind,
    connection: Option<ConnectionId>,
    buf: BytesMut,
    capacity: usize,
    /// datagram mode only: the sender of a received datagram, and the destination of its echo
    peer_addr: Option<SocketAddr>,
    /// assigned to receives when they are posted, carried over to the resulting send
    sequence: Option<Sequence>,
    _lease: DescriptorLease,
}

impl Debug for IoDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoDescriptor")
            .field("kind", &self.kind)
            .field("connection", &self.connection)
            .field("len", &self.buf.len())
            .field("capacity", &self.capacity)
            .field("peer_addr", &self.peer_addr)
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl IoDescriptor {
    pub(crate) fn new(kind: OpKind, buf: BytesMut, capacity: usize, lease: DescriptorLease) -> IoDescriptor {
        IoDescriptor {
            kind,
            connection: None,
            buf,
            capacity,
            peer_addr: None,
            sequence: None,
            _lease: lease,
        }
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: OpKind) {
        self.kind = kind;
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    pub fn set_connection(&mut self, connection: ConnectionId) {
        self.connection = Some(connection);
    }

    pub fn sequence(&self) -> Option<Sequence> {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: Option<Sequence>) {
        self.sequence = sequence;
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn set_peer_addr(&mut self, peer_addr: Option<SocketAddr>) {
        self.peer_addr = peer_addr;
    }

    /// the buffer's fixed capacity, i.e. the maximum number of bytes a receive can deliver
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// Exposes the full capacity for a receive. The receiving code is expected to
    ///  [IoDescriptor::truncate] to the number of bytes actually received.
    pub fn receive_buffer(&mut self) -> &mut [u8] {
        self.buf.resize(self.capacity, 0);
        self.buf.as_mut()
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    pub fn set_payload(&mut self, data: &[u8]) {
        self.buf.clear();
        self.buf.extend_from_slice(data);
    }

    /// Moves the buffer out of this descriptor, leaving it without a buffer
    pub fn take_buffer(&mut self) -> BytesMut {
        self.capacity = 0;
        std::mem::take(&mut self.buf)
    }

    pub(crate) fn put_buffer(&mut self, buf: BytesMut, capacity: usize) {
        self.buf = buf;
        self.capacity = capacity;
    }

    /// Turns a completed receive into the send that echoes its data. Payload, sequence number
    ///  and peer address stay with the descriptor - the buffer is moved rather than copied.
    pub fn become_send(&mut self) {
        self.kind = OpKind::Send;
    }
}
