//! Connection lifecycle and completion handling.
//!
//! Every completion is routed to its connection through the id stored in its descriptor, and
//!  handled under that connection's lock:
//! * An **accept** completion creates and registers a new stream connection, echoes the data
//!    that came with the accept as sequence 0, posts the initial receives and re-posts the
//!    accept.
//! * A **receive** completion turns its descriptor into a send (moving the buffer, not copying
//!    it), inserts it into the connection's out-of-order list and drains everything that is
//!    now in sequence. Then a fresh receive is posted to keep the fan-out.
//! * A **send** completion releases its descriptor and drains again.
//!
//! A connection is destroyed - unregistered and its socket closed - once it is closing, has no
//!  operations in flight and nothing left in its out-of-order list. Completions can not arrive
//!  for a destroyed connection because nothing is in flight any more.
//!
//! If a descriptor limit is configured, receives that can not get a descriptor are deferred.
//!  A send completion retries its own connection's deferred receives, and after every completion
//!  the deferred receives of all starved connections are retried.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use rustc_hash::FxHashSet;
use tracing::{debug, error, span, trace, warn, Level};
use crate::buffers::descriptor::{IoDescriptor, OpKind};
use crate::buffers::descriptor_pool::DescriptorPool;
use crate::config::{AddressFamily, EchoConfig};
use crate::connection::{Connection, ConnectionId, ConnectionState, EndpointKind, PostError};
use crate::dispatcher::CompletionHandler;
use crate::io_port::{AcceptedConnection, Completion, SocketIo};
use crate::registry::ConnectionRegistry;
use crate::reorder::PendingSend;
use crate::sequence::Sequence;
use crate::statistics::{ServerGauges, Statistics};

pub struct EchoServer {
    config: Arc<EchoConfig>,
    pool: Arc<DescriptorPool>,
    registry: ConnectionRegistry,
    statistics: Arc<Statistics>,
    /// connections with deferred receives
    starved: Mutex<FxHashSet<ConnectionId>>,
    shutting_down: AtomicBool,
}

impl EchoServer {
    pub fn new(config: Arc<EchoConfig>, statistics: Arc<Statistics>) -> anyhow::Result<EchoServer> {
        config.validate()?;

        let pool = Arc::new(DescriptorPool::new(
            config.buffer_size,
            config.descriptor_cache_size,
            config.max_outstanding_descriptors,
        ));
        Ok(EchoServer {
            config,
            pool,
            registry: ConnectionRegistry::new(),
            statistics,
            starved: Default::default(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EchoConfig {
        &self.config
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.registry.get(id)
    }

    /// number of registered connections, including listeners and datagram endpoints
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn gauges(&self) -> ServerGauges {
        ServerGauges {
            connections: self.registry.len(),
            outstanding_descriptors: self.pool.outstanding(),
        }
    }

    /// Registers a TCP listener and posts `fan_out` accepts on it
    pub fn add_listener(&self, socket: Arc<dyn SocketIo>, family: AddressFamily) -> anyhow::Result<ConnectionId> {
        let connection = self.register(EndpointKind::Listener, family, None, socket);

        let mut state = connection.lock();
        for _ in 0..self.config.fan_out {
            let result = self.pool.allocate(OpKind::Accept, 0)
                .map_err(PostError::from)
                .and_then(|descriptor| state.post_accept(descriptor, &self.pool));
            if let Err(e) = result {
                state.begin_close(true, &self.pool);
                drop(state);
                self.try_destroy(&connection);
                return Err(e.into());
            }
        }
        debug!("listener {} ({:?}): posted {} accepts", connection.id(), family, self.config.fan_out);
        Ok(connection.id())
    }

    /// Registers a UDP socket as a datagram endpoint and posts `fan_out` receives on it
    pub fn add_datagram_endpoint(&self, socket: Arc<dyn SocketIo>, family: AddressFamily) -> anyhow::Result<ConnectionId> {
        let connection = self.register(EndpointKind::Datagram, family, None, socket);

        let mut state = connection.lock();
        for _ in 0..self.config.fan_out {
            if let Err(e) = state.post_new_receive(&self.pool) {
                state.begin_close(true, &self.pool);
                drop(state);
                self.try_destroy(&connection);
                return Err(e.into());
            }
        }
        debug!("datagram endpoint {} ({:?}): posted {} receives", connection.id(), family, self.config.fan_out);
        Ok(connection.id())
    }

    fn register(&self, kind: EndpointKind, family: AddressFamily, peer_addr: Option<std::net::SocketAddr>, socket: Arc<dyn SocketIo>) -> Arc<Connection> {
        let connection = Arc::new(Connection::new(self.registry.next_id(), kind, family, peer_addr, socket));
        self.registry.insert(connection.clone());
        connection
    }

    pub fn on_accept_completed(&self, listener: &Arc<Connection>, mut descriptor: IoDescriptor, result: io::Result<usize>, accepted: Option<AcceptedConnection>) {
        listener.lock().finish_operation();

        match (result, accepted) {
            (Ok(_), Some(accepted)) if listener.lock().is_closing() || self.is_shutting_down() => {
                debug!("listener {} is closing - dropping connection from {}", listener.id(), accepted.peer_addr);
                accepted.socket.close();
                self.pool.release(descriptor);
                self.try_destroy(listener);
                return;
            }
            (Ok(n), Some(accepted)) => {
                self.statistics.add_bytes_read(n);
                self.on_accept(listener, &descriptor, accepted);
            }
            (Ok(_), None) => {
                warn!("listener {}: accept completed without a connection", listener.id());
            }
            (Err(e), _) if is_transient_accept_error(&e) => {
                debug!("listener {}: transient accept error: {}", listener.id(), e);
            }
            (Err(e), _) => {
                if !listener.lock().is_closing() {
                    error!("listener {}: accept failed - retiring accept: {}", listener.id(), e);
                }
                self.pool.release(descriptor);
                self.try_destroy(listener);
                return;
            }
        }

        descriptor.truncate(0);
        let result = listener.lock().post_accept(descriptor, &self.pool);
        match result {
            Ok(()) => {}
            Err(PostError::Closing) => {
                trace!("listener {} is closing - not re-posting accept", listener.id());
            }
            Err(e) => {
                error!("listener {}: re-posting accept failed: {}", listener.id(), e);
            }
        }
        self.try_destroy(listener);
    }

    /// Sets up an accepted connection: registers it, echoes the accept data as sequence 0 and
    ///  posts the initial receives
    fn on_accept(&self, listener: &Connection, accept_descriptor: &IoDescriptor, accepted: AcceptedConnection) -> Arc<Connection> {
        let family = AddressFamily::of(&accepted.peer_addr);
        let connection = self.register(EndpointKind::Stream, family, Some(accepted.peer_addr), accepted.socket);
        debug!("listener {}: accepted connection {} from {}", listener.id(), connection.id(), accepted.peer_addr);

        {
            let mut state = connection.lock();

            // shutdown may have taken its snapshot of the registry before this connection was
            //  registered
            if self.is_shutting_down() {
                state.begin_close(true, &self.pool);
            }

            // the send for the accept data is issued even if there is no data
            let initial = match self.pool.allocate(OpKind::Send, accept_descriptor.len()) {
                Ok(mut send) => {
                    send.set_connection(connection.id());
                    send.set_sequence(Some(Sequence::ZERO));
                    send.set_payload(accept_descriptor.payload());
                    PendingSend::Payload(send)
                }
                Err(e) => {
                    warn!("connection {}: can not echo accept data - {}", connection.id(), e);
                    PendingSend::Skipped
                }
            };
            state.insert_pending_send(Sequence::ZERO, initial, &self.pool);
            state.drain_sends(&self.pool);

            for _ in 0..self.config.fan_out {
                let result = state.post_new_receive(&self.pool);
                if self.handle_receive_post_result(&connection, &mut state, result).is_err() {
                    break;
                }
            }
        }

        self.try_destroy(&connection);
        connection
    }

    pub fn on_receive_completed(&self, connection: &Arc<Connection>, mut descriptor: IoDescriptor, result: io::Result<usize>) {
        let mut state = connection.lock();
        state.finish_operation();

        let Some(sequence) = descriptor.sequence() else {
            warn!("connection {}: receive completed without sequence number", connection.id());
            self.pool.release(descriptor);
            drop(state);
            self.try_destroy(connection);
            return;
        };

        match (connection.kind(), result) {
            (EndpointKind::Stream, Ok(0)) => {
                debug!("connection {}: end of stream at receive {}", connection.id(), sequence);
                state.begin_close(false, &self.pool);
                self.pool.release(descriptor);
                state.insert_pending_send(sequence, PendingSend::Skipped, &self.pool);
                state.drain_sends(&self.pool);
            }
            (_, Ok(n)) => {
                trace!("connection {}: received {} bytes with sequence {}", connection.id(), n, sequence);
                self.statistics.add_bytes_read(n);

                descriptor.truncate(n);
                descriptor.become_send();
                state.insert_pending_send(sequence, PendingSend::Payload(descriptor), &self.pool);
                state.drain_sends(&self.pool);

                if !state.is_closing() {
                    let result = state.post_new_receive(&self.pool);
                    let _ = self.handle_receive_post_result(connection, &mut state, result);
                }
            }
            (EndpointKind::Datagram, Err(e)) => {
                if state.is_closing() {
                    self.pool.release(descriptor);
                }
                else {
                    // e.g. an ICMP 'port unreachable' for an earlier echo - the endpoint goes on
                    debug!("connection {}: ignoring receive error: {}", connection.id(), e);
                    state.insert_pending_send(sequence, PendingSend::Skipped, &self.pool);
                    state.drain_sends(&self.pool);

                    let result = state.post_receive(descriptor, &self.pool);
                    let _ = self.handle_receive_post_result(connection, &mut state, result);
                }
            }
            (_, Err(e)) => {
                if !state.is_closing() {
                    debug!("connection {}: receive failed: {}", connection.id(), e);
                }
                self.pool.release(descriptor);
                state.begin_close(true, &self.pool);
            }
        }

        drop(state);
        self.try_destroy(connection);
    }

    pub fn on_send_completed(&self, connection: &Arc<Connection>, descriptor: IoDescriptor, result: io::Result<usize>) {
        let mut state = connection.lock();
        state.finish_operation();

        match result {
            Ok(n) => {
                trace!("connection {}: sent {} bytes", connection.id(), n);
                self.statistics.add_bytes_sent(n);
            }
            Err(e) if connection.kind() == EndpointKind::Datagram => {
                debug!("connection {}: ignoring send error: {}", connection.id(), e);
            }
            Err(e) => {
                if !state.is_closing() {
                    debug!("connection {}: send failed: {}", connection.id(), e);
                }
                state.begin_close(true, &self.pool);
            }
        }
        self.pool.release(descriptor);

        state.drain_sends(&self.pool);

        if state.deferred_receives() > 0 {
            let result = state.resume_deferred_receives(&self.pool);
            let _ = self.handle_receive_post_result(connection, &mut state, result);
        }

        drop(state);
        self.try_destroy(connection);
    }

    /// Deals with the outcome of posting a receive. Errors are passed on so that callers can
    ///  stop posting.
    fn handle_receive_post_result(&self, connection: &Connection, state: &mut ConnectionState, result: Result<(), PostError>) -> Result<(), ()> {
        match result {
            Ok(()) => Ok(()),
            Err(PostError::Closing) => Err(()),
            Err(PostError::NoResources(_)) => {
                self.starved.lock().unwrap()
                    .insert(connection.id());
                Err(())
            }
            Err(PostError::Failed(e)) => {
                match connection.kind() {
                    EndpointKind::Datagram => {
                        warn!("connection {}: posting receive failed - retrying later: {}", connection.id(), e);
                        state.defer_receive();
                        self.starved.lock().unwrap()
                            .insert(connection.id());
                    }
                    _ => {
                        debug!("connection {}: posting receive failed - closing: {}", connection.id(), e);
                        state.begin_close(true, &self.pool);
                    }
                }
                Err(())
            }
        }
    }

    /// Retries deferred receives of all starved connections
    fn resume_starved(&self) {
        let starved = {
            let mut starved = self.starved.lock().unwrap();
            if starved.is_empty() {
                return;
            }
            std::mem::take(&mut *starved)
        };

        for id in starved {
            let Some(connection) = self.registry.get(id) else {
                continue;
            };

            let mut state = connection.lock();
            if state.deferred_receives() == 0 {
                continue;
            }
            trace!("connection {}: resuming {} deferred receives", id, state.deferred_receives());
            let result = state.resume_deferred_receives(&self.pool);
            let _ = self.handle_receive_post_result(&connection, &mut state, result);
            drop(state);
            self.try_destroy(&connection);
        }
    }

    /// Destroys the connection if it is closing, has nothing in flight and nothing waiting to be
    ///  sent. Returns `true` if this call destroyed it; redundant and concurrent calls are safe.
    pub fn try_destroy(&self, connection: &Arc<Connection>) -> bool {
        let socket = connection.lock().mark_destroyed();
        let Some(socket) = socket else {
            return false;
        };

        match connection.peer_addr() {
            Some(peer_addr) => debug!("destroying connection {} ({:?}) from {}", connection.id(), connection.family(), peer_addr),
            None => debug!("destroying {:?} {} ({:?})", connection.kind(), connection.id(), connection.family()),
        }
        self.registry.remove(connection.id());
        self.starved.lock().unwrap()
            .remove(&connection.id());
        socket.close();
        true
    }

    /// Closes all registered sockets, aborting their outstanding operations. Connections are
    ///  destroyed as the aborted operations complete.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let connections = self.registry.snapshot();
        debug!("shutting down {} connections", connections.len());
        for connection in connections {
            connection.lock().begin_close(true, &self.pool);
            self.try_destroy(&connection);
        }
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}

impl CompletionHandler for EchoServer {
    fn handle_completion(&self, completion: Completion) {
        let Completion { descriptor, result, accepted } = completion;

        let Some(id) = descriptor.connection() else {
            warn!("completion for descriptor without connection: {:?}", descriptor);
            self.pool.release(descriptor);
            return;
        };
        let Some(connection) = self.registry.get(id) else {
            warn!("completion for unknown connection {}", id);
            self.pool.release(descriptor);
            return;
        };

        let span = span!(Level::TRACE, "completion", connection = %id, kind = ?descriptor.kind());
        let _entered = span.enter();

        match descriptor.kind() {
            OpKind::Accept => self.on_accept_completed(&connection, descriptor, result, accepted),
            OpKind::Receive => self.on_receive_completed(&connection, descriptor, result),
            OpKind::Send => self.on_send_completed(&connection, descriptor, result),
        }

        // any completion may have returned descriptors to the pool
        self.resume_starved();
    }
}
