//! The asynchronous I/O primitives the echo engine is built on, modelled after a completion
//!  port: operations are *posted* without blocking, and their results are delivered later
//!  through a single queue that is shared by all sockets.
//!
//! Each operation carries an [IoDescriptor] that travels with it and comes back verbatim with
//!  the [Completion]. The descriptor's connection id is the completion key that tells the
//!  handler which connection the completion belongs to.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
#[cfg(test)] use mockall::automock;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::trace;
use crate::buffers::descriptor::IoDescriptor;

/// A socket refused to start an operation. The descriptor is handed back so that the caller
///  can release (or re-post) it.
#[derive(Debug, Error)]
#[error("posting {:?} failed: {error}", .descriptor.kind())]
pub struct PostFailure {
    pub descriptor: IoDescriptor,
    #[source]
    pub error: io::Error,
}
impl PostFailure {
    pub fn new(descriptor: IoDescriptor, error: io::Error) -> PostFailure {
        PostFailure { descriptor, error }
    }
}

/// The socket side of the engine: posting operations on a connected socket, a datagram socket
///  or a listener.
///
/// Implementations must never deliver a completion synchronously from inside a `post_*` call
///  (completions always go through the [CompletionPort]), so callers may hold a connection's lock
///  while posting. An operation that is posted successfully is guaranteed to produce exactly one
///  completion, either with its result or, after [SocketIo::close], with an
///  `io::ErrorKind::ConnectionAborted` error.
///
/// Receives on a socket are filled in the order they were posted, and sends are transmitted in
///  the order they were posted - but completions may be *handled* in any order.
#[cfg_attr(test, automock)]
pub trait SocketIo: Send + Sync + 'static {
    fn post_receive(&self, descriptor: IoDescriptor) -> Result<(), PostFailure>;

    /// Sends the descriptor's payload - to its peer address in datagram mode
    fn post_send(&self, descriptor: IoDescriptor) -> Result<(), PostFailure>;

    fn post_accept(&self, descriptor: IoDescriptor) -> Result<(), PostFailure>;

    /// Closes the socket, aborting all operations that are still in flight. Calling this more
    ///  than once has no additional effect.
    fn close(&self);
}

/// a connection delivered by an accept completion
pub struct AcceptedConnection {
    pub socket: Arc<dyn SocketIo>,
    pub peer_addr: SocketAddr,
}

pub struct Completion {
    pub descriptor: IoDescriptor,
    /// number of bytes transferred, or the error that terminated the operation
    pub result: io::Result<usize>,
    pub accepted: Option<AcceptedConnection>,
}
impl Completion {
    pub fn new(descriptor: IoDescriptor, result: io::Result<usize>) -> Completion {
        Completion {
            descriptor,
            result,
            accepted: None,
        }
    }

    pub fn accepted(descriptor: IoDescriptor, bytes_transferred: usize, accepted: AcceptedConnection) -> Completion {
        Completion {
            descriptor,
            result: Ok(bytes_transferred),
            accepted: Some(accepted),
        }
    }
}

/// The posting side of the shared completion queue. Every socket holds a clone.
#[derive(Clone)]
pub struct CompletionPort {
    sender: UnboundedSender<Completion>,
}
impl CompletionPort {
    pub fn complete(&self, completion: Completion) {
        if let Err(e) = self.sender.send(completion) {
            // the queue is gone only during shutdown, and dropping the descriptor releases it
            trace!("completion queue is closed - dropping completion for {:?}", e.0.descriptor);
        }
    }
}

/// The queue that all completions go through. Any number of workers may wait on it
///  concurrently; each completion is delivered to exactly one of them, in no particular
///  relation to the order in which operations were posted.
pub struct CompletionQueue {
    sender: UnboundedSender<Completion>,
    receiver: Mutex<UnboundedReceiver<Completion>>,
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionQueue {
    pub fn new() -> CompletionQueue {
        let (sender, receiver) = unbounded_channel();
        CompletionQueue {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub fn port(&self) -> CompletionPort {
        CompletionPort { sender: self.sender.clone() }
    }

    /// waits for the next completion
    pub async fn next(&self) -> Option<Completion> {
        self.receiver.lock().await
            .recv().await
    }

    pub fn try_next(&self) -> Option<Completion> {
        self.receiver.try_lock().ok()?
            .try_recv().ok()
    }
}
