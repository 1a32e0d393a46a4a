//! [crate::io_port::SocketIo] implementations on top of tokio sockets.
//!
//! Every socket gets one engine task per direction. Posting an operation puts its descriptor
//!  into the engine's queue and returns immediately; the engine performs the queued operations
//!  one after the other, in post order, and delivers each result to the completion port. This
//!  gives the completion port guarantee that buffers are filled in the order they were posted,
//!  while completions are still handled in whatever order the workers pick them up.
//!
//! Closing a socket stops its engines. Every operation that was posted but not yet finished
//!  completes with `ConnectionAborted`, so each posted operation completes exactly once.

pub mod endpoint;
pub mod tcp;
pub mod udp;

use std::io;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::trace;
use crate::buffers::descriptor::IoDescriptor;
use crate::io_port::{Completion, CompletionPort, PostFailure};

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "socket was closed")
}

/// The posting side of an engine's queue
struct PostedOps {
    sender: UnboundedSender<IoDescriptor>,
}
impl PostedOps {
    fn post(&self, descriptor: IoDescriptor) -> Result<(), PostFailure> {
        self.sender.send(descriptor)
            .map_err(|e| PostFailure::new(e.0, io::Error::new(io::ErrorKind::NotConnected, "socket is closed")))
    }
}

/// The flag that tells a socket's engines to stop. Dropping it has the same effect as
///  [CloseSignal::close].
struct CloseSignal {
    closed: watch::Sender<bool>,
}
impl CloseSignal {
    fn new() -> CloseSignal {
        let (closed, _) = watch::channel(false);
        CloseSignal { closed }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn engine(&self, port: CompletionPort) -> (PostedOps, OpEngine) {
        let (sender, ops) = unbounded_channel();
        (
            PostedOps { sender },
            OpEngine {
                ops,
                closed: self.closed.subscribe(),
                port,
            },
        )
    }
}

/// The serving side of an engine's queue, owned by the engine task
struct OpEngine {
    ops: UnboundedReceiver<IoDescriptor>,
    closed: watch::Receiver<bool>,
    port: CompletionPort,
}

impl OpEngine {
    /// The next posted operation, or `None` once the socket is closed
    async fn next(&mut self) -> Option<IoDescriptor> {
        tokio::select! {
            biased;
            _ = until_closed(&mut self.closed) => None,
            descriptor = self.ops.recv() => descriptor,
        }
    }

    fn complete(&self, descriptor: IoDescriptor, result: io::Result<usize>) {
        self.port.complete(Completion::new(descriptor, result));
    }

    /// Completes everything that is still queued as aborted. The queue is closed first, so
    ///  posting fails from then on and no operation can slip in afterwards.
    fn abort_remaining(mut self) {
        self.ops.close();
        while let Ok(descriptor) = self.ops.try_recv() {
            trace!("aborting {:?}", descriptor);
            self.port.complete(Completion::new(descriptor, Err(aborted())));
        }
    }
}

/// completes when the close flag is set or its sender is gone
async fn until_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}
