use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};
use crate::buffers::descriptor::IoDescriptor;
use crate::io_port::{AcceptedConnection, Completion, CompletionPort, PostFailure, SocketIo};
use crate::net::{aborted, until_closed, CloseSignal, OpEngine, PostedOps};

/// An accepted TCP connection
pub struct TcpChannel {
    receives: PostedOps,
    sends: PostedOps,
    close_signal: CloseSignal,
}

impl TcpChannel {
    pub fn spawn(stream: TcpStream, port: CompletionPort) -> Arc<TcpChannel> {
        let (read_half, write_half) = stream.into_split();
        let close_signal = CloseSignal::new();

        let (receives, receive_engine) = close_signal.engine(port.clone());
        let (sends, send_engine) = close_signal.engine(port);

        tokio::spawn(Self::receive_loop(read_half, receive_engine));
        tokio::spawn(Self::send_loop(write_half, send_engine));

        Arc::new(TcpChannel {
            receives,
            sends,
            close_signal,
        })
    }

    async fn receive_loop(mut read_half: OwnedReadHalf, mut engine: OpEngine) {
        while let Some(mut descriptor) = engine.next().await {
            let result = tokio::select! {
                r = read_half.read(descriptor.receive_buffer()) => r,
                _ = until_closed(&mut engine.closed) => Err(aborted()),
            };

            descriptor.truncate(*result.as_ref().unwrap_or(&0));
            engine.complete(descriptor, result);
        }
        trace!("receive loop finished");
        engine.abort_remaining();
    }

    async fn send_loop(mut write_half: OwnedWriteHalf, mut engine: OpEngine) {
        while let Some(descriptor) = engine.next().await {
            let result = tokio::select! {
                r = write_half.write_all(descriptor.payload()) => r.map(|_| descriptor.len()),
                _ = until_closed(&mut engine.closed) => Err(aborted()),
            };
            engine.complete(descriptor, result);
        }
        trace!("send loop finished");
        engine.abort_remaining();
    }
}

impl SocketIo for TcpChannel {
    fn post_receive(&self, descriptor: IoDescriptor) -> Result<(), PostFailure> {
        self.receives.post(descriptor)
    }

    fn post_send(&self, descriptor: IoDescriptor) -> Result<(), PostFailure> {
        self.sends.post(descriptor)
    }

    fn post_accept(&self, descriptor: IoDescriptor) -> Result<(), PostFailure> {
        Err(PostFailure::new(descriptor, std::io::Error::new(std::io::ErrorKind::Unsupported, "accept on a connected socket")))
    }

    fn close(&self) {
        self.close_signal.close();
    }
}

/// A TCP listener. Each posted accept completes with a new [TcpChannel] for the accepted
///  connection, whose operations complete through the same completion port.
pub struct TcpAcceptor {
    local_addr: SocketAddr,
    accepts: PostedOps,
    close_signal: CloseSignal,
}

impl TcpAcceptor {
    pub fn spawn(listener: TcpListener, port: CompletionPort) -> std::io::Result<Arc<TcpAcceptor>> {
        let local_addr = listener.local_addr()?;
        let close_signal = CloseSignal::new();
        let (accepts, engine) = close_signal.engine(port);

        tokio::spawn(Self::accept_loop(listener, engine));

        Ok(Arc::new(TcpAcceptor {
            local_addr,
            accepts,
            close_signal,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(listener: TcpListener, mut engine: OpEngine) {
        while let Some(descriptor) = engine.next().await {
            let result = tokio::select! {
                r = listener.accept() => r,
                _ = until_closed(&mut engine.closed) => Err(aborted()),
            };

            match result {
                Ok((stream, peer_addr)) => {
                    debug!("accepted connection from {}", peer_addr);
                    let socket = TcpChannel::spawn(stream, engine.port.clone());
                    // tokio does not deliver data with an accept
                    engine.port.complete(Completion::accepted(descriptor, 0, AcceptedConnection {
                        socket,
                        peer_addr,
                    }));
                }
                Err(e) => engine.complete(descriptor, Err(e)),
            }
        }
        trace!("accept loop for {:?} finished", listener.local_addr());
        engine.abort_remaining();
    }
}

impl SocketIo for TcpAcceptor {
    fn post_receive(&self, descriptor: IoDescriptor) -> Result<(), PostFailure> {
        Err(PostFailure::new(descriptor, std::io::Error::new(std::io::ErrorKind::Unsupported, "receive on a listener")))
    }

    fn post_send(&self, descriptor: IoDescriptor) -> Result<(), PostFailure> {
        Err(PostFailure::new(descriptor, std::io::Error::new(std::io::ErrorKind::Unsupported, "send on a listener")))
    }

    fn post_accept(&self, descriptor: IoDescriptor) -> Result<(), PostFailure> {
        self.accepts.post(descriptor)
    }

    fn close(&self) {
        self.close_signal.close();
    }
}
