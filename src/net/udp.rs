use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;
use crate::buffers::descriptor::IoDescriptor;
use crate::io_port::{CompletionPort, PostFailure, SocketIo};
use crate::net::{aborted, until_closed, CloseSignal, OpEngine, PostedOps};

/// A UDP socket serving as a datagram endpoint. Completed receives carry the sender's address,
///  sends go to the address in their descriptor.
pub struct UdpChannel {
    local_addr: SocketAddr,
    receives: PostedOps,
    sends: PostedOps,
    close_signal: CloseSignal,
}

impl UdpChannel {
    pub fn spawn(socket: UdpSocket, port: CompletionPort) -> io::Result<Arc<UdpChannel>> {
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let close_signal = CloseSignal::new();

        let (receives, receive_engine) = close_signal.engine(port.clone());
        let (sends, send_engine) = close_signal.engine(port);

        tokio::spawn(Self::receive_loop(socket.clone(), receive_engine));
        tokio::spawn(Self::send_loop(socket, send_engine));

        Ok(Arc::new(UdpChannel {
            local_addr,
            receives,
            sends,
            close_signal,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn receive_loop(socket: Arc<UdpSocket>, mut engine: OpEngine) {
        while let Some(mut descriptor) = engine.next().await {
            let result = tokio::select! {
                r = socket.recv_from(descriptor.receive_buffer()) => r,
                _ = until_closed(&mut engine.closed) => Err(aborted()),
            };

            match result {
                Ok((n, from)) => {
                    descriptor.truncate(n);
                    descriptor.set_peer_addr(Some(from));
                    engine.complete(descriptor, Ok(n));
                }
                Err(e) => {
                    descriptor.truncate(0);
                    engine.complete(descriptor, Err(e));
                }
            }
        }
        trace!("receive loop finished");
        engine.abort_remaining();
    }

    async fn send_loop(socket: Arc<UdpSocket>, mut engine: OpEngine) {
        while let Some(descriptor) = engine.next().await {
            let Some(to) = descriptor.peer_addr() else {
                engine.complete(descriptor, Err(io::Error::new(io::ErrorKind::InvalidInput, "datagram without destination")));
                continue;
            };

            let result = tokio::select! {
                r = socket.send_to(descriptor.payload(), to) => r,
                _ = until_closed(&mut engine.closed) => Err(aborted()),
            };
            engine.complete(descriptor, result);
        }
        trace!("send loop finished");
        engine.abort_remaining();
    }
}

impl SocketIo for UdpChannel {
    fn post_receive(&self, descriptor: IoDescriptor) -> Result<(), PostFailure> {
        self.receives.post(descriptor)
    }

    fn post_send(&self, descriptor: IoDescriptor) -> Result<(), PostFailure> {
        self.sends.post(descriptor)
    }

    fn post_accept(&self, descriptor: IoDescriptor) -> Result<(), PostFailure> {
        Err(PostFailure::new(descriptor, io::Error::new(io::ErrorKind::Unsupported, "accept on a datagram socket")))
    }

    fn close(&self) {
        self.close_signal.close();
    }
}
