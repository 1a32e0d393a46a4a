//! Server setup: resolving bind addresses, creating sockets, and wiring sockets, workers and the
//!  statistics reporter together.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail};
use socket2::{Domain, Socket, Type};
use tokio::net::{lookup_host, TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use crate::config::{AddressFamily, EchoConfig, Protocol};
use crate::dispatcher::CompletionDispatcher;
use crate::echo_server::EchoServer;
use crate::io_port::CompletionQueue;
use crate::net::tcp::TcpAcceptor;
use crate::net::udp::UdpChannel;
use crate::statistics::{spawn_reporter, Statistics};

/// The local addresses to bind to: the wildcard address of each configured family if no host is
///  configured, otherwise the host's addresses (a literal or a name that is resolved), filtered
///  by the configured family.
pub async fn resolve_bind_addresses(config: &EchoConfig) -> anyhow::Result<Vec<SocketAddr>> {
    let candidates: Vec<SocketAddr> = match &config.bind_host {
        None => {
            vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port),
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), config.port),
            ]
        }
        Some(host) => match host.parse::<IpAddr>() {
            Ok(ip) => vec![SocketAddr::new(ip, config.port)],
            Err(_) => lookup_host((host.as_str(), config.port)).await?.collect(),
        }
    };

    let mut result: Vec<SocketAddr> = Vec::new();
    for addr in candidates {
        let family_matches = config.address_family
            .map(|f| f == AddressFamily::of(&addr))
            .unwrap_or(true);
        if family_matches && !result.contains(&addr) {
            result.push(addr);
        }
    }

    if result.is_empty() {
        bail!("no local address for {:?} matches address family {:?}", config.bind_host, config.address_family);
    }
    debug!("bind addresses: {:?}", result);
    Ok(result)
}

/// Creates a bound (and for TCP, listening) non-blocking socket. IPv6 sockets are v6-only so
///  that an IPv4 socket can be bound to the same port.
fn create_socket(addr: SocketAddr, config: &EchoConfig) -> anyhow::Result<Socket> {
    let domain = Domain::for_address(addr);
    let socket = match config.protocol {
        Protocol::Tcp => Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))?,
        Protocol::Udp => Socket::new(domain, Type::DGRAM, Some(socket2::Protocol::UDP))?,
    };

    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;

    match config.protocol {
        Protocol::Tcp => {
            socket.set_reuse_address(true)?;
            socket.bind(&addr.into())?;
            socket.listen(config.listen_backlog.try_into().unwrap_or(i32::MAX))?;
        }
        Protocol::Udp => {
            socket.bind(&addr.into())?;
        }
    }
    Ok(socket)
}

/// Binds a socket to the address and registers it with the server, returning the actual local
///  address
fn bind_endpoint(server: &EchoServer, queue: &CompletionQueue, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
    let socket = create_socket(addr, server.config())?;
    let family = AddressFamily::of(&addr);

    match server.config().protocol {
        Protocol::Tcp => {
            let listener = TcpListener::from_std(socket.into())?;
            let acceptor = TcpAcceptor::spawn(listener, queue.port())?;
            let local_addr = acceptor.local_addr();
            server.add_listener(acceptor, family)?;
            Ok(local_addr)
        }
        Protocol::Udp => {
            let udp_socket = UdpSocket::from_std(socket.into())?;
            let channel = UdpChannel::spawn(udp_socket, queue.port())?;
            let local_addr = channel.local_addr();
            server.add_datagram_endpoint(channel, family)?;
            Ok(local_addr)
        }
    }
}

/// Starts an echo server with the given configuration: binds all addresses, posts the initial
///  accepts or receives, and starts the completion workers and the statistics reporter.
///
/// Addresses that can not be bound are skipped with a warning, as long as at least one
///  address can be bound.
pub async fn start_server(config: EchoConfig) -> anyhow::Result<RunningServer> {
    config.validate()?;
    let config = Arc::new(config);
    let bind_addrs = resolve_bind_addresses(&config).await?;

    let statistics = Arc::new(Statistics::default());
    let server = Arc::new(EchoServer::new(config.clone(), statistics.clone())?);
    let queue = Arc::new(CompletionQueue::new());
    let dispatcher = CompletionDispatcher::spawn(queue.clone(), server.clone(), config.num_workers);

    let mut local_addrs = Vec::new();
    let mut last_error = None;
    for addr in bind_addrs {
        match bind_endpoint(&server, &queue, addr) {
            Ok(local_addr) => {
                info!("{:?} echo server listening on {}", config.protocol, local_addr);
                local_addrs.push(local_addr);
            }
            Err(e) => {
                warn!("could not bind to {}: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    if local_addrs.is_empty() {
        server.shutdown();
        return Err(last_error.unwrap_or_else(|| anyhow!("no address to bind to")));
    }

    let reporter = spawn_reporter(statistics, config.statistics_interval, {
        let server = server.clone();
        move || server.gauges()
    });

    Ok(RunningServer {
        server,
        local_addrs,
        dispatcher,
        reporter,
    })
}

pub struct RunningServer {
    server: Arc<EchoServer>,
    local_addrs: Vec<SocketAddr>,
    dispatcher: CompletionDispatcher,
    reporter: JoinHandle<()>,
}

impl RunningServer {
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn server(&self) -> &Arc<EchoServer> {
        &self.server
    }

    /// Closes all sockets and waits for the aborted operations to complete, up to `timeout`.
    ///  Returns `true` if all connections were destroyed in time.
    pub async fn shutdown(mut self, timeout: Duration) -> bool {
        info!("shutting down echo server");
        self.server.shutdown();

        let deadline = Instant::now() + timeout;
        let mut drained = true;
        while self.server.connection_count() > 0 {
            if Instant::now() >= deadline {
                warn!("{} connections still alive after {:?} - giving up", self.server.connection_count(), timeout);
                drained = false;
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        self.dispatcher.shutdown();
        self.reporter.abort();
        drained
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.reporter.abort();
    }
}
