//! A load-generating echo client. It opens a number of connections (or UDP sockets) to an echo
//!  server, sends a known byte pattern on each and checks that every echoed byte comes back
//!  unchanged and in order.
//!
//! On TCP the pattern is a function of the byte's offset in the stream. On UDP every datagram
//!  starts with its index, followed by a pattern derived from that index, so that lost and
//!  reordered echoes can be told apart from corrupted ones.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use crate::config::Protocol;
use crate::statistics::Statistics;

const DATAGRAM_INDEX_LEN: usize = 8;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub protocol: Protocol,
    pub num_connections: usize,
    /// size of every send, and of every datagram
    pub buffer_size: usize,
    /// sends per connection, or datagrams per UDP socket
    pub num_sends: usize,
    /// datagrams that are sent ahead of their echoes (UDP only)
    pub in_flight: usize,
    /// how long to wait for an echo before giving up on it
    pub echo_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr, protocol: Protocol) -> ClientConfig {
        ClientConfig {
            server_addr,
            protocol,
            num_connections: 1,
            buffer_size: 4096,
            num_sends: 100,
            in_flight: 5,
            echo_timeout: Duration::from_secs(5),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_connections == 0 {
            bail!("number of connections must be at least 1");
        }
        if self.buffer_size == 0 {
            bail!("buffer size must be at least 1");
        }
        if self.protocol == Protocol::Udp && self.buffer_size < DATAGRAM_INDEX_LEN {
            bail!("datagrams must have at least {} bytes to hold their index", DATAGRAM_INDEX_LEN);
        }
        if self.in_flight == 0 {
            bail!("number of datagrams in flight must be at least 1");
        }
        Ok(())
    }
}

/// The outcome of a client run, summed up over all connections
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClientReport {
    pub connections: usize,
    pub bytes_sent: u64,
    pub bytes_read: u64,
    /// datagrams whose echo did not arrive in time
    pub lost: u64,
    /// datagrams whose echo arrived after that of a datagram sent later
    pub out_of_order: u64,
}

impl ClientReport {
    fn add(&mut self, other: &ClientReport) {
        self.connections += other.connections;
        self.bytes_sent += other.bytes_sent;
        self.bytes_read += other.bytes_read;
        self.lost += other.lost;
        self.out_of_order += other.out_of_order;
    }
}

/// Runs all connections to completion. Fails if any TCP echo differs from what was sent, or if
///  any echoed datagram is corrupted.
pub async fn run_client(config: ClientConfig) -> anyhow::Result<ClientReport> {
    config.validate()?;
    let config = Arc::new(config);
    let statistics = Arc::new(Statistics::default());

    info!("{:?} echo client: {} connections to {}", config.protocol, config.num_connections, config.server_addr);

    let mut tasks = JoinSet::new();
    for _ in 0..config.num_connections {
        let config = config.clone();
        let statistics = statistics.clone();
        tasks.spawn(async move {
            match config.protocol {
                Protocol::Tcp => echo_stream(&config, &statistics).await,
                Protocol::Udp => echo_datagrams(&config, &statistics).await,
            }
        });
    }

    let mut report = ClientReport::default();
    while let Some(result) = tasks.join_next().await {
        report.add(&result??);
    }

    if let Some(throughput) = statistics.report(Instant::now()) {
        info!("average BPS sent: {} [{}], average BPS read: {} [{}]",
            throughput.average.sent_bps, throughput.bytes_sent, throughput.average.read_bps, throughput.bytes_read);
    }
    Ok(report)
}

fn pattern_byte(n: usize) -> u8 {
    (n % 251) as u8
}

/// offset of the first byte that does not match the pattern, if any
fn first_mismatch(data: &[u8], offset: usize) -> Option<usize> {
    data.iter()
        .enumerate()
        .find(|(i, b)| **b != pattern_byte(offset + i))
        .map(|(i, _)| offset + i)
}

async fn echo_stream(config: &ClientConfig, statistics: &Arc<Statistics>) -> anyhow::Result<ClientReport> {
    let stream = TcpStream::connect(config.server_addr).await
        .with_context(|| format!("connecting to {}", config.server_addr))?;
    debug!("connected to {} from {}", config.server_addr, stream.local_addr()?);
    let (mut read_half, mut write_half) = stream.into_split();
    let total = config.buffer_size * config.num_sends;

    let writer = {
        let buffer_size = config.buffer_size;
        let num_sends = config.num_sends;
        let statistics = statistics.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; buffer_size];
            for n in 0..num_sends {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = pattern_byte(n * buffer_size + i);
                }
                write_half.write_all(&buf).await?;
                statistics.add_bytes_sent(buf.len());
            }
            write_half.shutdown().await
        })
    };

    let mut buf = vec![0u8; config.buffer_size];
    let mut offset = 0;
    loop {
        let n = timeout(config.echo_timeout, read_half.read(&mut buf)).await
            .map_err(|_| anyhow!("no echo from {} after {} of {} bytes", config.server_addr, offset, total))??;
        if n == 0 {
            break;
        }
        if let Some(pos) = first_mismatch(&buf[..n], offset) {
            bail!("echo from {} differs from what was sent at byte {}", config.server_addr, pos);
        }
        offset += n;
        statistics.add_bytes_read(n);
    }
    writer.await??;

    if offset != total {
        bail!("{} closed the connection after echoing {} of {} bytes", config.server_addr, offset, total);
    }
    Ok(ClientReport {
        connections: 1,
        bytes_sent: total as u64,
        bytes_read: offset as u64,
        ..Default::default()
    })
}

fn fill_datagram(buf: &mut [u8], index: u64) {
    buf[..DATAGRAM_INDEX_LEN].copy_from_slice(&index.to_be_bytes());
    for (i, b) in buf[DATAGRAM_INDEX_LEN..].iter_mut().enumerate() {
        *b = pattern_byte(index as usize + i);
    }
}

/// the index of an echoed datagram, after checking that its contents are intact
fn check_datagram(data: &[u8], expected_len: usize) -> anyhow::Result<u64> {
    if data.len() != expected_len {
        bail!("echoed datagram has {} bytes, expected {}", data.len(), expected_len);
    }
    let mut raw_index = [0u8; DATAGRAM_INDEX_LEN];
    raw_index.copy_from_slice(&data[..DATAGRAM_INDEX_LEN]);
    let index = u64::from_be_bytes(raw_index);

    if let Some(pos) = first_mismatch(&data[DATAGRAM_INDEX_LEN..], index as usize) {
        bail!("echoed datagram {} is corrupted at byte {}", index, pos - index as usize + DATAGRAM_INDEX_LEN);
    }
    Ok(index)
}

/// Counts echoed datagrams against the ones that were sent. An echo that skips ahead counts the
///  skipped datagrams as lost; if one of them shows up later, it is counted as out of order
///  instead.
#[derive(Default)]
struct DatagramTracker {
    next_send: u64,
    next_expected: u64,
    lost: u64,
    out_of_order: u64,
}

impl DatagramTracker {
    fn in_flight(&self) -> u64 {
        self.next_send - self.next_expected
    }

    fn on_echo(&mut self, index: u64) {
        if index >= self.next_send {
            warn!("echo for datagram {} that was never sent", index);
        }
        else if index >= self.next_expected {
            self.lost += index - self.next_expected;
            self.next_expected = index + 1;
        }
        else {
            self.out_of_order += 1;
            self.lost = self.lost.saturating_sub(1);
        }
    }

    fn on_timeout(&mut self) {
        self.lost += self.in_flight();
        self.next_expected = self.next_send;
    }
}

async fn echo_datagrams(config: &ClientConfig, statistics: &Arc<Statistics>) -> anyhow::Result<ClientReport> {
    let local_ip = match config.server_addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
    socket.connect(config.server_addr).await?;
    debug!("sending datagrams to {} from {}", config.server_addr, socket.local_addr()?);

    let mut report = ClientReport {
        connections: 1,
        ..Default::default()
    };
    let mut tracker = DatagramTracker::default();
    let num_sends = config.num_sends as u64;
    let mut send_buf = vec![0u8; config.buffer_size];
    // one spare byte to detect echoes that are longer than what was sent
    let mut recv_buf = vec![0u8; config.buffer_size + 1];

    while tracker.next_send < num_sends || tracker.in_flight() > 0 {
        while tracker.next_send < num_sends && tracker.in_flight() < config.in_flight as u64 {
            fill_datagram(&mut send_buf, tracker.next_send);
            let n = socket.send(&send_buf).await?;
            statistics.add_bytes_sent(n);
            report.bytes_sent += n as u64;
            tracker.next_send += 1;
        }

        match timeout(config.echo_timeout, socket.recv(&mut recv_buf)).await {
            Ok(received) => {
                let n = received?;
                let index = check_datagram(&recv_buf[..n], config.buffer_size)?;
                statistics.add_bytes_read(n);
                report.bytes_read += n as u64;
                tracker.on_echo(index);
            }
            Err(_) => {
                warn!("{} datagrams to {} not echoed within {:?}", tracker.in_flight(), config.server_addr, config.echo_timeout);
                tracker.on_timeout();
            }
        }
    }

    report.lost = tracker.lost;
    report.out_of_order = tracker.out_of_order;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::net::TcpListener;
    use super::*;
    use crate::config::EchoConfig;
    use crate::net::endpoint::start_server;

    fn local_server_config(protocol: Protocol) -> EchoConfig {
        let mut config = EchoConfig::new(protocol);
        config.bind_host = Some("127.0.0.1".to_string());
        config.port = 0;
        config.num_workers = 4;
        config
    }

    #[test]
    fn test_first_mismatch() {
        let data = (10..20).map(pattern_byte).collect::<Vec<_>>();
        assert_eq!(first_mismatch(&data, 10), None);
        assert_eq!(first_mismatch(&data, 11), Some(11));

        let mut corrupted = data.clone();
        corrupted[7] ^= 0xff;
        assert_eq!(first_mismatch(&corrupted, 10), Some(17));
    }

    #[test]
    fn test_check_datagram() {
        let mut buf = vec![0u8; 32];
        fill_datagram(&mut buf, 300);
        assert_eq!(check_datagram(&buf, 32).unwrap(), 300);
        assert!(check_datagram(&buf[..31], 32).is_err());

        buf[20] ^= 1;
        assert!(check_datagram(&buf, 32).is_err());
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3], 0, 0)]
    #[case::lost(vec![0, 2, 3], 1, 0)]
    #[case::late(vec![0, 2, 1, 3], 0, 1)]
    fn test_datagram_tracker(#[case] echoes: Vec<u64>, #[case] lost: u64, #[case] out_of_order: u64) {
        let mut tracker = DatagramTracker::default();
        tracker.next_send = 4;
        for index in echoes {
            tracker.on_echo(index);
        }
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.lost, lost);
        assert_eq!(tracker.out_of_order, out_of_order);
    }

    #[test]
    fn test_datagram_tracker_timeout() {
        let mut tracker = DatagramTracker::default();
        tracker.next_send = 5;
        tracker.on_echo(0);
        tracker.on_timeout();
        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.lost, 4);
    }

    #[rstest]
    #[case::no_connections(|c: &mut ClientConfig| c.num_connections = 0)]
    #[case::empty_buffer(|c: &mut ClientConfig| c.buffer_size = 0)]
    #[case::no_in_flight(|c: &mut ClientConfig| c.in_flight = 0)]
    #[case::datagram_without_index(|c: &mut ClientConfig| { c.protocol = Protocol::Udp; c.buffer_size = 4; })]
    fn test_validate_rejects(#[case] change: fn(&mut ClientConfig)) {
        let mut config = ClientConfig::new("127.0.0.1:5150".parse().unwrap(), Protocol::Tcp);
        assert!(config.validate().is_ok());
        change(&mut config);
        assert!(config.validate().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tcp_client_against_server() {
        let mut server_config = local_server_config(Protocol::Tcp);
        server_config.buffer_size = 64;
        server_config.fan_out = 8;
        let running = start_server(server_config).await.unwrap();

        let mut config = ClientConfig::new(running.local_addrs()[0], Protocol::Tcp);
        config.num_connections = 3;
        config.buffer_size = 1000;
        config.num_sends = 20;

        let report = run_client(config).await.unwrap();
        assert_eq!(report, ClientReport {
            connections: 3,
            bytes_sent: 60_000,
            bytes_read: 60_000,
            lost: 0,
            out_of_order: 0,
        });

        assert!(running.shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_udp_client_against_server() {
        let running = start_server(local_server_config(Protocol::Udp)).await.unwrap();

        let mut config = ClientConfig::new(running.local_addrs()[0], Protocol::Udp);
        config.num_connections = 2;
        config.buffer_size = 100;
        config.num_sends = 30;
        config.in_flight = 3;

        let report = run_client(config).await.unwrap();
        assert_eq!(report.connections, 2);
        assert_eq!(report.bytes_sent, 6_000);
        // loopback may drop datagrams under load, but never corrupts them
        assert_eq!(report.bytes_read + report.lost * 100, 6_000);

        assert!(running.shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_tcp_client_fails_if_server_does_not_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // accept and hang up without echoing anything
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let mut config = ClientConfig::new(addr, Protocol::Tcp);
        config.buffer_size = 10;
        config.num_sends = 3;
        config.echo_timeout = Duration::from_secs(2);
        assert!(run_client(config).await.is_err());
    }
}
