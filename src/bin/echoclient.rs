use std::time::Duration;
use anyhow::anyhow;
use clap::Parser;
use echoport::client::{run_client, ClientConfig};
use echoport::config::{parse_address_family, parse_protocol, AddressFamily, Protocol};
use tokio::net::lookup_host;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(about = "Echo client that checks every echoed byte against what it sent")]
struct Args {
    /// address family to connect with: 4 or 6 (default: whatever the name resolves to first)
    #[clap(short = 'a', long, value_parser = parse_address_family)]
    address_family: Option<AddressFamily>,

    /// size of every send in bytes
    #[clap(short = 'b', long, default_value_t = 4096)]
    buffer_size: usize,

    /// number of connections to open
    #[clap(short = 'c', long, default_value_t = 10)]
    connections: usize,

    /// server port
    #[clap(short = 'e', long, default_value_t = 5150)]
    port: u16,

    /// server address or host name
    #[clap(short = 'n', long, default_value = "localhost")]
    server: String,

    /// datagrams sent ahead of their echoes (udp only)
    #[clap(short = 'o', long, default_value_t = 5)]
    in_flight: usize,

    /// tcp or udp
    #[clap(short = 'p', long, value_parser = parse_protocol, default_value = "tcp")]
    protocol: Protocol,

    /// seconds to wait for an echo
    #[clap(short = 't', long, default_value_t = 5)]
    timeout: u64,

    /// sends per connection
    #[clap(short = 'x', long, default_value_t = 100)]
    sends: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let server_addr = lookup_host((args.server.as_str(), args.port)).await?
        .find(|addr| args.address_family.map(|f| f == AddressFamily::of(addr)).unwrap_or(true))
        .ok_or_else(|| anyhow!("{} has no address for address family {:?}", args.server, args.address_family))?;

    let mut config = ClientConfig::new(server_addr, args.protocol);
    config.num_connections = args.connections;
    config.buffer_size = args.buffer_size;
    config.num_sends = args.sends;
    config.in_flight = args.in_flight;
    config.echo_timeout = Duration::from_secs(args.timeout);

    let report = run_client(config).await?;
    info!("{} connections: {} bytes sent, {} bytes echoed", report.connections, report.bytes_sent, report.bytes_read);
    if report.lost > 0 || report.out_of_order > 0 {
        warn!("{} datagrams lost, {} echoed out of order", report.lost, report.out_of_order);
    }
    Ok(())
}
