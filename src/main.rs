use std::time::Duration;
use clap::Parser;
use echoport::config::{parse_address_family, parse_protocol, AddressFamily, EchoConfig, Protocol};
use echoport::net::endpoint::start_server;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(about = "TCP / UDP echo server with several receives in flight per connection")]
struct Args {
    /// address family to bind to: 4 or 6 (default: both)
    #[clap(short = 'a', long, value_parser = parse_address_family)]
    address_family: Option<AddressFamily>,

    /// receive buffer size in bytes
    #[clap(short = 'b', long, default_value_t = 4096)]
    buffer_size: usize,

    /// port to listen on
    #[clap(short = 'e', long, default_value_t = 5150)]
    port: u16,

    /// local address or host name to bind to (default: wildcard)
    #[clap(short = 'l', long)]
    local_address: Option<String>,

    /// receives posted simultaneously per connection (and accepts per listener)
    #[clap(short = 'o', long, default_value_t = 5)]
    fan_out: usize,

    /// tcp or udp
    #[clap(short = 'p', long, value_parser = parse_protocol, default_value = "tcp")]
    protocol: Protocol,

    /// number of completion workers (default: one per processor)
    #[clap(short = 'w', long)]
    workers: Option<usize>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

impl Args {
    fn to_config(&self) -> EchoConfig {
        let mut config = EchoConfig::new(self.protocol);
        config.address_family = self.address_family;
        config.buffer_size = self.buffer_size;
        config.port = self.port;
        config.bind_host = self.local_address.clone();
        config.fan_out = self.fan_out;
        if let Some(workers) = self.workers {
            config.num_workers = workers;
        }
        config
    }
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let config = args.to_config();
    config.validate()?;

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.num_workers)
        .enable_all()
        .build()?
        .block_on(run(config))
}

async fn run(config: EchoConfig) -> anyhow::Result<()> {
    let running = start_server(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C");

    if !running.shutdown(Duration::from_secs(5)).await {
        warn!("not all connections were closed cleanly");
    }
    Ok(())
}
