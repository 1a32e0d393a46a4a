use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

/// Upper bound for the number of completion workers, regardless of the number of processors
pub const MAX_NUM_WORKERS: usize = 32;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Protocol {
    /// stream mode: a zero-byte receive is a graceful close, no peer addresses are tracked
    Tcp,
    /// datagram mode: every receive (including an empty one) is echoed to its sender
    Udp,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AddressFamily {
    V4,
    V6,
}
impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> AddressFamily {
        if addr.is_ipv4() {
            AddressFamily::V4
        }
        else {
            AddressFamily::V6
        }
    }
}

/// command line parser for address families: `4` or `6`
pub fn parse_address_family(s: &str) -> Result<AddressFamily, String> {
    match s {
        "4" => Ok(AddressFamily::V4),
        "6" => Ok(AddressFamily::V6),
        _ => Err(format!("invalid address family {} - expected 4 or 6", s)),
    }
}

/// command line parser for protocols, ignoring case
pub fn parse_protocol(s: &str) -> Result<Protocol, String> {
    match s.to_ascii_lowercase().as_str() {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        _ => Err(format!("invalid protocol {} - expected tcp or udp", s)),
    }
}

#[derive(Clone, Debug)]
pub struct EchoConfig {
    /// Local address or host name to bind to. If this is `None`, the server binds to the
    ///  wildcard address of every configured address family.
    pub bind_host: Option<String>,
    pub port: u16,
    /// restricts binding to a single address family - `None` means both
    pub address_family: Option<AddressFamily>,
    pub protocol: Protocol,

    /// This is the capacity of every receive buffer, i.e. the maximum number of bytes a single
    ///  receive can deliver (and the maximum datagram size in UDP mode)
    pub buffer_size: usize,

    /// The number of receives that are kept posted simultaneously per connection (and of
    ///  accepts per listener). Higher values keep more buffers ready for incoming data, at the
    ///  cost of more completions arriving out of order.
    pub fan_out: usize,

    pub num_workers: usize,

    /// If set, descriptor allocation fails beyond this number of live descriptors, and
    ///  connections stop posting new receives until descriptors are released
    pub max_outstanding_descriptors: Option<usize>,
    /// number of released buffers that are kept for reuse
    pub descriptor_cache_size: usize,

    pub listen_backlog: u32,
    pub statistics_interval: Duration,
}

impl EchoConfig {
    pub fn new(protocol: Protocol) -> EchoConfig {
        EchoConfig {
            bind_host: None,
            port: 5150,
            address_family: None,
            protocol,
            buffer_size: 4096,
            fan_out: 5,
            num_workers: Self::default_num_workers(),
            max_outstanding_descriptors: None,
            descriptor_cache_size: 1024,
            listen_backlog: 100,
            statistics_interval: Duration::from_secs(5),
        }
    }

    /// one worker per available processor, bounded by [MAX_NUM_WORKERS]
    pub fn default_num_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_NUM_WORKERS)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.buffer_size == 0 {
            bail!("buffer size must be positive");
        }
        if self.fan_out == 0 {
            bail!("at least one receive must be posted per connection");
        }
        if self.num_workers == 0 || self.num_workers > MAX_NUM_WORKERS {
            bail!("number of workers must be between 1 and {}, was {}", MAX_NUM_WORKERS, self.num_workers);
        }
        if let Some(limit) = self.max_outstanding_descriptors {
            // a listener or datagram endpoint must at least be able to post its initial batch
            if limit < self.fan_out {
                bail!("descriptor limit {} is smaller than the fan-out {}", limit, self.fan_out);
            }
        }
        if self.statistics_interval.is_zero() {
            bail!("statistics interval must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::tcp("tcp", Some(Protocol::Tcp))]
    #[case::udp_upper_case("UDP", Some(Protocol::Udp))]
    #[case::unknown("sctp", None)]
    fn test_parse_protocol(#[case] s: &str, #[case] expected: Option<Protocol>) {
        assert_eq!(parse_protocol(s).ok(), expected);
    }

    #[test]
    fn test_parse_address_family() {
        assert_eq!(parse_address_family("4"), Ok(AddressFamily::V4));
        assert_eq!(parse_address_family("6"), Ok(AddressFamily::V6));
        assert!(parse_address_family("5").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = EchoConfig::new(Protocol::Tcp);
        assert_eq!(config.port, 5150);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.fan_out, 5);
        assert!(config.num_workers >= 1 && config.num_workers <= MAX_NUM_WORKERS);
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::zero_buffer(|c: &mut EchoConfig| c.buffer_size = 0)]
    #[case::zero_fan_out(|c: &mut EchoConfig| c.fan_out = 0)]
    #[case::zero_workers(|c: &mut EchoConfig| c.num_workers = 0)]
    #[case::too_many_workers(|c: &mut EchoConfig| c.num_workers = MAX_NUM_WORKERS + 1)]
    #[case::limit_below_fan_out(|c: &mut EchoConfig| c.max_outstanding_descriptors = Some(2))]
    #[case::zero_interval(|c: &mut EchoConfig| c.statistics_interval = Duration::ZERO)]
    fn test_validate_rejects(#[case] modify: fn(&mut EchoConfig)) {
        let mut config = EchoConfig::new(Protocol::Udp);
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_address_family() {
        assert_eq!(AddressFamily::of(&"1.2.3.4:5".parse().unwrap()), AddressFamily::V4);
        assert_eq!(AddressFamily::of(&"[::1]:5".parse().unwrap()), AddressFamily::V6);
    }
}
