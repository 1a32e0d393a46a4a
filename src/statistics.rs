use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Throughput {
    pub read_bps: u64,
    pub sent_bps: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatisticsReport {
    pub bytes_read: u64,
    pub bytes_sent: u64,
    /// since the server was started
    pub average: Throughput,
    /// since the previous report, if at least a second has passed since then
    pub current: Option<Throughput>,
}

/// Live values that are logged with every report
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ServerGauges {
    pub connections: usize,
    pub outstanding_descriptors: usize,
}

/// Byte counters for everything the server reads and echoes. Updating them is fire-and-forget,
///  they play no part in correctness.
pub struct Statistics {
    bytes_read: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_read_last: AtomicU64,
    bytes_sent_last: AtomicU64,
    start_time: Instant,
    last_report_time: Mutex<Instant>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl Statistics {
    pub fn new(start_time: Instant) -> Statistics {
        Statistics {
            bytes_read: Default::default(),
            bytes_sent: Default::default(),
            bytes_read_last: Default::default(),
            bytes_sent_last: Default::default(),
            start_time,
            last_report_time: Mutex::new(start_time),
        }
    }

    pub fn add_bytes_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        self.bytes_read_last.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        self.bytes_sent_last.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Calculates throughput in whole seconds. Returns `None` if less than a second passed since
    ///  start. The 'current' counters are reset only if a current throughput was calculated.
    pub fn report(&self, now: Instant) -> Option<StatisticsReport> {
        let elapsed = now.saturating_duration_since(self.start_time).as_secs();
        if elapsed == 0 {
            return None;
        }

        let bytes_read = self.bytes_read();
        let bytes_sent = self.bytes_sent();
        let average = Throughput {
            read_bps: bytes_read / elapsed,
            sent_bps: bytes_sent / elapsed,
        };

        let mut last_report_time = self.last_report_time.lock().unwrap();
        let elapsed_last = now.saturating_duration_since(*last_report_time).as_secs();
        let current = if elapsed_last == 0 {
            None
        }
        else {
            *last_report_time = now;
            Some(Throughput {
                read_bps: self.bytes_read_last.swap(0, Ordering::Relaxed) / elapsed_last,
                sent_bps: self.bytes_sent_last.swap(0, Ordering::Relaxed) / elapsed_last,
            })
        };

        Some(StatisticsReport {
            bytes_read,
            bytes_sent,
            average,
            current,
        })
    }
}

/// Logs a statistics report every `report_interval` until the returned handle is aborted
pub fn spawn_reporter(
    statistics: Arc<Statistics>,
    report_interval: Duration,
    gauges: impl Fn() -> ServerGauges + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = interval(report_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticks.tick().await;

        loop {
            ticks.tick().await;

            let gauges = gauges();
            let Some(report) = statistics.report(Instant::now()) else {
                debug!("less than a second since start - no statistics yet");
                continue;
            };

            info!("average BPS sent: {} [{}], average BPS read: {} [{}]",
                report.average.sent_bps, report.bytes_sent, report.average.read_bps, report.bytes_read);
            if let Some(current) = report.current {
                info!("current BPS sent: {}, current BPS read: {}", current.sent_bps, current.read_bps);
            }
            info!("{} connections, {} outstanding descriptors", gauges.connections, gauges.outstanding_descriptors);
        }
    })
}
