use std::future::Future;
use std::io;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio::net::TcpStream;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_PROBE_TARGETS: [&str; 5] = [
    "1.1.1.1:53",
    "64.6.64.6:53",
    "8.8.8.8:53",
    "208.67.222.222:53",
    "9.9.9.9:53",
];
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Clone, Debug, Eq, Hash, PartialEq, EncodeLabelSet)]
pub struct ProbeLabels {
    pub addr: String,
}

fn duration_histogram() -> Histogram {
    Histogram::new(DURATION_BUCKETS.into_iter())
}

#[derive(Clone, Debug)]
pub struct ProbeMetrics {
    duration: Family<ProbeLabels, Histogram, fn() -> Histogram>,
    is_up: Family<ProbeLabels, Gauge<f64, AtomicU64>>,
}

impl Default for ProbeMetrics {
    fn default() -> Self {
        Self {
            duration: Family::new_with_constructor(duration_histogram),
            is_up: Family::default(),
        }
    }
}

impl ProbeMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "router_monitor_internet_connection_duration_seconds",
            "Time spent connecting to a well-known internet address",
            self.duration.clone(),
        );
        registry.register(
            "router_monitor_internet_connection_is_up",
            "Whether the last connection attempt to the address succeeded",
            self.is_up.clone(),
        );
    }
}

/// Opens a connection to `host:port` and drops it.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, addr: &str) -> impl Future<Output = io::Result<()>> + Send;
}

pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, addr: &str) -> impl Future<Output = io::Result<()>> + Send {
        let addr = addr.to_string();
        async move { TcpStream::connect(addr).await.map(drop) }
    }
}

/// Background loop dialling a fixed list of addresses, one after the other.
pub struct ReachabilityProbe<D = TcpDialer> {
    dialer: D,
    targets: Vec<String>,
    interval: Duration,
    timeout: Duration,
    metrics: ProbeMetrics,
}

impl ReachabilityProbe {
    pub fn new(
        targets: Vec<String>,
        interval: Duration,
        timeout: Duration,
        metrics: ProbeMetrics,
    ) -> Self {
        Self::with_dialer(TcpDialer, targets, interval, timeout, metrics)
    }
}

impl<D: Dialer> ReachabilityProbe<D> {
    pub fn with_dialer(
        dialer: D,
        targets: Vec<String>,
        interval: Duration,
        timeout: Duration,
        metrics: ProbeMetrics,
    ) -> Self {
        Self {
            dialer,
            targets,
            interval: interval.max(Duration::from_secs(1)),
            timeout: timeout.max(Duration::from_millis(1)),
            metrics,
        }
    }

    /// Probe on every tick until `token` is cancelled. The first tick fires
    /// immediately.
    pub async fn run(self, token: CancellationToken) {
        info!(
            targets = self.targets.len(),
            interval = ?self.interval,
            "checking if internet connection is up"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.probe_round() => {}
            }
        }
        debug!("reachability probe stopped");
    }

    /// Dial every target in order. Returns how many were reachable.
    pub async fn probe_round(&self) -> usize {
        let mut up = 0;
        for addr in &self.targets {
            let started = Instant::now();
            let connect = self.dialer.dial(addr);
            let reachable = match tokio::time::timeout(self.timeout, connect).await {
                Ok(Ok(_)) => true,
                Ok(Err(err)) => {
                    warn!(addr = %addr, error = %err, "failed to connect");
                    false
                }
                Err(_) => {
                    warn!(addr = %addr, timeout = ?self.timeout, "connect timed out");
                    false
                }
            };

            let labels = ProbeLabels { addr: addr.clone() };
            self.metrics
                .duration
                .get_or_create(&labels)
                .observe(started.elapsed().as_secs_f64());
            self.metrics
                .is_up
                .get_or_create(&labels)
                .set(if reachable { 1.0 } else { 0.0 });
            if reachable {
                up += 1;
            }
        }
        up
    }
}
