use std::fmt::Display;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::ValueEnum;
use prometheus_client::collector::Collector;
use prometheus_client::encoding::{DescriptorEncoder, EncodeLabelSet, EncodeMetric};
use prometheus_client::metrics::gauge::ConstGauge;
use prometheus_client::metrics::MetricType;
use prometheus_client::registry::Registry;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use crate::dns::{build_chaos_txt_query, parse_txt_reply, ParsedReply, TxtRecord};
use crate::error::DnsmasqError;
use crate::leases::{read_leases, LeaseRecord};

pub const SERVERS_BIND: &str = "servers.bind.";

/// Single-value statistics: (record name, metric name, help).
pub const STAT_RECORDS: [(&str, &str, &str); 6] = [
    ("cachesize.bind.", "dnsmasq_cachesize", "configured size of the DNS cache"),
    ("insertions.bind.", "dnsmasq_insertions", "DNS cache insertions"),
    (
        "evictions.bind.",
        "dnsmasq_evictions",
        "DNS cache evictions: numbers of entries which replaced an unexpired cache entry",
    ),
    (
        "misses.bind.",
        "dnsmasq_misses",
        "DNS cache misses: queries which had to be forwarded",
    ),
    ("hits.bind.", "dnsmasq_hits", "DNS queries answered locally (cache hits)"),
    ("auth.bind.", "dnsmasq_auth", "DNS queries for authoritative zones"),
];

const SERVER_FIELDS: usize = 3;
const MAX_UDP_REPLY: usize = 65_535;

/// What a failed sub-task does to the scrape.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum FailurePolicy {
    /// The whole scrape fails.
    #[default]
    FailScrape,
    /// Only the failed side's series disappear.
    OmitSeries,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerStat {
    pub server: String,
    pub queries: f64,
    pub queries_failed: f64,
}

impl Display for ServerStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "server={}\tqueries={}\tqueries_failed={}",
            self.server, self.queries, self.queries_failed
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheStats {
    /// Keyed by record name, in answer order.
    pub values: Vec<(&'static str, f64)>,
    pub servers: Vec<ServerStat>,
}

impl CacheStats {
    pub fn value(&self, record: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(name, _)| *name == record)
            .map(|(_, v)| *v)
    }

    /// A server listed twice keeps its last counters.
    fn add_server(&mut self, stat: ServerStat) {
        match self.servers.iter_mut().find(|s| s.server == stat.server) {
            Some(existing) => *existing = stat,
            None => self.servers.push(stat),
        }
    }
}

/// Turn the TXT answers of a stats exchange into numbers.
pub fn parse_stats(answers: &[TxtRecord]) -> Result<CacheStats, DnsmasqError> {
    let mut stats = CacheStats::default();
    for answer in answers {
        if answer.name == SERVERS_BIND {
            for line in &answer.txt {
                stats.add_server(parse_server_line(line)?);
            }
            continue;
        }

        let Some((record, _, _)) = STAT_RECORDS.iter().find(|(r, _, _)| *r == answer.name) else {
            debug!(record = %answer.name, "ignoring unknown stats record");
            continue;
        };
        if answer.txt.len() != 1 {
            return Err(DnsmasqError::ReplyCount {
                record: answer.name.clone(),
                got: answer.txt.len(),
            });
        }
        stats.values.push((*record, parse_number(record, &answer.txt[0])?));
    }
    Ok(stats)
}

fn parse_server_line(line: &str) -> Result<ServerStat, DnsmasqError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != SERVER_FIELDS {
        return Err(DnsmasqError::FieldCount {
            record: SERVERS_BIND.to_string(),
            got: fields.len(),
            want: SERVER_FIELDS,
        });
    }
    Ok(ServerStat {
        server: fields[0].to_string(),
        queries: parse_number(SERVERS_BIND, fields[1])?,
        queries_failed: parse_number(SERVERS_BIND, fields[2])?,
    })
}

fn parse_number(record: &str, value: &str) -> Result<f64, DnsmasqError> {
    value.parse::<f64>().map_err(|source| DnsmasqError::Number {
        record: record.to_string(),
        value: value.to_string(),
        source,
    })
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, EncodeLabelSet)]
struct ServerLabels {
    server: String,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, EncodeLabelSet)]
struct LeaseLabels {
    mac: String,
    ip: String,
    devicename: String,
}

#[derive(Debug, Default)]
struct DnsmasqSnapshot {
    stats: Option<CacheStats>,
    leases: Option<Vec<LeaseRecord>>,
}

/// Series fed by the dnsmasq collector. `None` on either side means that
/// side has no series in the next document.
#[derive(Clone, Debug, Default)]
pub struct DnsmasqMetrics {
    snapshot: Arc<Mutex<DnsmasqSnapshot>>,
}

impl DnsmasqMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register_collector(Box::new(self.clone()));
    }

    fn set_stats(&self, stats: Option<CacheStats>) {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats = stats;
    }

    fn set_leases(&self, leases: Option<Vec<LeaseRecord>>) {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .leases = leases;
    }
}

impl Collector for DnsmasqMetrics {
    fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), std::fmt::Error> {
        let snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(stats) = &snapshot.stats {
            for (record, metric, help) in STAT_RECORDS {
                if let Some(value) = stats.value(record) {
                    let gauge = ConstGauge::new(value);
                    gauge.encode(encoder.encode_descriptor(metric, help, None, MetricType::Gauge)?)?;
                }
            }
            encode_servers(
                &mut encoder,
                "dnsmasq_servers_queries",
                "DNS queries on upstream server",
                &stats.servers,
                |s| s.queries,
            )?;
            encode_servers(
                &mut encoder,
                "dnsmasq_servers_queries_failed",
                "DNS queries failed on upstream server",
                &stats.servers,
                |s| s.queries_failed,
            )?;
        }

        if let Some(leases) = &snapshot.leases {
            let count = ConstGauge::new(leases.len() as i64);
            count.encode(encoder.encode_descriptor(
                "dnsmasq_leases",
                "Number of DHCP leases handed out",
                None,
                MetricType::Gauge,
            )?)?;

            let mut family = encoder.encode_descriptor(
                "dnsmasq_lease_info",
                "DHCP leases handed out, valued by expiry in unix seconds",
                None,
                MetricType::Gauge,
            )?;
            for lease in leases {
                let labels = LeaseLabels {
                    mac: lease.mac.clone(),
                    ip: lease.ip.clone(),
                    devicename: lease.devicename().to_string(),
                };
                ConstGauge::new(lease.expiry).encode(family.encode_family(&labels)?)?;
            }
        }
        Ok(())
    }
}

fn encode_servers(
    encoder: &mut DescriptorEncoder,
    name: &str,
    help: &str,
    servers: &[ServerStat],
    value: fn(&ServerStat) -> f64,
) -> Result<(), std::fmt::Error> {
    let mut family = encoder.encode_descriptor(name, help, None, MetricType::Gauge)?;
    for stat in servers {
        let labels = ServerLabels {
            server: stat.server.clone(),
        };
        ConstGauge::new(value(stat)).encode(family.encode_family(&labels)?)?;
    }
    Ok(())
}

pub struct DnsmasqConfig {
    pub addr: String,
    pub leases_path: PathBuf,
    pub timeout: Duration,
    pub policy: FailurePolicy,
}

/// Speaks the CHAOS/TXT statistics protocol to one resolver.
#[derive(Clone, Debug)]
pub struct StatsClient {
    addr: String,
    timeout: Duration,
}

impl StatsClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout: timeout.max(Duration::from_millis(1)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn query_stats(&self) -> Result<CacheStats, DnsmasqError> {
        let mut names: Vec<&str> = STAT_RECORDS.iter().map(|(r, _, _)| *r).collect();
        names.push(SERVERS_BIND);

        let id = rand::random::<u16>();
        let query = build_chaos_txt_query(id, &names);
        let reply = self.exchange(id, &query).await?;
        parse_stats(&reply.answers)
    }

    async fn exchange(&self, id: u16, query: &[u8]) -> Result<ParsedReply, DnsmasqError> {
        let io_err = |source| DnsmasqError::Io {
            addr: self.addr.clone(),
            source,
        };
        let server = tokio::net::lookup_host(self.addr.as_str())
            .await
            .map_err(io_err)?
            .next()
            .ok_or_else(|| io_err(io::Error::new(io::ErrorKind::NotFound, "no address")))?;

        let payload = self.bounded(udp_exchange(server, query)).await?;
        let mut reply = check_id(parse_txt_reply(&payload)?, id)?;
        if reply.truncated {
            debug!(server = %server, "udp reply truncated, retrying over tcp");
            let payload = self.bounded(tcp_exchange(server, query)).await?;
            reply = check_id(parse_txt_reply(&payload)?, id)?;
        }
        Ok(reply)
    }

    async fn bounded<F>(&self, exchange: F) -> Result<Vec<u8>, DnsmasqError>
    where
        F: Future<Output = io::Result<Vec<u8>>>,
    {
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(source)) => Err(DnsmasqError::Io {
                addr: self.addr.clone(),
                source,
            }),
            Err(_) => Err(DnsmasqError::Timeout {
                addr: self.addr.clone(),
                timeout: self.timeout,
            }),
        }
    }
}

/// Queries dnsmasq's CHAOS/TXT statistics and reads its lease file.
pub struct DnsmasqCollector {
    client: StatsClient,
    leases_path: PathBuf,
    policy: FailurePolicy,
    metrics: DnsmasqMetrics,
}

impl DnsmasqCollector {
    pub fn new(cfg: DnsmasqConfig, metrics: DnsmasqMetrics) -> Self {
        Self {
            client: StatsClient::new(cfg.addr, cfg.timeout),
            leases_path: cfg.leases_path,
            policy: cfg.policy,
            metrics,
        }
    }

    pub fn register(&self, registry: &mut Registry) {
        self.metrics.register(registry);
    }

    /// Run both sub-tasks concurrently. Metrics are only touched once both
    /// have finished.
    pub async fn collect(&self) -> Result<(), DnsmasqError> {
        match self.policy {
            FailurePolicy::FailScrape => {
                let (stats, leases) =
                    tokio::try_join!(self.client.query_stats(), read_leases(&self.leases_path))?;
                self.metrics.set_stats(Some(stats));
                self.metrics.set_leases(Some(leases));
            }
            FailurePolicy::OmitSeries => {
                let (stats, leases) =
                    tokio::join!(self.client.query_stats(), read_leases(&self.leases_path));
                let stats = match stats {
                    Ok(stats) => Some(stats),
                    Err(err) => {
                        warn!(
                            addr = %self.client.addr(),
                            error = %err,
                            "omitting dnsmasq stats series"
                        );
                        None
                    }
                };
                let leases = match leases {
                    Ok(leases) => Some(leases),
                    Err(err) => {
                        warn!(
                            path = %self.leases_path.display(),
                            error = %err,
                            "omitting dnsmasq lease series"
                        );
                        None
                    }
                };
                self.metrics.set_stats(stats);
                self.metrics.set_leases(leases);
            }
        }
        Ok(())
    }
}

fn check_id(reply: ParsedReply, want: u16) -> Result<ParsedReply, DnsmasqError> {
    if reply.id != want {
        return Err(DnsmasqError::IdMismatch { got: reply.id, want });
    }
    Ok(reply)
}

async fn udp_exchange(server: SocketAddr, query: &[u8]) -> io::Result<Vec<u8>> {
    let local: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(server).await?;
    socket.send(query).await?;

    let mut buf = vec![0u8; MAX_UDP_REPLY];
    let n = socket.recv(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

async fn tcp_exchange(server: SocketAddr, query: &[u8]) -> io::Result<Vec<u8>> {
    let mut stream = TcpStream::connect(server).await?;
    let mut framed = Vec::with_capacity(query.len() + 2);
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(query);
    stream.write_all(&framed).await?;

    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len))];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
