use std::fmt::Display;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, warn};

use crate::hostname::HostnameCache;

pub const DEFAULT_ARP_FILE: &str = "/proc/net/arp";

const ARP_FIELDS: usize = 6;
const INCOMPLETE_HW_ADDR: &str = "00:00:00:00:00:00";

#[derive(Clone, Debug, Eq, Hash, PartialEq, EncodeLabelSet)]
pub struct ArpLabels {
    pub ip_addr: String,
    pub hw_addr: String,
    pub hostname: String,
    pub device: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArpEntry {
    /// As the kernel wrote it.
    pub ip: String,
    pub hw_addr: String,
    pub hostname: String,
    pub device: String,
    pub flags: i64,
}

impl Display for ArpEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\tdevice={}\tflags={:#x}",
            self.ip, self.hw_addr, self.hostname, self.device, self.flags
        )
    }
}

/// Fields of one complete `/proc/net/arp` row, before hostname resolution.
#[derive(Debug, Eq, PartialEq)]
struct ArpLine<'a> {
    ip: &'a str,
    flags: i64,
    hw_addr: &'a str,
    device: &'a str,
}

/// `ip hwtype flags hwaddr mask device`. Returns `None` for the header,
/// incomplete entries and anything else that is not a usable row.
fn parse_arp_line(line: &str) -> Option<ArpLine<'_>> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != ARP_FIELDS {
        return None;
    }
    let hw_addr = fields[3];
    if hw_addr == INCOMPLETE_HW_ADDR {
        return None;
    }
    let ip = fields[0];
    let flags = parse_int_auto(fields[2]).unwrap_or_else(|| {
        warn!(ip = %ip, flags = fields[2], "unparseable arp flags, using 0");
        0
    });

    Some(ArpLine {
        ip,
        flags,
        hw_addr,
        device: fields[5],
    })
}

/// Integer with its base taken from the prefix: `0x` hex, `0o` or a bare
/// leading `0` octal, `0b` binary, decimal otherwise.
fn parse_int_auto(s: &str) -> Option<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let digits = digits.replace('_', "");
    let lower = digits.to_ascii_lowercase();

    let (radix, body) = if let Some(rest) = lower.strip_prefix("0x") {
        (16, rest)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (8, rest)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (2, rest)
    } else if lower.len() > 1 && lower.starts_with('0') {
        (8, &lower[1..])
    } else {
        (10, lower.as_str())
    };
    if body.is_empty() || body.starts_with(['+', '-']) {
        return None;
    }

    let value = i64::from_str_radix(body, radix).ok()?;
    Some(if negative { -value } else { value })
}

/// Reads the kernel ARP table and exports one gauge per known device,
/// valued by the ARP flags.
pub struct ArpTableReader {
    path: PathBuf,
    hosts: Arc<HostnameCache>,
    devices: Family<ArpLabels, Gauge>,
}

impl ArpTableReader {
    pub fn new(path: impl Into<PathBuf>, hosts: Arc<HostnameCache>) -> Self {
        Self {
            path: path.into(),
            hosts,
            devices: Family::default(),
        }
    }

    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "router_monitor_arp_devices",
            "Devices in the ARP table, valued by their ARP flags",
            self.devices.clone(),
        );
    }

    /// Parse the table and resolve hostnames. A file that cannot be read
    /// yields no entries.
    pub async fn read(&self) -> Vec<ArpEntry> {
        let file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) => {
                error!(path = %self.path.display(), error = %err, "failed to open arp table");
                return Vec::new();
            }
        };

        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    error!(path = %self.path.display(), error = %err, "failed to read arp table");
                    return Vec::new();
                }
            };
            let Some(row) = parse_arp_line(&line) else {
                continue;
            };
            let hostname = match row.ip.parse::<IpAddr>() {
                Ok(ip) => self.hosts.resolve(ip).await,
                Err(err) => {
                    debug!(ip = row.ip, error = %err, "arp address not resolvable");
                    format!("unknown:{}", row.ip)
                }
            };
            entries.push(ArpEntry {
                ip: row.ip.to_string(),
                hw_addr: row.hw_addr.to_string(),
                hostname,
                device: row.device.to_string(),
                flags: row.flags,
            });
        }
        entries
    }

    /// Replace the exported device set with the current table.
    pub async fn collect(&self) -> usize {
        let entries = self.read().await;
        self.devices.clear();
        for entry in &entries {
            let labels = ArpLabels {
                ip_addr: entry.ip.clone(),
                hw_addr: entry.hw_addr.clone(),
                hostname: entry.hostname.clone(),
                device: entry.device.clone(),
            };
            self.devices.get_or_create(&labels).set(entry.flags);
        }
        debug!(
            entries = entries.len(),
            cached_hosts = self.hosts.len(),
            "arp table collected"
        );
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostname::tests::FakeResolver;
    use crate::hostname::{DEFAULT_HOSTNAME_TTL, DEFAULT_LOOKUP_TIMEOUT};
    use prometheus_client::encoding::text::encode;
    use std::io;
    use std::sync::atomic::Ordering;

    const HEADER: &str =
        "IP address       HW type     Flags       HW address            Mask     Device";

    fn named(ip: IpAddr) -> io::Result<Vec<String>> {
        Ok(vec![format!("host-{}.lan.", ip.to_string().replace('.', "-"))])
    }

    fn hosts() -> (Arc<FakeResolver>, Arc<HostnameCache>) {
        let resolver = FakeResolver::new(named);
        let cache = HostnameCache::new(
            resolver.clone(),
            ".lan",
            DEFAULT_HOSTNAME_TTL,
            DEFAULT_LOOKUP_TIMEOUT,
        );
        (resolver, Arc::new(cache))
    }

    fn temp_arp(name: &str, rows: &[&str]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "router-monitor-{}-{}.arp",
            std::process::id(),
            name
        ));
        let mut contents = String::from(HEADER);
        contents.push('\n');
        for row in rows {
            contents.push_str(row);
            contents.push('\n');
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_incomplete_and_complete_rows() {
        assert_eq!(
            parse_arp_line("10.0.0.5  0x1  0x2  00:00:00:00:00:00  *  eth0"),
            None
        );
        let row = parse_arp_line("10.0.0.5 0x1 0x2 aa:bb:cc:dd:ee:ff * eth0").unwrap();
        assert_eq!(row.hw_addr, "aa:bb:cc:dd:ee:ff");
        assert_eq!(row.flags, 2);
        assert_eq!(row.device, "eth0");
        assert_eq!(parse_arp_line(HEADER), None);
    }

    #[test]
    fn test_flag_bases() {
        assert_eq!(parse_int_auto("0x2"), Some(2));
        assert_eq!(parse_int_auto("0X1f"), Some(31));
        assert_eq!(parse_int_auto("010"), Some(8));
        assert_eq!(parse_int_auto("0o17"), Some(15));
        assert_eq!(parse_int_auto("0b101"), Some(5));
        assert_eq!(parse_int_auto("42"), Some(42));
        assert_eq!(parse_int_auto("0"), Some(0));
        assert_eq!(parse_int_auto("-0x10"), Some(-16));
        assert_eq!(parse_int_auto("0x"), None);
        assert_eq!(parse_int_auto("zz"), None);

        let row = parse_arp_line("10.0.0.6 0x1 bogus aa:bb:cc:dd:ee:01 * eth0").unwrap();
        assert_eq!(row.flags, 0);
    }

    #[tokio::test]
    async fn test_collect_exports_complete_rows() {
        let path = temp_arp(
            "collect",
            &[
                "10.0.0.5  0x1  0x2  00:00:00:00:00:00  *  eth0",
                "10.0.0.5 0x1 0x2 aa:bb:cc:dd:ee:ff * eth0",
                "10.0.0.7 0x1 0x2 aa:bb:cc:dd:ee:07",
            ],
        );
        let (resolver, cache) = hosts();
        let reader = ArpTableReader::new(&path, cache);
        let mut registry = Registry::default();
        reader.register(&mut registry);

        let entries = reader.read().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].hw_addr, "aa:bb:cc:dd:ee:ff");
        assert_eq!(entries[0].hostname, "host-10-0-0-5");

        assert_eq!(reader.collect().await, 1);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains(
            r#"router_monitor_arp_devices{ip_addr="10.0.0.5",hw_addr="aa:bb:cc:dd:ee:ff",hostname="host-10-0-0-5",device="eth0"} 2"#
        ));
    }

    #[tokio::test]
    async fn test_departed_device_is_dropped() {
        let path = temp_arp(
            "departed",
            &[
                "192.168.1.2 0x1 0x2 aa:bb:cc:dd:ee:02 * br-lan",
                "192.168.1.3 0x1 0x2 aa:bb:cc:dd:ee:03 * br-lan",
            ],
        );
        let (_, cache) = hosts();
        let reader = ArpTableReader::new(&path, cache);
        let mut registry = Registry::default();
        reader.register(&mut registry);
        assert_eq!(reader.collect().await, 2);

        std::fs::write(
            &path,
            format!("{}\n192.168.1.2 0x1 0x2 aa:bb:cc:dd:ee:02 * br-lan\n", HEADER),
        )
        .unwrap();
        assert_eq!(reader.collect().await, 1);
        std::fs::remove_file(&path).unwrap();

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains(r#"ip_addr="192.168.1.2""#));
        assert!(!out.contains(r#"ip_addr="192.168.1.3""#));
    }

    #[tokio::test]
    async fn test_unparseable_address_is_exported_raw() {
        let path = temp_arp(
            "rawip",
            &["fe80::1%br-lan 0x1 0x2 aa:bb:cc:dd:ee:09 * br-lan"],
        );
        let (resolver, cache) = hosts();
        let reader = ArpTableReader::new(&path, cache);
        let mut registry = Registry::default();
        reader.register(&mut registry);

        assert_eq!(reader.collect().await, 1);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);

        let mut out = String::new();
        encode(&mut out, &registry).unwrap();
        assert!(out.contains(
            r#"ip_addr="fe80::1%br-lan",hw_addr="aa:bb:cc:dd:ee:09",hostname="unknown:fe80::1%br-lan",device="br-lan"} 2"#
        ));
    }

    #[tokio::test]
    async fn test_missing_file_yields_nothing() {
        let (resolver, cache) = hosts();
        let reader = ArpTableReader::new("/nonexistent/router-monitor/arp", cache);
        assert!(reader.read().await.is_empty());
        assert_eq!(reader.collect().await, 0);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }
}
