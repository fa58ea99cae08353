use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use aya::maps::{HashMap as AyaHashMap, MapData};
use prometheus_client::collector::Collector;
use prometheus_client::encoding::{DescriptorEncoder, EncodeMetric};
use prometheus_client::metrics::counter::ConstCounter;
use prometheus_client::registry::Registry;
use router_monitor_common::{FlowKey, FlowValue};

use crate::model::{classify, eth_proto_str, ip_proto_str, Direction, FlowLabels, FlowSample};

pub type TableEntries<'a> = Box<dyn Iterator<Item = Result<(FlowKey, FlowValue)>> + 'a>;

/// A key/value counter table owned by someone else.
///
/// Every call to `entries` starts a fresh pass over the table.
pub trait CounterTable: Send + Sync {
    fn entries(&self) -> TableEntries<'_>;
}

pub struct KernelCounterTable {
    name: &'static str,
    map: AyaHashMap<MapData, FlowKey, FlowValue>,
}

impl KernelCounterTable {
    pub fn new(name: &'static str, map: AyaHashMap<MapData, FlowKey, FlowValue>) -> Self {
        Self { name, map }
    }
}

impl CounterTable for KernelCounterTable {
    fn entries(&self) -> TableEntries<'_> {
        let name = self.name;
        Box::new(self.map.iter().map(move |entry| {
            entry.with_context(|| format!("failed to iterate map {}", name))
        }))
    }
}

/// Reads the ingress and egress tables into labelled samples.
pub struct FlowCounterReader {
    tables: Vec<(Direction, Box<dyn CounterTable>)>,
}

impl FlowCounterReader {
    pub fn new(ingress: Box<dyn CounterTable>, egress: Box<dyn CounterTable>) -> Self {
        Self {
            tables: vec![(Direction::Ingress, ingress), (Direction::Egress, egress)],
        }
    }

    /// Any iteration error means the userspace view of the kernel maps is
    /// broken; callers treat it as fatal.
    pub fn collect(&self) -> Result<Vec<FlowSample>> {
        let mut samples = Vec::new();
        for (direction, table) in &self.tables {
            for entry in table.entries() {
                let (key, value) =
                    entry.with_context(|| format!("{} counter table unreadable", direction))?;
                samples.push(to_sample(*direction, &key, &value));
            }
        }
        Ok(samples)
    }
}

fn to_sample(direction: Direction, key: &FlowKey, value: &FlowValue) -> FlowSample {
    FlowSample {
        labels: FlowLabels {
            direction: direction.as_str().to_string(),
            ethproto: eth_proto_str(key.eth_proto).to_string(),
            src: classify(key.src_ip, key.eth_proto),
            dst: classify(key.dst_ip, key.eth_proto),
            ipproto: ip_proto_str(key.ip_proto).to_string(),
        },
        packets: value.packets,
        bytes: value.bytes,
    }
}

/// Exposes the last flow snapshot as counters.
///
/// The kernel counters are cumulative, so each scrape re-emits their current
/// value instead of incrementing anything on our side.
#[derive(Clone, Debug, Default)]
pub struct FlowMetrics {
    snapshot: Arc<Mutex<Vec<FlowSample>>>,
}

impl FlowMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register_collector(Box::new(self.clone()));
    }

    pub fn replace(&self, samples: Vec<FlowSample>) {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = samples;
    }
}

impl Collector for FlowMetrics {
    fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), std::fmt::Error> {
        let snapshot = self
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        encode_counters(
            &mut encoder,
            "router_monitor_packets",
            "Packets transferred per classified flow",
            &snapshot,
            |s| s.packets,
        )?;
        encode_counters(
            &mut encoder,
            "router_monitor_bytes",
            "Bytes transferred per classified flow",
            &snapshot,
            |s| s.bytes,
        )
    }
}

fn encode_counters(
    encoder: &mut DescriptorEncoder,
    name: &str,
    help: &str,
    snapshot: &[FlowSample],
    value: fn(&FlowSample) -> u64,
) -> Result<(), std::fmt::Error> {
    let mut family = encoder.encode_descriptor(
        name,
        help,
        None,
        ConstCounter::new(0u64).metric_type(),
    )?;
    for sample in snapshot {
        ConstCounter::new(value(sample)).encode(family.encode_family(&sample.labels)?)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::anyhow;
    use prometheus_client::encoding::text::encode;
    use router_monitor_common::ETH_P_IPV4;
    use std::net::Ipv4Addr;

    pub(crate) struct FakeTable {
        pub rows: Vec<(FlowKey, FlowValue)>,
        pub broken: bool,
    }

    impl FakeTable {
        pub(crate) fn boxed(rows: Vec<(FlowKey, FlowValue)>) -> Box<dyn CounterTable> {
            Box::new(Self { rows, broken: false })
        }
    }

    impl CounterTable for FakeTable {
        fn entries(&self) -> TableEntries<'_> {
            let mut items: Vec<Result<(FlowKey, FlowValue)>> =
                self.rows.iter().copied().map(Ok).collect();
            if self.broken {
                items.push(Err(anyhow!("map iteration failed")));
            }
            Box::new(items.into_iter())
        }
    }

    fn raw(addr: Ipv4Addr) -> u32 {
        // Same layout the tc program writes: wire bytes read as a native u32.
        u32::from_ne_bytes(addr.octets())
    }

    #[test]
    fn test_ingress_entry_end_to_end() -> Result<()> {
        let key = FlowKey::new(ETH_P_IPV4, 6, 0, raw(Ipv4Addr::new(10, 0, 0, 1)));
        let value = FlowValue {
            packets: 5,
            bytes: 500,
        };
        let reader = FlowCounterReader::new(FakeTable::boxed(vec![(key, value)]), FakeTable::boxed(vec![]));

        let samples = reader.collect()?;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels.direction, "ingress");
        assert_eq!(samples[0].labels.src, "internet");
        assert_eq!(samples[0].labels.dst, "10.0.0.1");

        let metrics = FlowMetrics::default();
        let mut registry = Registry::default();
        metrics.register(&mut registry);
        metrics.replace(samples);

        let mut out = String::new();
        encode(&mut out, &registry)?;
        let labels = r#"{direction="ingress",ethproto="IPv4",src="internet",dst="10.0.0.1",ipproto="TCP"}"#;
        assert!(out.contains("# TYPE router_monitor_packets counter"));
        assert!(out.contains(&format!("router_monitor_packets_total{} 5", labels)));
        assert!(out.contains(&format!("router_monitor_bytes_total{} 500", labels)));
        Ok(())
    }

    #[test]
    fn test_directions_stay_separate() -> Result<()> {
        let lan = raw(Ipv4Addr::new(192, 168, 1, 5));
        let key = FlowKey::new(ETH_P_IPV4, 17, lan, 0);
        let value = FlowValue {
            packets: 2,
            bytes: 120,
        };
        let reader = FlowCounterReader::new(
            FakeTable::boxed(vec![(key, value)]),
            FakeTable::boxed(vec![(key, value)]),
        );

        let samples = reader.collect()?;
        assert_eq!(samples.len(), 2);
        let directions: Vec<&str> = samples.iter().map(|s| s.labels.direction.as_str()).collect();
        assert!(directions.contains(&"ingress"));
        assert!(directions.contains(&"egress"));
        assert!(samples.iter().all(|s| s.packets == 2 && s.bytes == 120));
        Ok(())
    }

    #[test]
    fn test_iteration_error_is_reported() {
        let broken = Box::new(FakeTable {
            rows: vec![],
            broken: true,
        });
        let reader = FlowCounterReader::new(FakeTable::boxed(vec![]), broken);
        let err = reader.collect().unwrap_err();
        assert!(format!("{:#}", err).contains("egress counter table unreadable"));
    }

    #[test]
    fn test_rescrape_reports_cumulative_value() -> Result<()> {
        let metrics = FlowMetrics::default();
        let mut registry = Registry::default();
        metrics.register(&mut registry);

        let key = FlowKey::new(ETH_P_IPV4, 6, 0, raw(Ipv4Addr::new(10, 0, 0, 2)));
        for packets in [3u64, 7] {
            let value = FlowValue { packets, bytes: 0 };
            let reader = FlowCounterReader::new(FakeTable::boxed(vec![(key, value)]), FakeTable::boxed(vec![]));
            metrics.replace(reader.collect()?);
        }

        let mut out = String::new();
        encode(&mut out, &registry)?;
        assert!(out.contains(r#"dst="10.0.0.2",ipproto="TCP"} 7"#));
        assert!(!out.contains(r#"dst="10.0.0.2",ipproto="TCP"} 10"#));
        Ok(())
    }
}
