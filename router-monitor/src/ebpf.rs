use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use aya::maps::HashMap as AyaHashMap;
use aya::programs::{tc, SchedClassifier, TcAttachType};
use aya::Ebpf;
use router_monitor_common::{
    FlowKey, FlowValue, MAP_PACKET_STATS_EGRESS, MAP_PACKET_STATS_INGRESS, PROG_TC_EGRESS,
    PROG_TC_INGRESS,
};
use tracing::{debug, info};

use crate::flows::{FlowCounterReader, KernelCounterTable};

const OBJECT_CANDIDATES: [&str; 5] = [
    "./router-monitor-ebpf.o",
    "./target/bpfel-unknown-none/release/router-monitor-ebpf",
    "./target/bpfel-unknown-none/debug/router-monitor-ebpf",
    "./target/bpfel-unknown-none/release/router_monitor_ebpf",
    "./target/bpfel-unknown-none/debug/router_monitor_ebpf",
];

/// Use the given path, or the first local build artifact that exists.
pub fn resolve_bpf_object(input: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = input {
        return Ok(path);
    }
    OBJECT_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
        .ok_or_else(|| anyhow!("cannot find eBPF object automatically; pass --bpf-object <path>"))
}

/// Loaded tc programs. Dropping this detaches them.
pub struct TcAttachment {
    _bpf: Ebpf,
    iface: String,
}

impl TcAttachment {
    pub fn iface(&self) -> &str {
        &self.iface
    }
}

/// Load the object, attach both classifiers to `iface` and hand out the two
/// counter tables.
pub fn attach(object: &Path, iface: &str) -> Result<(TcAttachment, FlowCounterReader)> {
    let mut bpf = Ebpf::load_file(object)
        .with_context(|| format!("failed to load bpf object: {}", object.display()))?;

    attach_tc_program(&mut bpf, iface, PROG_TC_INGRESS, TcAttachType::Ingress)?;
    attach_tc_program(&mut bpf, iface, PROG_TC_EGRESS, TcAttachType::Egress)?;

    let ingress = take_counter_table(&mut bpf, MAP_PACKET_STATS_INGRESS)?;
    let egress = take_counter_table(&mut bpf, MAP_PACKET_STATS_EGRESS)?;

    info!(iface = %iface, object = %object.display(), "tc programs attached");
    Ok((
        TcAttachment {
            _bpf: bpf,
            iface: iface.to_string(),
        },
        FlowCounterReader::new(Box::new(ingress), Box::new(egress)),
    ))
}

fn take_counter_table(bpf: &mut Ebpf, name: &'static str) -> Result<KernelCounterTable> {
    let map = bpf
        .take_map(name)
        .ok_or_else(|| anyhow!("map {} not found", name))?;
    let map = AyaHashMap::<_, FlowKey, FlowValue>::try_from(map)
        .with_context(|| format!("map {} has an unexpected layout", name))?;
    Ok(KernelCounterTable::new(name, map))
}

fn attach_tc_program(
    bpf: &mut Ebpf,
    iface: &str,
    prog_name: &str,
    attach_type: TcAttachType,
) -> Result<()> {
    if let Err(err) = tc::qdisc_add_clsact(iface) {
        debug!(iface = %iface, error = %err, "clsact exists or failed to add");
    }

    let program: &mut SchedClassifier = bpf
        .program_mut(prog_name)
        .ok_or_else(|| anyhow!("program {} not found", prog_name))?
        .try_into()?;

    program
        .load()
        .with_context(|| format!("failed to load program {}", prog_name))?;
    program
        .attach(iface, attach_type)
        .with_context(|| format!("failed to attach {} to {}", prog_name, iface))?;
    Ok(())
}
