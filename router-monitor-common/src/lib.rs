#![cfg_attr(not(feature = "user"), no_std)]

use bytemuck::{Pod, Zeroable};

pub const MAP_PACKET_STATS_INGRESS: &str = "PACKET_STATS_INGRESS";
pub const MAP_PACKET_STATS_EGRESS: &str = "PACKET_STATS_EGRESS";
pub const PROG_TC_INGRESS: &str = "tc_packet_counter_ingress";
pub const PROG_TC_EGRESS: &str = "tc_packet_counter_egress";

pub const ETH_P_IPV4: u16 = 0x0800;
pub const ETH_P_ARP: u16 = 0x0806;
pub const ETH_P_8021Q: u16 = 0x8100;
pub const ETH_P_IPV6: u16 = 0x86dd;
pub const ETH_P_LLDP: u16 = 0x88cc;

/// Key of the per-flow counter table filled by the tc programs.
///
/// Addresses are stored as the kernel read them off the wire, i.e. the raw
/// network-order bytes reinterpreted as a host-native `u32`. A zero address
/// marks the side of the flow that is outside the monitored LAN.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Pod, Zeroable)]
pub struct FlowKey {
    pub eth_proto: u16,
    pub _pad0: u16,
    pub src_ip: u32,
    pub dst_ip: u32,
    pub ip_proto: u8,
    pub _pad1: [u8; 3],
}

impl FlowKey {
    pub fn new(eth_proto: u16, ip_proto: u8, src_ip: u32, dst_ip: u32) -> Self {
        Self {
            eth_proto,
            _pad0: 0,
            src_ip,
            dst_ip,
            ip_proto,
            _pad1: [0; 3],
        }
    }
}

/// Cumulative counters since the program was loaded.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Pod, Zeroable)]
pub struct FlowValue {
    pub packets: u64,
    pub bytes: u64,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for FlowKey {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for FlowValue {}
