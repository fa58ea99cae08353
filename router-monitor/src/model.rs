use std::fmt::Display;
use std::net::{Ipv4Addr, Ipv6Addr};

use prometheus_client::encoding::EncodeLabelSet;
use router_monitor_common::{ETH_P_8021Q, ETH_P_ARP, ETH_P_IPV4, ETH_P_IPV6, ETH_P_LLDP};

/// Label shown for the reserved zero address.
pub const INTERNET: &str = "internet";

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, EncodeLabelSet)]
pub struct FlowLabels {
    pub direction: String,
    pub ethproto: String,
    pub src: String,
    pub dst: String,
    pub ipproto: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FlowSample {
    pub labels: FlowLabels,
    pub packets: u64,
    pub bytes: u64,
}

/// Render a raw kernel address for display.
///
/// The tc program copies the address bytes straight off the packet into a
/// `u32`, so decoding must use host byte order to get the original octets back.
pub fn classify(raw: u32, eth_proto: u16) -> String {
    if raw == 0 {
        return INTERNET.to_string();
    }
    let octets = raw.to_ne_bytes();
    if eth_proto == ETH_P_IPV6 {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&octets);
        return Ipv6Addr::from(bytes).to_string();
    }
    Ipv4Addr::from(octets).to_string()
}

pub fn eth_proto_str(eth_proto: u16) -> &'static str {
    match eth_proto {
        ETH_P_IPV4 => "IPv4",
        ETH_P_IPV6 => "IPv6",
        ETH_P_ARP => "ARP",
        ETH_P_8021Q => "Dot1Q",
        ETH_P_LLDP => "LinkLayerDiscovery",
        _ => "UnknownEthernetType",
    }
}

pub fn ip_proto_str(ip_proto: u8) -> &'static str {
    match ip_proto {
        0 => "IPv6HopByHop",
        1 => "ICMPv4",
        2 => "IGMP",
        6 => "TCP",
        17 => "UDP",
        47 => "GRE",
        50 => "ESP",
        51 => "AH",
        58 => "ICMPv6",
        132 => "SCTP",
        136 => "UDPLite",
        _ => "UnknownIPProtocol",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_v4(addr: Ipv4Addr) -> u32 {
        u32::from_ne_bytes(addr.octets())
    }

    #[test]
    fn test_zero_is_internet_for_any_ethertype() {
        assert_eq!(classify(0, ETH_P_IPV4), INTERNET);
        assert_eq!(classify(0, ETH_P_IPV6), INTERNET);
        assert_eq!(classify(0, 0x1234), INTERNET);
    }

    #[test]
    fn test_ipv4_decode_roundtrips_through_raw() {
        let addr = Ipv4Addr::new(192, 168, 1, 106);
        let shown = classify(raw_v4(addr), ETH_P_IPV4);
        assert_eq!(shown, "192.168.1.106");

        let parsed: Ipv4Addr = shown.parse().unwrap();
        assert_eq!(raw_v4(parsed), raw_v4(addr));
    }

    #[test]
    fn test_ipv6_widens_into_leading_bytes() {
        let raw = u32::from_ne_bytes([0xfd, 0x00, 0x00, 0x01]);
        assert_eq!(classify(raw, ETH_P_IPV6), "fd00:1::");
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(eth_proto_str(ETH_P_IPV4), "IPv4");
        assert_eq!(eth_proto_str(0x9000), "UnknownEthernetType");
        assert_eq!(ip_proto_str(6), "TCP");
        assert_eq!(ip_proto_str(17), "UDP");
        assert_eq!(ip_proto_str(250), "UnknownIPProtocol");
        assert_eq!(Direction::Egress.to_string(), "egress");
    }
}
