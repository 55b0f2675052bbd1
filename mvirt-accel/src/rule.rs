//! Offload rule descriptors sent to the acceleration engine.
//!
//! A [`CreateRule`] is built fresh for every create command and describes
//! how the engine should forward both directions of a flow. Optional
//! sections are `Option`s; a present section is a valid section.

use std::net::IpAddr;

use serde::Serialize;
use smoltcp::wire::EthernetAddress;

use crate::flow::{FlowRecord, TransportProtocol};

/// VLAN tag slot value meaning "no tag configured".
pub const VLAN_NOT_CONFIGURED: u32 = 0xFFF;

/// 802.1Q tag protocol identifier.
pub const VLAN_TPID_8021Q: u32 = 0x8100;

/// Addressing tuple of a rule, flow direction first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuleTuple {
    pub protocol: TransportProtocol,
    pub flow_ip: IpAddr,
    pub flow_ident: u16,
    pub return_ip: IpAddr,
    pub return_ident: u16,
}

impl RuleTuple {
    pub fn for_flow(flow: &FlowRecord) -> Self {
        let tuple = flow.tuple();
        Self {
            protocol: tuple.protocol,
            flow_ip: tuple.src,
            flow_ident: tuple.src_port,
            return_ip: tuple.dst,
            return_ident: tuple.dst_port,
        }
    }
}

/// Interfaces, next hops, MTUs and endpoint MACs of both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRule {
    pub flow_interface: i32,
    pub return_interface: i32,
    pub flow_nexthop: i32,
    pub return_nexthop: i32,
    pub flow_mtu: u32,
    pub return_mtu: u32,
    pub flow_mac: EthernetAddress,
    pub return_mac: EthernetAddress,
}

/// Rule flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleFlags {
    pub routed: bool,
    pub bridge_flow: bool,
    pub l2_encap: bool,
    pub no_seq_check: bool,
    pub src_interface_check: bool,
    pub dscp_marking: bool,
    pub emesh_sp: bool,
    /// Ignore source port identifiers (VxLAN outer flows).
    pub no_src_ident: bool,
}

/// Primary and secondary (QinQ) VLAN tags per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlanRule {
    pub ingress: [u32; 2],
    pub egress: [u32; 2],
}

impl Default for VlanRule {
    fn default() -> Self {
        Self {
            ingress: [VLAN_NOT_CONFIGURED; 2],
            egress: [VLAN_NOT_CONFIGURED; 2],
        }
    }
}

impl VlanRule {
    pub fn is_configured(&self) -> bool {
        self.ingress[0] != VLAN_NOT_CONFIGURED || self.egress[0] != VLAN_NOT_CONFIGURED
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PppoeRule {
    pub flow_if_num: Option<i32>,
    pub return_if_num: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosRule {
    pub flow_qos_tag: u32,
    pub return_qos_tag: u32,
}

/// Ingress shaper QoS tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgsRule {
    pub flow_qos_tag: u16,
    pub return_qos_tag: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DscpRule {
    pub flow_dscp: u8,
    pub return_dscp: u8,
}

/// Engine interfaces receiving mirrored copies; `None` for a direction
/// that is not mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorRule {
    pub flow_ifnum: Option<i32>,
    pub return_ifnum: Option<i32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpWindow {
    pub scale: u8,
    pub max_window: u32,
    pub end: u32,
    pub max_end: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpRule {
    pub flow: TcpWindow,
    pub ret: TcpWindow,
}

/// Create command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRule {
    pub tuple: RuleTuple,
    pub conn: ConnectionRule,
    pub flags: RuleFlags,
    pub flow_src_mac: Option<EthernetAddress>,
    pub return_src_mac: Option<EthernetAddress>,
    pub vlan: Option<VlanRule>,
    pub pppoe: Option<PppoeRule>,
    pub qos: Option<QosRule>,
    pub igs: Option<IgsRule>,
    pub dscp: Option<DscpRule>,
    pub mirror: Option<MirrorRule>,
    pub tcp: Option<TcpRule>,
}

impl CreateRule {
    /// VLAN section, created unconfigured on first use.
    pub fn vlan_mut(&mut self) -> &mut VlanRule {
        self.vlan.get_or_insert_with(VlanRule::default)
    }

    pub fn pppoe_mut(&mut self) -> &mut PppoeRule {
        self.pppoe.get_or_insert_with(PppoeRule::default)
    }
}

/// Destroy command payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DestroyRule {
    pub tuple: RuleTuple,
}

impl DestroyRule {
    pub fn for_flow(flow: &FlowRecord) -> Self {
        Self {
            tuple: RuleTuple::for_flow(flow),
        }
    }
}
