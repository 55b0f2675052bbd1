//! Topology resolution.
//!
//! The controller asks a [`TopologyResolver`] for the interface stack and
//! endpoint node of each side of a new flow, and for the engine-side
//! remappings a rule needs while it is compiled.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

use smoltcp::wire::EthernetAddress;
use tracing::debug;

use crate::error::{AccelError, Result};
use crate::flow::{Interface, InterfaceHierarchy, ResolvedSide};

/// Bit position of the priority code point in a VLAN tag.
pub const VLAN_PRIORITY_SHIFT: u32 = 13;

pub trait TopologyResolver: Send + Sync {
    /// Resolve the path towards `addr`: the interface stack, the MAC of
    /// the node owning the address and the path MTU.
    fn resolve(&self, addr: IpAddr) -> Result<ResolvedSide>;

    /// Priority bits to OR into a VLAN tag for packets carrying `qos_tag`.
    fn vlan_egress_priority(&self, _iface: &Interface, _qos_tag: u32) -> u32 {
        0
    }

    /// Engine interface number of a host interface used as mirror target.
    fn mirror_ifnum(&self, _ifindex: u32) -> Option<i32> {
        None
    }

    /// Engine interface carrying IPsec traffic for a flow leaving `ifnum`.
    fn ipsec_ifnum(&self, ifnum: i32) -> i32 {
        ifnum
    }

    /// Engine interface of the VPN offload device for `ifnum`.
    fn vpn_ifnum(&self, ifnum: i32) -> i32 {
        ifnum
    }
}

/// Table-driven resolver, populated up front by the caller.
#[derive(Debug, Default)]
pub struct StaticTopology {
    endpoints: RwLock<HashMap<IpAddr, ResolvedSide>>,
    vlan_priorities: RwLock<HashMap<(String, u32), u32>>,
    mirrors: RwLock<HashMap<u32, i32>>,
    ipsec_ifnum: RwLock<Option<i32>>,
    vpn_ifnum: RwLock<Option<i32>>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `addr` reachable through `hierarchy`. Replaces an earlier entry.
    pub fn add_endpoint(
        &self,
        addr: IpAddr,
        hierarchy: InterfaceHierarchy,
        node_mac: EthernetAddress,
    ) {
        let mtu = hierarchy.iter().map(|iface| iface.mtu).min().unwrap_or(0);
        debug!(%addr, interfaces = hierarchy.len(), mtu, "Endpoint added");
        self.endpoints.write().unwrap().insert(
            addr,
            ResolvedSide {
                hierarchy,
                node_mac,
                mtu,
            },
        );
    }

    pub fn remove_endpoint(&self, addr: IpAddr) -> bool {
        self.endpoints.write().unwrap().remove(&addr).is_some()
    }

    /// Map a QoS tag on a VLAN device to a priority code point.
    pub fn set_vlan_egress_priority(&self, device: &str, qos_tag: u32, pcp: u8) {
        self.vlan_priorities
            .write()
            .unwrap()
            .insert((device.to_string(), qos_tag), u32::from(pcp & 0x7) << VLAN_PRIORITY_SHIFT);
    }

    pub fn add_mirror_interface(&self, ifindex: u32, engine_ifnum: i32) {
        self.mirrors.write().unwrap().insert(ifindex, engine_ifnum);
    }

    pub fn set_ipsec_interface(&self, engine_ifnum: i32) {
        *self.ipsec_ifnum.write().unwrap() = Some(engine_ifnum);
    }

    pub fn set_vpn_interface(&self, engine_ifnum: i32) {
        *self.vpn_ifnum.write().unwrap() = Some(engine_ifnum);
    }
}

impl TopologyResolver for StaticTopology {
    fn resolve(&self, addr: IpAddr) -> Result<ResolvedSide> {
        let endpoints = self.endpoints.read().unwrap();
        let side = endpoints
            .get(&addr)
            .ok_or_else(|| AccelError::Resolution(format!("no route to {addr}")))?;
        if side.hierarchy.is_empty() {
            return Err(AccelError::Resolution(format!(
                "empty interface hierarchy towards {addr}"
            )));
        }
        Ok(side.clone())
    }

    fn vlan_egress_priority(&self, iface: &Interface, qos_tag: u32) -> u32 {
        self.vlan_priorities
            .read()
            .unwrap()
            .get(&(iface.name.clone(), qos_tag))
            .copied()
            .unwrap_or(0)
    }

    fn mirror_ifnum(&self, ifindex: u32) -> Option<i32> {
        self.mirrors.read().unwrap().get(&ifindex).copied()
    }

    fn ipsec_ifnum(&self, ifnum: i32) -> i32 {
        self.ipsec_ifnum.read().unwrap().unwrap_or(ifnum)
    }

    fn vpn_ifnum(&self, ifnum: i32) -> i32 {
        self.vpn_ifnum.read().unwrap().unwrap_or(ifnum)
    }
}
