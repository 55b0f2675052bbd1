//! Interface hierarchy descriptors.
//!
//! Each direction of a flow is described by the stack of interfaces its
//! packets traverse, from the outermost (physical) device to the innermost
//! (logical) one, e.g. `eth0 -> eth0.100 -> pppoe-wan`.

use std::fmt;
use std::sync::Arc;

use smoltcp::wire::EthernetAddress;

/// Type-specific data of an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceKind {
    Ethernet {
        mac: EthernetAddress,
    },
    Bridge {
        mac: EthernetAddress,
    },
    /// Open vSwitch bridge.
    OvsBridge {
        mac: EthernetAddress,
    },
    Pppoe {
        session_id: u16,
        remote_mac: EthernetAddress,
    },
    Vlan {
        mac: EthernetAddress,
        tpid: u16,
        tag: u16,
    },
    MacVlan {
        mac: EthernetAddress,
    },
    Ipsec,
    /// OpenVPN tunnel.
    Ovpn,
    Vxlan {
        vni: u32,
    },
    /// Interface types the engine has no rule fields for.
    Other {
        type_name: String,
    },
}

impl InterfaceKind {
    pub fn type_name(&self) -> &str {
        match self {
            InterfaceKind::Ethernet { .. } => "ethernet",
            InterfaceKind::Bridge { .. } => "bridge",
            InterfaceKind::OvsBridge { .. } => "ovs_bridge",
            InterfaceKind::Pppoe { .. } => "pppoe",
            InterfaceKind::Vlan { .. } => "vlan",
            InterfaceKind::MacVlan { .. } => "macvlan",
            InterfaceKind::Ipsec => "ipsec",
            InterfaceKind::Ovpn => "ovpn",
            InterfaceKind::Vxlan { .. } => "vxlan",
            InterfaceKind::Other { type_name } => type_name,
        }
    }
}

/// A single interface in a hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    /// Interface number known to the acceleration engine, negative if the
    /// engine does not know the device.
    pub engine_ifnum: i32,
    pub mtu: u32,
    pub kind: InterfaceKind,
}

impl Interface {
    pub fn new(name: impl Into<String>, engine_ifnum: i32, mtu: u32, kind: InterfaceKind) -> Self {
        Self {
            name: name.into(),
            engine_ifnum,
            mtu,
            kind,
        }
    }

    pub fn ethernet(name: impl Into<String>, engine_ifnum: i32, mac: EthernetAddress) -> Self {
        Self::new(name, engine_ifnum, 1500, InterfaceKind::Ethernet { mac })
    }

    pub fn bridge(name: impl Into<String>, engine_ifnum: i32, mac: EthernetAddress) -> Self {
        Self::new(name, engine_ifnum, 1500, InterfaceKind::Bridge { mac })
    }

    pub fn vlan(
        name: impl Into<String>,
        engine_ifnum: i32,
        mac: EthernetAddress,
        tag: u16,
    ) -> Self {
        Self::new(
            name,
            engine_ifnum,
            1500,
            InterfaceKind::Vlan {
                mac,
                tpid: 0x8100,
                tag,
            },
        )
    }

    pub fn pppoe(
        name: impl Into<String>,
        engine_ifnum: i32,
        session_id: u16,
        remote_mac: EthernetAddress,
    ) -> Self {
        Self::new(
            name,
            engine_ifnum,
            1492,
            InterfaceKind::Pppoe {
                session_id,
                remote_mac,
            },
        )
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, ifnum {})", self.name, self.kind.type_name(), self.engine_ifnum)
    }
}

/// Ordered interface stack of one direction, outermost first.
///
/// Interfaces are shared between flows; dropping a hierarchy releases the
/// flow's hold on each of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceHierarchy(Vec<Arc<Interface>>);

impl InterfaceHierarchy {
    pub fn new(interfaces: Vec<Arc<Interface>>) -> Self {
        Self(interfaces)
    }

    pub fn outermost(&self) -> Option<&Arc<Interface>> {
        self.0.first()
    }

    pub fn innermost(&self) -> Option<&Arc<Interface>> {
        self.0.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Interface>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Interface> for InterfaceHierarchy {
    fn from_iter<I: IntoIterator<Item = Interface>>(iter: I) -> Self {
        Self(iter.into_iter().map(Arc::new).collect())
    }
}
