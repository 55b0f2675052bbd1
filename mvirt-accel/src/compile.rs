//! Offload rule compilation.
//!
//! Walks both interface hierarchies of a flow from the outermost device
//! inwards and turns what it finds into a [`CreateRule`]. Each interface
//! type either contributes rule fields or vetoes the rule when the engine
//! cannot express the stack (cascaded bridges, a third VLAN, nested
//! PPPoE, a second IPsec or VxLAN device).

use smoltcp::wire::EthernetAddress;
use tracing::{debug, trace};

use crate::classifier::{Decision, MirrorTargets};
use crate::config::AccelConfig;
use crate::error::{AccelError, Result};
use crate::flow::{FlowRecord, InterfaceHierarchy, InterfaceKind, Side, TransportProtocol};
use crate::packet::{TcpWindowSide, TcpWindowState};
use crate::rule::{
    ConnectionRule, CreateRule, DscpRule, IgsRule, MirrorRule, QosRule, RuleFlags, RuleTuple,
    TcpRule, TcpWindow, VLAN_NOT_CONFIGURED, VLAN_TPID_8021Q, VlanRule,
};
use crate::topology::TopologyResolver;

/// Per-packet inputs to a compilation.
#[derive(Debug, Clone, Copy)]
pub struct CompileContext<'a> {
    pub decision: &'a Decision,
    /// Connection-tracking window state, for TCP flows that have one.
    pub tcp_window: Option<TcpWindowState>,
    /// VLAN tag the packet arrived with.
    pub vlan_tag: Option<u16>,
    pub is_l2_encap: bool,
}

/// What one side's hierarchy contributes to the rule.
#[derive(Debug)]
struct SideRule {
    interface: i32,
    nexthop: i32,
    src_mac: Option<EthernetAddress>,
    vlan: [u32; 2],
    pppoe_ifnum: Option<i32>,
    vxlan: bool,
}

/// Occurrences of each interface type seen during one side's walk.
#[derive(Debug, Default)]
struct TypeCounts {
    bridge: u32,
    ethernet: u32,
    pppoe: u32,
    vlan: u32,
    ipsec: u32,
    vxlan: u32,
}

pub struct RuleCompiler<'a> {
    topology: &'a dyn TopologyResolver,
    config: &'a AccelConfig,
}

impl<'a> RuleCompiler<'a> {
    pub fn new(topology: &'a dyn TopologyResolver, config: &'a AccelConfig) -> Self {
        Self { topology, config }
    }

    /// Build the create rule for `flow`.
    pub fn compile(&self, flow: &FlowRecord, ctx: &CompileContext<'_>) -> Result<CreateRule> {
        let (from, to) = flow.hierarchies();
        let decision = ctx.decision;
        let routed = flow.is_routed();

        let from_side = self.walk(Side::From, &from, decision.qos.ret)?;
        let to_side = self.walk(Side::To, &to, decision.qos.flow)?;

        let flow_mtu = flow.mtu(Side::From);
        let mut rule = CreateRule {
            tuple: RuleTuple::for_flow(flow),
            conn: ConnectionRule {
                flow_interface: from_side.interface,
                return_interface: to_side.interface,
                flow_nexthop: from_side.nexthop,
                return_nexthop: to_side.nexthop,
                flow_mtu,
                return_mtu: flow.mtu(Side::To),
                flow_mac: flow.node_mac(Side::From),
                return_mac: flow.node_mac(Side::To),
            },
            flags: RuleFlags::default(),
            flow_src_mac: from_side.src_mac,
            return_src_mac: to_side.src_mac,
            vlan: None,
            pppoe: None,
            qos: None,
            igs: None,
            dscp: None,
            mirror: None,
            tcp: None,
        };

        if from_side.vlan[0] != VLAN_NOT_CONFIGURED || to_side.vlan[0] != VLAN_NOT_CONFIGURED {
            rule.vlan = Some(VlanRule {
                ingress: from_side.vlan,
                egress: to_side.vlan,
            });
        }
        if from_side.pppoe_ifnum.is_some() || to_side.pppoe_ifnum.is_some() {
            let pppoe = rule.pppoe_mut();
            pppoe.flow_if_num = from_side.pppoe_ifnum;
            pppoe.return_if_num = to_side.pppoe_ifnum;
        }
        if from_side.vxlan && routed {
            // Both directions share the outer port, and the outer MTU.
            rule.conn.return_mtu = flow_mtu;
            rule.flags.no_src_ident = true;
        }

        if routed {
            rule.flags.routed = true;
        } else {
            rule.flags.bridge_flow = true;
            rule.flags.l2_encap = ctx.is_l2_encap;
        }
        rule.flags.src_interface_check = self.config.src_interface_check;

        if let Some(qos) = decision.rule_qos() {
            rule.qos = Some(QosRule {
                flow_qos_tag: qos.flow,
                return_qos_tag: qos.ret,
            });
        }
        if let Some(igs) = decision.igs_qos {
            rule.igs = Some(IgsRule {
                flow_qos_tag: igs.flow as u16,
                return_qos_tag: igs.ret as u16,
            });
        }
        if let Some(dscp) = decision.dscp {
            rule.dscp = Some(DscpRule {
                flow_dscp: dscp.flow,
                return_dscp: dscp.ret,
            });
            rule.flags.dscp_marking = true;
        }
        rule.flags.emesh_sp = decision.emesh_sp;

        if let Some(targets) = decision.mirror {
            rule.mirror = Some(self.mirror_rule(&targets)?);
        }

        if self.config.vlan_passthrough
            && !routed
            && !rule.vlan.is_some_and(|v| v.is_configured())
            && let Some(tag) = ctx.vlan_tag
        {
            let value = (VLAN_TPID_8021Q << 16) | u32::from(tag);
            let vlan = rule.vlan_mut();
            vlan.ingress[0] = value;
            vlan.egress[0] = value;
        }

        if let Some(tags) = decision.ovs_vlan {
            let vlan = rule.vlan_mut();
            vlan.ingress[0] = tags.ingress;
            vlan.egress[0] = tags.egress;
        }
        if let Some(tags) = decision.ovs_vlan_qinq {
            let vlan = rule.vlan_mut();
            vlan.ingress[1] = tags.ingress;
            vlan.egress[1] = tags.egress;
        }

        if flow.tuple().protocol == TransportProtocol::Tcp {
            rule.tcp = Some(self.tcp_rule(ctx.tcp_window, &mut rule.flags));
        }

        for classifier in flow.assignments() {
            classifier.augment_rule(&mut rule);
        }

        debug!(
            serial = %flow.serial(),
            flow_if = rule.conn.flow_interface,
            return_if = rule.conn.return_interface,
            flags = ?rule.flags,
            "Rule compiled"
        );
        Ok(rule)
    }

    fn walk(&self, side: Side, hierarchy: &InterfaceHierarchy, qos_tag: u32) -> Result<SideRule> {
        let (outer, inner) = match (hierarchy.outermost(), hierarchy.innermost()) {
            (Some(outer), Some(inner)) => (outer, inner),
            _ => return Err(invalid(side, "no interfaces")),
        };
        if outer.engine_ifnum < 0 {
            return Err(invalid(side, &format!("{} unknown to the engine", outer.name)));
        }

        let mut rule = SideRule {
            interface: outer.engine_ifnum,
            nexthop: inner.engine_ifnum,
            src_mac: None,
            vlan: [VLAN_NOT_CONFIGURED; 2],
            pppoe_ifnum: None,
            vxlan: false,
        };
        let mut counts = TypeCounts::default();
        let mut mac_captured = false;

        for iface in hierarchy.iter() {
            trace!(side = %side, iface = %iface, "Examining interface");
            match &iface.kind {
                InterfaceKind::Bridge { mac } | InterfaceKind::OvsBridge { mac } => {
                    if counts.bridge > 0 {
                        return Err(invalid(side, "bridges cannot cascade"));
                    }
                    counts.bridge += 1;
                    if mac.is_unicast() {
                        rule.src_mac = Some(*mac);
                        mac_captured = true;
                    }
                }
                InterfaceKind::Ethernet { mac } => {
                    if counts.ethernet > 0 {
                        continue;
                    }
                    counts.ethernet += 1;
                    if mac.is_unicast() && !mac_captured {
                        rule.src_mac = Some(*mac);
                        mac_captured = true;
                    }
                }
                InterfaceKind::Pppoe { .. } => {
                    if counts.pppoe > 0 {
                        return Err(invalid(side, "nested PPPoE"));
                    }
                    counts.pppoe += 1;
                    if iface.engine_ifnum < 0 {
                        return Err(invalid(
                            side,
                            &format!("PPPoE session {} unknown to the engine", iface.name),
                        ));
                    }
                    rule.pppoe_ifnum = Some(iface.engine_ifnum);
                }
                InterfaceKind::Vlan { mac, tpid, tag } => {
                    if counts.vlan > 1 {
                        return Err(invalid(side, "more than two VLANs"));
                    }
                    let value = (u32::from(*tpid) << 16)
                        | u32::from(*tag)
                        | self.topology.vlan_egress_priority(iface, qos_tag);
                    rule.vlan[counts.vlan as usize] = value;
                    counts.vlan += 1;
                    if mac.is_unicast() && !mac_captured {
                        rule.src_mac = Some(*mac);
                        mac_captured = true;
                    }
                }
                InterfaceKind::MacVlan { mac } => {
                    if mac.is_unicast() {
                        rule.src_mac = Some(*mac);
                        mac_captured = true;
                    }
                }
                InterfaceKind::Ipsec => {
                    if counts.ipsec > 0 {
                        return Err(invalid(side, "nested IPsec"));
                    }
                    counts.ipsec += 1;
                    rule.interface = self.topology.ipsec_ifnum(outer.engine_ifnum);
                    rule.nexthop = self.topology.ipsec_ifnum(rule.nexthop);
                }
                InterfaceKind::Ovpn => {
                    rule.interface = self.topology.vpn_ifnum(outer.engine_ifnum);
                }
                InterfaceKind::Vxlan { .. } if side == Side::From => {
                    if counts.vxlan > 0 {
                        return Err(invalid(side, "nested VxLAN"));
                    }
                    counts.vxlan += 1;
                    rule.vxlan = true;
                }
                InterfaceKind::Vxlan { .. } | InterfaceKind::Other { .. } => {
                    trace!(side = %side, iface = %iface, "Interface contributes nothing to the rule");
                }
            }
        }

        Ok(rule)
    }

    fn mirror_rule(&self, targets: &MirrorTargets) -> Result<MirrorRule> {
        let resolve = |ifindex: Option<u32>| -> Result<Option<i32>> {
            match ifindex {
                None => Ok(None),
                Some(ifindex) => self
                    .topology
                    .mirror_ifnum(ifindex)
                    .map(Some)
                    .ok_or_else(|| {
                        AccelError::RuleInvalid(format!(
                            "mirror interface {ifindex} unknown to the engine"
                        ))
                    }),
            }
        };
        let rule = MirrorRule {
            flow_ifnum: resolve(targets.flow_ifindex)?,
            return_ifnum: resolve(targets.return_ifindex)?,
        };
        if rule.flow_ifnum.is_none() && rule.return_ifnum.is_none() {
            return Err(AccelError::RuleInvalid(
                "mirroring requested without a mirror interface".into(),
            ));
        }
        Ok(rule)
    }

    fn tcp_rule(&self, window: Option<TcpWindowState>, flags: &mut RuleFlags) -> TcpRule {
        let Some(window) = window else {
            flags.no_seq_check = true;
            return TcpRule::default();
        };
        if self.config.tcp_be_liberal
            || self.config.tcp_no_window_check
            || window.original.liberal
            || window.reply.liberal
        {
            flags.no_seq_check = true;
        }
        let side = |s: &TcpWindowSide| TcpWindow {
            scale: s.scale,
            max_window: s.max_window,
            end: s.end,
            max_end: s.max_end,
        };
        TcpRule {
            flow: side(&window.original),
            ret: side(&window.reply),
        }
    }
}

fn invalid(side: Side, reason: &str) -> AccelError {
    debug!(side = %side, reason, "Rule invalid");
    AccelError::RuleInvalid(format!("{side} side: {reason}"))
}
