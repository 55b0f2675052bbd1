//! Merging of classifier verdicts into one decision.

use std::sync::Arc;

use tracing::trace;

use super::{
    AccelPermission, Classifier, ClassifierKind, DscpRemark, MirrorTargets, QosTags, Relevance,
    VlanTagPair,
};
use crate::flow::{Sender, TimerGroup};
use crate::packet::Packet;

/// Merged verdict of all classifiers assigned to a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub accel: AccelPermission,
    pub drop: bool,
    pub timer_group: TimerGroup,
    pub timer_no_touch: bool,
    /// Effective QoS tags; the packet priority unless a classifier set them.
    pub qos: QosTags,
    /// A classifier set `qos` explicitly.
    pub qos_classified: bool,
    pub igs_qos: Option<QosTags>,
    pub dscp: Option<DscpRemark>,
    pub dscp_denied: bool,
    pub ovs_vlan: Option<VlanTagPair>,
    pub ovs_vlan_qinq: Option<VlanTagPair>,
    pub emesh_sp: bool,
    pub mirror: Option<MirrorTargets>,
}

impl Decision {
    /// Starting point of a pass: accelerate, keep the flow's timer group
    /// and tag with the packet's own priority.
    pub fn initial(priority: u32, timer_group: TimerGroup) -> Self {
        Self {
            accel: AccelPermission::Accel,
            drop: false,
            timer_group,
            timer_no_touch: false,
            qos: QosTags {
                flow: priority,
                ret: priority,
            },
            qos_classified: false,
            igs_qos: None,
            dscp: None,
            dscp_denied: false,
            ovs_vlan: None,
            ovs_vlan_qinq: None,
            emesh_sp: false,
            mirror: None,
        }
    }

    pub fn permits_accel(&self) -> bool {
        self.accel == AccelPermission::Accel
    }

    /// QoS tags to program into a rule, if a classifier chose them.
    pub fn rule_qos(&self) -> Option<QosTags> {
        self.qos_classified.then_some(self.qos)
    }
}

/// Outcome of one aggregation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregation {
    pub decision: Decision,
    /// Classifiers that reported themselves irrelevant and must be
    /// unassigned from the flow.
    pub unassign: Vec<ClassifierKind>,
}

/// Run every classifier in priority order and merge their verdicts.
///
/// Denials are sticky for the pass: once acceleration or DSCP remarking is
/// denied no later classifier can re-enable it. Value opinions (timer group,
/// QoS, DSCP, mirror, VLAN tags) follow the last classifier that has one.
pub fn aggregate(
    classifiers: &[Arc<dyn Classifier>],
    sender: Sender,
    packet: &Packet,
    initial: Decision,
) -> Aggregation {
    let mut decision = initial;
    let mut unassign = Vec::new();

    for classifier in classifiers {
        let kind = classifier.kind();
        let verdict = classifier.process(sender, packet);
        trace!(
            classifier = %kind,
            relevance = ?verdict.relevance,
            drop = verdict.drop,
            accel = ?verdict.accel,
            "Classifier verdict"
        );

        if verdict.relevance == Relevance::No {
            if kind != ClassifierKind::Default {
                unassign.push(kind);
            }
            continue;
        }

        decision.drop |= verdict.drop;

        if verdict.relevance == Relevance::Maybe {
            decision.accel = AccelPermission::No;
        } else if verdict.accel == Some(AccelPermission::No) {
            decision.accel = AccelPermission::No;
        }

        if let Some(group) = verdict.timer_group {
            decision.timer_group = group;
        }
        decision.timer_no_touch |= verdict.timer_no_touch;

        if let Some(tags) = verdict.ovs_vlan {
            decision.ovs_vlan = Some(tags);
        }
        if let Some(tags) = verdict.ovs_vlan_qinq {
            decision.ovs_vlan_qinq = Some(tags);
        }

        if let Some(qos) = verdict.qos {
            decision.qos = qos;
            decision.qos_classified = true;
        }
        if let Some(igs) = verdict.igs_qos {
            decision.igs_qos = Some(igs);
        }

        if verdict.deny_dscp {
            decision.dscp_denied = true;
            decision.dscp = None;
        }
        if verdict.dscp.is_some() && !decision.dscp_denied {
            decision.dscp = verdict.dscp;
        }

        decision.emesh_sp |= verdict.emesh_sp;

        if let Some(mirror) = verdict.mirror {
            decision.mirror = Some(mirror);
        }
    }

    Aggregation { decision, unassign }
}
