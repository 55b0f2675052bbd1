//! Traffic classifiers.
//!
//! Classifiers are pluggable per-flow policy components. Every flow carries
//! the mandatory [`DefaultClassifier`] plus one instance of every other
//! registered kind; on each packet they return a [`Verdict`] and the
//! verdicts are merged by [`aggregate`].

mod aggregate;
mod default;

pub use aggregate::{Aggregation, Decision, aggregate};
pub use default::DefaultClassifier;

use std::fmt;
use std::sync::Arc;

use crate::error::{AccelError, Result};
use crate::flow::{FlowTuple, Sender, TimerGroup};
use crate::packet::Packet;
use crate::rule::CreateRule;

/// Classifier types in ascending priority order.
///
/// Later kinds run after earlier ones and win wherever the last opinion
/// counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClassifierKind {
    Default,
    Dscp,
    /// Per-connection control (mirroring, accel policy).
    Pcc,
    /// Service prioritisation for mesh backhaul.
    Emesh,
    /// Open vSwitch flow classifier.
    Ovs,
    Mark,
}

impl ClassifierKind {
    pub fn priority(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClassifierKind::Default => "default",
            ClassifierKind::Dscp => "dscp",
            ClassifierKind::Pcc => "pcc",
            ClassifierKind::Emesh => "emesh",
            ClassifierKind::Ovs => "ovs",
            ClassifierKind::Mark => "mark",
        }
    }
}

impl fmt::Display for ClassifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How sure a classifier is that it applies to the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    No,
    Maybe,
    Yes,
}

/// A classifier's acceleration opinion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelPermission {
    No,
    Accel,
}

/// Per-direction QoS tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QosTags {
    pub flow: u32,
    pub ret: u32,
}

/// Per-direction DSCP remark values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DscpRemark {
    pub flow: u8,
    pub ret: u8,
}

/// Ingress/egress VLAN tag pair supplied by a virtual switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlanTagPair {
    pub ingress: u32,
    pub egress: u32,
}

/// Interfaces (by host ifindex) that should receive mirrored copies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorTargets {
    pub flow_ifindex: Option<u32>,
    pub return_ifindex: Option<u32>,
}

/// Result of running one classifier on one packet.
///
/// `None`/`false` fields mean the classifier has no opinion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub relevance: Relevance,
    pub drop: bool,
    pub accel: Option<AccelPermission>,
    pub timer_group: Option<TimerGroup>,
    pub timer_no_touch: bool,
    pub qos: Option<QosTags>,
    pub igs_qos: Option<QosTags>,
    pub dscp: Option<DscpRemark>,
    pub deny_dscp: bool,
    pub ovs_vlan: Option<VlanTagPair>,
    pub ovs_vlan_qinq: Option<VlanTagPair>,
    pub emesh_sp: bool,
    pub mirror: Option<MirrorTargets>,
}

impl Verdict {
    fn with_relevance(relevance: Relevance) -> Self {
        Self {
            relevance,
            drop: false,
            accel: None,
            timer_group: None,
            timer_no_touch: false,
            qos: None,
            igs_qos: None,
            dscp: None,
            deny_dscp: false,
            ovs_vlan: None,
            ovs_vlan_qinq: None,
            emesh_sp: false,
            mirror: None,
        }
    }

    pub fn relevant() -> Self {
        Self::with_relevance(Relevance::Yes)
    }

    pub fn maybe() -> Self {
        Self::with_relevance(Relevance::Maybe)
    }

    pub fn not_relevant() -> Self {
        Self::with_relevance(Relevance::No)
    }

    pub fn permit_accel(mut self) -> Self {
        self.accel = Some(AccelPermission::Accel);
        self
    }

    pub fn deny_accel(mut self) -> Self {
        self.accel = Some(AccelPermission::No);
        self
    }

    pub fn dropping(mut self) -> Self {
        self.drop = true;
        self
    }

    pub fn timer_group(mut self, group: TimerGroup) -> Self {
        self.timer_group = Some(group);
        self
    }

    pub fn no_touch(mut self) -> Self {
        self.timer_no_touch = true;
        self
    }

    pub fn qos(mut self, flow: u32, ret: u32) -> Self {
        self.qos = Some(QosTags { flow, ret });
        self
    }

    pub fn igs_qos(mut self, flow: u32, ret: u32) -> Self {
        self.igs_qos = Some(QosTags { flow, ret });
        self
    }

    pub fn dscp(mut self, flow: u8, ret: u8) -> Self {
        self.dscp = Some(DscpRemark { flow, ret });
        self
    }

    pub fn deny_dscp(mut self) -> Self {
        self.deny_dscp = true;
        self
    }

    pub fn ovs_vlan(mut self, ingress: u32, egress: u32) -> Self {
        self.ovs_vlan = Some(VlanTagPair { ingress, egress });
        self
    }

    pub fn ovs_vlan_qinq(mut self, ingress: u32, egress: u32) -> Self {
        self.ovs_vlan_qinq = Some(VlanTagPair { ingress, egress });
        self
    }

    pub fn emesh_sp(mut self) -> Self {
        self.emesh_sp = true;
        self
    }

    pub fn mirror(mut self, flow_ifindex: Option<u32>, return_ifindex: Option<u32>) -> Self {
        self.mirror = Some(MirrorTargets {
            flow_ifindex,
            return_ifindex,
        });
        self
    }
}

/// A per-flow classifier instance.
pub trait Classifier: Send + Sync {
    fn kind(&self) -> ClassifierKind;

    /// Inspect a packet of the flow.
    fn process(&self, sender: Sender, packet: &Packet) -> Verdict;

    /// Contribute to an offload rule being compiled. Called in ascending
    /// priority order, so later classifiers overwrite earlier ones.
    fn augment_rule(&self, _rule: &mut CreateRule) {}
}

/// Creates classifier instances for new flows.
pub trait ClassifierFactory: Send + Sync {
    fn kind(&self) -> ClassifierKind;

    fn instantiate(&self, tuple: &FlowTuple) -> Result<Arc<dyn Classifier>>;
}

/// Registered classifier kinds beyond the default one.
#[derive(Default)]
pub struct ClassifierRegistry {
    factories: Vec<Arc<dyn ClassifierFactory>>,
}

impl ClassifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. The default kind is built in and cannot be
    /// registered; a second factory for a kind replaces the first.
    pub fn register(&mut self, factory: Arc<dyn ClassifierFactory>) -> Result<()> {
        if factory.kind() == ClassifierKind::Default {
            return Err(AccelError::Config(
                "the default classifier is built in".into(),
            ));
        }
        self.factories.retain(|f| f.kind() != factory.kind());
        self.factories.push(factory);
        self.factories.sort_by_key(|f| f.kind());
        Ok(())
    }

    pub fn kinds(&self) -> Vec<ClassifierKind> {
        self.factories.iter().map(|f| f.kind()).collect()
    }

    /// Instantiate one classifier of every registered kind for a new flow.
    pub fn instantiate_all(&self, tuple: &FlowTuple) -> Result<Vec<Arc<dyn Classifier>>> {
        self.factories
            .iter()
            .map(|factory| factory.instantiate(tuple))
            .collect()
    }
}

impl fmt::Debug for ClassifierRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
