//! Shared fixtures for the integration tests: a controller wired to the
//! simulated engine, a topology builder and scripted classifiers.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv6Addr};
use std::sync::{Arc, Mutex, Weak};

use crossbeam_channel::Receiver;
use smoltcp::wire::EthernetAddress;

use mvirt_accel::classifier::{
    Classifier, ClassifierFactory, ClassifierKind, ClassifierRegistry, Decision,
    DefaultClassifier, Verdict,
};
use mvirt_accel::compile::CompileContext;
use mvirt_accel::engine::{EngineEvent, SimEngine, SimEngineConfig, event_channel};
use mvirt_accel::flow::{
    FlowDirection, FlowRecord, FlowTuple, Interface, Sender, TimerGroup, TransportProtocol,
};
use mvirt_accel::packet::{ConnTrack, Packet, PacketMeta};
use mvirt_accel::rule::CreateRule;
use mvirt_accel::topology::{StaticTopology, TopologyResolver};
use mvirt_accel::{
    AccelConfig, AccelController, AccelLimits, FlowDatabase, GlobalCounters, MemoryFlowDb, Result,
};

pub const LAN_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0x01, 0x01]);
pub const WAN_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0x02, 0x01]);
pub const NODE_MAC: EthernetAddress = EthernetAddress([0x02, 0, 0, 0, 0x03, 0x01]);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

pub fn lan(last: u16) -> IpAddr {
    IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, last))
}

pub fn wan(last: u16) -> IpAddr {
    IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, last))
}

pub fn limits(nack: u32, driver_fail: u32, no_action: u32) -> AccelLimits {
    AccelLimits {
        nack,
        driver_fail,
        no_action,
    }
}

/// Builds a [`StaticTopology`] one endpoint at a time.
#[derive(Default)]
pub struct TopologyBuilder {
    topology: StaticTopology,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host on the plain LAN port.
    pub fn lan_host(self, addr: IpAddr) -> Self {
        self.endpoint(addr, vec![Interface::ethernet("eth1", 2, LAN_MAC)])
    }

    /// Host reached through the PPPoE uplink.
    pub fn wan_host(self, addr: IpAddr) -> Self {
        self.endpoint(
            addr,
            vec![
                Interface::ethernet("eth0", 1, WAN_MAC),
                Interface::pppoe("pppoe-wan", 9, 0x11, NODE_MAC),
            ],
        )
    }

    pub fn endpoint(self, addr: IpAddr, interfaces: Vec<Interface>) -> Self {
        self.topology
            .add_endpoint(addr, interfaces.into_iter().collect(), NODE_MAC);
        self
    }

    pub fn build(self) -> Arc<StaticTopology> {
        Arc::new(self.topology)
    }
}

/// Classifier returning a fixed verdict, replaceable at runtime.
pub struct ScriptedClassifier {
    kind: ClassifierKind,
    verdict: Mutex<Verdict>,
    augment: Option<fn(&mut CreateRule)>,
}

impl ScriptedClassifier {
    pub fn set_verdict(&self, verdict: Verdict) {
        *self.verdict.lock().unwrap() = verdict;
    }
}

impl Classifier for ScriptedClassifier {
    fn kind(&self) -> ClassifierKind {
        self.kind
    }

    fn process(&self, _sender: Sender, _packet: &Packet) -> Verdict {
        self.verdict.lock().unwrap().clone()
    }

    fn augment_rule(&self, rule: &mut CreateRule) {
        if let Some(augment) = self.augment {
            augment(rule);
        }
    }
}

/// Factory for [`ScriptedClassifier`]s that remembers every instance.
pub struct ScriptedFactory {
    kind: ClassifierKind,
    verdict: Verdict,
    augment: Option<fn(&mut CreateRule)>,
    instances: Mutex<Vec<Weak<ScriptedClassifier>>>,
}

impl ScriptedFactory {
    pub fn new(kind: ClassifierKind, verdict: Verdict) -> Arc<Self> {
        Arc::new(Self {
            kind,
            verdict,
            augment: None,
            instances: Mutex::new(Vec::new()),
        })
    }

    pub fn augmenting(
        kind: ClassifierKind,
        verdict: Verdict,
        augment: fn(&mut CreateRule),
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            verdict,
            augment: Some(augment),
            instances: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Instances still referenced by someone.
    pub fn live(&self) -> Vec<Arc<ScriptedClassifier>> {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl ClassifierFactory for ScriptedFactory {
    fn kind(&self) -> ClassifierKind {
        self.kind
    }

    fn instantiate(&self, _tuple: &FlowTuple) -> Result<Arc<dyn Classifier>> {
        let instance = Arc::new(ScriptedClassifier {
            kind: self.kind,
            verdict: Mutex::new(self.verdict.clone()),
            augment: self.augment,
        });
        self.instances
            .lock()
            .unwrap()
            .push(Arc::downgrade(&instance));
        Ok(instance)
    }
}

/// Controller wired to a simulated engine. Engine events stay on the
/// channel until the test applies them.
pub struct Harness {
    pub controller: Arc<AccelController>,
    pub db: Arc<MemoryFlowDb>,
    pub engine: Arc<SimEngine>,
    pub events: Receiver<EngineEvent>,
    pub topology: Arc<StaticTopology>,
}

impl Harness {
    pub fn new(config: AccelConfig) -> Self {
        Self::build(config, ClassifierRegistry::new(), SimEngineConfig::default())
    }

    pub fn with_limits(limits: AccelLimits) -> Self {
        Self::new(AccelConfig {
            limits,
            ..AccelConfig::default()
        })
    }

    pub fn with_classifiers(registry: ClassifierRegistry) -> Self {
        Self::build(AccelConfig::default(), registry, SimEngineConfig::default())
    }

    pub fn build(
        config: AccelConfig,
        registry: ClassifierRegistry,
        engine: SimEngineConfig,
    ) -> Self {
        init_tracing();
        let (sender, events) = event_channel(4096);
        let engine = Arc::new(SimEngine::new(sender, engine));
        let topology = TopologyBuilder::new()
            .lan_host(lan(1))
            .lan_host(lan(2))
            .wan_host(wan(1))
            .build();
        let resolver: Arc<dyn TopologyResolver> = topology.clone();
        let db = Arc::new(MemoryFlowDb::new());
        let controller = AccelController::new(
            db.clone(),
            engine.clone(),
            resolver,
            Arc::new(GlobalCounters::new()),
            config,
        )
        .with_classifiers(registry);
        Self {
            controller: Arc::new(controller),
            db,
            engine,
            events,
            topology,
        }
    }

    /// Insert a routed flow from `lan(1)` to `wan(1)` without sending
    /// any packet through the controller.
    pub fn insert_flow(&self, protocol: TransportProtocol, src_port: u16) -> Arc<FlowRecord> {
        let tuple = FlowTuple::new(protocol, lan(1), src_port, wan(1), 443);
        let db = self.controller.db();
        let from = self.topology.resolve(tuple.src).unwrap();
        let to = self.topology.resolve(tuple.dst).unwrap();
        let record = FlowRecord::builder(db.next_serial(), tuple, FlowDirection::NonNat)
            .limits(self.controller.config().limits)
            .from_side(from)
            .to_side(to)
            .classifier(Arc::new(DefaultClassifier::new(&tuple)))
            .build()
            .unwrap();
        db.insert_or_get(record).0
    }

    pub fn accelerate(&self, flow: &Arc<FlowRecord>) -> Result<()> {
        let decision = Decision::initial(0, TimerGroup::TcpLong);
        let ctx = CompileContext {
            decision: &decision,
            tcp_window: None,
            vlan_tag: None,
            is_l2_encap: false,
        };
        self.controller.accelerate(flow, &ctx)
    }

    /// Apply every event the engine has emitted so far.
    pub fn deliver(&self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events.try_recv() {
            self.controller.handle_event(event);
            applied += 1;
        }
        applied
    }

    /// Let the engine answer everything queued, repeatedly, until no
    /// further events are produced.
    pub fn settle(&self) {
        loop {
            self.engine.pump();
            if self.deliver() == 0 && self.engine.queued() == 0 {
                break;
            }
        }
    }
}

/// A packet of an established UDP session from `lan(1)` to `wan(1)`.
pub fn udp_packet(src_port: u16, dst_port: u16) -> (Packet, PacketMeta) {
    let packet = Packet::new(lan(1), wan(1), 17, src_port, dst_port, 512);
    let mut ct = ConnTrack::established(src_port, dst_port);
    ct.tcp_state = None;
    (packet, PacketMeta::routed(Some(ct), Sender::Src))
}

/// A packet of an established TCP session from `lan(1)` to `wan(1)`.
pub fn tcp_packet(src_port: u16, dst_port: u16) -> (Packet, PacketMeta) {
    let packet = Packet::new(lan(1), wan(1), 6, src_port, dst_port, 1400);
    let ct = ConnTrack::established(src_port, dst_port);
    (packet, PacketMeta::routed(Some(ct), Sender::Src))
}
