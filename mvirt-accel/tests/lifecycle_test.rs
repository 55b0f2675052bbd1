//! Create/destroy lifecycle against the simulated engine.

mod harness;

use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use harness::{Harness, LAN_MAC, NODE_MAC, lan, limits};
use mvirt_accel::classifier::{Classifier, ClassifierKind, Verdict};
use mvirt_accel::engine::{CommandKind, EngineEvent, ResponseOutcome, spawn_dispatcher};
use mvirt_accel::flow::{
    FlowRecord, FlowSerial, Interface, InterfaceKind, Sender, TransportProtocol,
};
use mvirt_accel::packet::Packet;
use mvirt_accel::rule::CreateRule;
use mvirt_accel::{AccelError, AccelMode, FlowDatabase};

const NACK: ResponseOutcome = ResponseOutcome::Nack { error: 1 };

/// Reports a topology change for its flow while the rule is being built.
struct TopologyChurn {
    flow: Weak<FlowRecord>,
}

impl Classifier for TopologyChurn {
    fn kind(&self) -> ClassifierKind {
        ClassifierKind::Mark
    }

    fn process(&self, _sender: Sender, _packet: &Packet) -> Verdict {
        Verdict::relevant().permit_accel()
    }

    fn augment_rule(&self, _rule: &mut CreateRule) {
        if let Some(flow) = self.flow.upgrade() {
            flow.needs_regeneration();
        }
    }
}

#[test]
fn test_nack_limit_reaches_fail_accel_engine() {
    let h = Harness::with_limits(limits(3, 250, 250));
    let flow = h.insert_flow(TransportProtocol::Tcp, 40000);

    for attempt in 1..=3 {
        h.accelerate(&flow).unwrap();
        assert_eq!(flow.accel().mode(), AccelMode::AccelPending);
        h.engine.respond(flow.serial(), CommandKind::Create, NACK);
        h.deliver();
        assert_eq!(h.controller.counters().accelerated, 0);
        let snap = h.controller.state_get(&flow);
        assert_eq!(snap.nack.current, attempt);
    }

    assert_eq!(flow.accel().mode(), AccelMode::FailAccelEngine);
    assert!(matches!(h.accelerate(&flow), Err(AccelError::EngineRejected)));
    assert_eq!(h.controller.inflight_len(), 0);
}

#[test]
fn test_cease_before_ack_never_counts_acceleration() {
    let h = Harness::with_limits(limits(250, 250, 250));
    let flow = h.insert_flow(TransportProtocol::Udp, 40000);

    h.accelerate(&flow).unwrap();
    h.engine.cease(flow.serial());
    h.engine
        .respond(flow.serial(), CommandKind::Create, ResponseOutcome::Ack);
    h.deliver();

    assert_eq!(flow.accel().mode(), AccelMode::Decel);
    assert_eq!(flow.accel().flush_happened_total(), 1);
    let counters = h.controller.counters();
    assert_eq!(counters.accelerated, 0);
    assert_eq!(counters.udp_accelerated, 0);
    assert_eq!(h.controller.inflight_len(), 0);
}

#[test]
fn test_repeated_flush_races_count_no_action() {
    let h = Harness::with_limits(limits(250, 250, 250));
    let flow = h.insert_flow(TransportProtocol::Udp, 40000);

    for _ in 0..3 {
        h.accelerate(&flow).unwrap();
        h.engine.cease(flow.serial());
        h.engine
            .respond(flow.serial(), CommandKind::Create, ResponseOutcome::Ack);
        h.deliver();
        assert_eq!(flow.accel().mode(), AccelMode::Decel);
    }

    let snap = h.controller.state_get(&flow);
    assert_eq!(snap.no_action_seen.current, 3);
    assert_eq!(snap.no_action_seen.total, 0);
    assert_eq!(snap.flush_happened_total, 3);
    assert!(!snap.flush_happened);
    assert_eq!(h.controller.counters().accelerated, 0);
}

#[test]
fn test_counters_pair_across_destroy_and_flush() {
    let h = Harness::with_limits(limits(250, 250, 250));
    let flows: Vec<_> = (0..8)
        .map(|i| h.insert_flow(TransportProtocol::Udp, 40000 + i))
        .collect();

    for flow in &flows {
        h.accelerate(flow).unwrap();
    }
    h.settle();
    let counters = h.controller.counters();
    assert_eq!(counters.accelerated, 8);
    assert_eq!(counters.udp_accelerated, 8);
    assert_eq!(counters.tcp_accelerated, 0);

    for flow in &flows[..4] {
        assert!(h.controller.decelerate(flow));
    }
    assert_eq!(h.controller.counters().pending_decel, 4);
    h.engine.flush_all();
    h.settle();

    let counters = h.controller.counters();
    assert_eq!(counters.accelerated, 0);
    assert_eq!(counters.pending_decel, 0);
    assert_eq!(h.controller.inflight_len(), 0);
    assert_eq!(h.engine.offloaded(), 0);
    for flow in &flows {
        assert_eq!(flow.accel().mode(), AccelMode::Decel);
    }
}

#[test]
fn test_decelerate_while_pending_is_actioned_on_ack() {
    let h = Harness::with_limits(limits(250, 250, 250));
    let flow = h.insert_flow(TransportProtocol::Tcp, 40000);

    h.accelerate(&flow).unwrap();
    assert!(!h.controller.decelerate(&flow));
    assert!(h.controller.state_get(&flow).decelerate_pending);

    h.settle();

    assert_eq!(flow.accel().mode(), AccelMode::Decel);
    let kinds: Vec<_> = h.engine.commands().iter().map(|c| c.kind()).collect();
    assert_eq!(kinds, vec![CommandKind::Create, CommandKind::Destroy]);
    let counters = h.controller.counters();
    assert_eq!(counters.accelerated, 0);
    assert_eq!(counters.pending_decel, 0);
    assert_eq!(h.controller.state_get(&flow).no_action_seen.current, 0);
}

#[test]
fn test_response_for_unknown_serial_is_ignored() {
    let h = Harness::with_limits(limits(250, 250, 250));
    let flow = h.insert_flow(TransportProtocol::Udp, 40000);
    h.accelerate(&flow).unwrap();

    h.controller.handle_event(EngineEvent::Response {
        serial: FlowSerial(9999),
        kind: CommandKind::Create,
        outcome: ResponseOutcome::Ack,
    });
    h.controller.handle_event(EngineEvent::Ceased {
        serial: FlowSerial(9999),
    });

    assert_eq!(flow.accel().mode(), AccelMode::AccelPending);
    assert_eq!(h.controller.inflight_len(), 1);
    assert_eq!(h.controller.counters().accelerated, 0);
}

#[test]
fn test_response_of_wrong_kind_is_discarded() {
    let h = Harness::with_limits(limits(250, 250, 250));
    let flow = h.insert_flow(TransportProtocol::Udp, 40000);
    h.accelerate(&flow).unwrap();

    h.controller.handle_event(EngineEvent::Response {
        serial: flow.serial(),
        kind: CommandKind::Destroy,
        outcome: ResponseOutcome::Ack,
    });

    assert_eq!(flow.accel().mode(), AccelMode::AccelPending);
    assert_eq!(h.controller.inflight_len(), 1);
    assert_eq!(h.controller.counters().pending_decel, 0);

    h.settle();
    assert_eq!(flow.accel().mode(), AccelMode::Accel);
}

#[test]
fn test_transmit_failures_reach_fail_driver() {
    let h = Harness::with_limits(limits(250, 2, 250));
    let flow = h.insert_flow(TransportProtocol::Tcp, 40000);
    h.engine.set_offline(true);

    assert!(matches!(h.accelerate(&flow), Err(AccelError::EngineUnavailable)));
    assert_eq!(flow.accel().mode(), AccelMode::Decel);
    assert!(matches!(h.accelerate(&flow), Err(AccelError::EngineUnavailable)));
    assert_eq!(flow.accel().mode(), AccelMode::FailDriver);

    h.engine.set_offline(false);
    assert!(matches!(h.accelerate(&flow), Err(AccelError::EngineUnavailable)));
    assert!(h.engine.commands().is_empty());
    assert_eq!(h.controller.inflight_len(), 0);
}

#[test]
fn test_successful_transmit_resets_driver_fail() {
    let h = Harness::with_limits(limits(250, 2, 250));
    let flow = h.insert_flow(TransportProtocol::Tcp, 40000);

    h.engine.fail_next(1);
    assert!(h.accelerate(&flow).is_err());
    h.accelerate(&flow).unwrap();
    h.settle();
    assert_eq!(h.controller.state_get(&flow).driver_fail.current, 0);

    // One more failure alone must not reach the limit of two
    h.engine.fail_next(1);
    assert!(!h.controller.decelerate(&flow));
    assert_eq!(flow.accel().mode(), AccelMode::Accel);
    assert_eq!(h.controller.counters().pending_decel, 0);
}

#[test]
fn test_destroy_transmit_failure_at_limit_gives_up() {
    let h = Harness::with_limits(limits(250, 1, 250));
    let flow = h.insert_flow(TransportProtocol::Udp, 40000);
    h.accelerate(&flow).unwrap();
    h.settle();
    assert_eq!(h.controller.counters().accelerated, 1);

    h.engine.set_offline(true);
    assert!(!h.controller.decelerate(&flow));

    assert_eq!(flow.accel().mode(), AccelMode::FailDecel);
    let counters = h.controller.counters();
    assert_eq!(counters.accelerated, 0);
    assert_eq!(counters.pending_decel, 0);
}

#[test]
fn test_defunct_while_pending_removed_after_nack() {
    let h = Harness::with_limits(limits(250, 250, 250));
    let flow = h.insert_flow(TransportProtocol::Udp, 40000);
    let serial = flow.serial();
    h.accelerate(&flow).unwrap();

    assert!(!h.controller.make_defunct(&flow));
    assert!(h.controller.db().lookup_by_serial(serial).is_some());

    h.engine.respond(serial, CommandKind::Create, NACK);
    h.deliver();

    assert_eq!(flow.accel().mode(), AccelMode::FailDefunct);
    assert!(h.controller.db().lookup(flow.tuple()).is_none());
    assert_eq!(h.controller.inflight_len(), 0);
}

#[test]
fn test_defunct_while_pending_destroys_after_ack() {
    let h = Harness::with_limits(limits(250, 250, 250));
    let flow = h.insert_flow(TransportProtocol::Tcp, 40000);
    h.accelerate(&flow).unwrap();
    assert!(!h.controller.make_defunct(&flow));

    h.settle();

    assert_eq!(flow.accel().mode(), AccelMode::FailDefunct);
    assert!(h.controller.db().is_empty());
    let counters = h.controller.counters();
    assert_eq!(counters.accelerated, 0);
    assert_eq!(counters.pending_decel, 0);
    assert_eq!(h.controller.inflight_len(), 0);

    let weak = Arc::downgrade(&flow);
    drop(flow);
    assert!(weak.upgrade().is_none());
}

#[test]
fn test_defunct_retried_after_destroy_transmit_failure() {
    let h = Harness::with_limits(limits(250, 250, 250));
    let flow = h.insert_flow(TransportProtocol::Udp, 40000);
    h.accelerate(&flow).unwrap();
    h.settle();

    h.engine.set_offline(true);
    assert!(!h.controller.make_defunct(&flow));
    assert_eq!(flow.accel().mode(), AccelMode::Accel);
    assert_eq!(h.controller.db().len(), 1);

    h.engine.set_offline(false);
    assert!(h.controller.make_defunct(&flow));
    assert!(h.controller.db().is_empty());

    h.settle();
    assert_eq!(flow.accel().mode(), AccelMode::FailDefunct);
    assert_eq!(h.controller.counters().accelerated, 0);
    assert_eq!(h.controller.inflight_len(), 0);
}

#[test]
fn test_no_action_limit_after_idle_accelerations() {
    let h = Harness::with_limits(limits(250, 250, 2));
    let flow = h.insert_flow(TransportProtocol::Udp, 40000);

    h.accelerate(&flow).unwrap();
    h.settle();
    h.engine.cease(flow.serial());
    h.deliver();
    assert_eq!(flow.accel().mode(), AccelMode::Decel);

    h.accelerate(&flow).unwrap();
    h.settle();
    h.engine.cease(flow.serial());
    h.deliver();

    assert_eq!(flow.accel().mode(), AccelMode::FailNoAction);
    assert!(matches!(h.accelerate(&flow), Err(AccelError::NoProgress)));
    assert_eq!(h.controller.counters().accelerated, 0);
}

#[test]
fn test_activity_keeps_flow_below_no_action_limit() {
    let h = Harness::with_limits(limits(250, 250, 2));
    let flow = h.insert_flow(TransportProtocol::Udp, 40000);

    for _ in 0..4 {
        h.accelerate(&flow).unwrap();
        h.settle();
        h.engine.report_activity();
        h.engine.cease(flow.serial());
        h.deliver();
        assert_eq!(flow.accel().mode(), AccelMode::Decel);
    }
    assert_eq!(h.controller.state_get(&flow).no_action_seen.current, 0);
}

#[test]
fn test_terminate_pending_refuses_new_creates() {
    let h = Harness::with_limits(limits(250, 250, 250));
    let flow = h.insert_flow(TransportProtocol::Udp, 40000);
    h.controller.set_terminate_pending();

    assert!(matches!(h.accelerate(&flow), Err(AccelError::NotPermitted(_))));
    assert_eq!(flow.accel().mode(), AccelMode::Decel);
    assert!(h.controller.counters().terminate_pending);
}

#[test]
fn test_dispatcher_applies_engine_events() {
    let h = Harness::with_limits(limits(250, 250, 250));
    let dispatcher = spawn_dispatcher(h.controller.clone(), h.events.clone()).unwrap();
    let flows: Vec<_> = (0..16)
        .map(|i| h.insert_flow(TransportProtocol::Tcp, 40000 + i))
        .collect();
    for flow in &flows {
        h.accelerate(flow).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.controller.counters().accelerated < 16 && Instant::now() < deadline {
        h.engine.pump();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(h.controller.counters().tcp_accelerated, 16);

    h.controller.set_terminate_pending();
    assert_eq!(h.controller.decelerate_all(), 16);
    let deadline = Instant::now() + Duration::from_secs(5);
    while flows.iter().any(|f| f.accel().mode() != AccelMode::Decel) && Instant::now() < deadline
    {
        h.engine.pump();
        thread::sleep(Duration::from_millis(5));
    }

    dispatcher.stop();
    drop(dispatcher);

    let counters = h.controller.counters();
    assert_eq!(counters.accelerated, 0);
    assert_eq!(counters.pending_decel, 0);
    assert!(flows.iter().all(|f| f.accel().mode() == AccelMode::Decel));
}

#[test]
fn test_topology_change_during_compile_aborts_create() {
    let h = Harness::with_limits(limits(250, 250, 250));
    let flow = h.insert_flow(TransportProtocol::Tcp, 40000);
    flow.assign(Arc::new(TopologyChurn {
        flow: Arc::downgrade(&flow),
    }));

    assert!(matches!(h.accelerate(&flow), Err(AccelError::StaleTopology)));
    assert_eq!(flow.accel().mode(), AccelMode::Decel);
    assert!(h.engine.commands().is_empty());
    assert_eq!(h.controller.inflight_len(), 0);
    assert!(flow.take_regeneration_required());

    // Once the classifier is gone the next attempt goes through
    flow.unassign(ClassifierKind::Mark);
    h.accelerate(&flow).unwrap();
    h.settle();
    assert_eq!(flow.accel().mode(), AccelMode::Accel);
    assert_eq!(h.controller.counters().accelerated, 1);
}

#[test]
fn test_uncompilable_hierarchy_fails_rule() {
    let h = Harness::with_limits(limits(250, 250, 250));
    h.topology.add_endpoint(
        lan(1),
        [
            Interface::bridge("br-lan", 5, LAN_MAC),
            Interface::new("ovs-br0", 6, 1500, InterfaceKind::OvsBridge { mac: LAN_MAC }),
        ]
        .into_iter()
        .collect(),
        NODE_MAC,
    );
    let flow = h.insert_flow(TransportProtocol::Udp, 40000);

    assert!(matches!(h.accelerate(&flow), Err(AccelError::RuleInvalid(_))));
    assert_eq!(flow.accel().mode(), AccelMode::FailRule);
    assert!(h.engine.commands().is_empty());
    assert_eq!(h.controller.inflight_len(), 0);
    assert_eq!(h.controller.counters().accelerated, 0);

    // The failure sticks without another compilation attempt
    assert!(matches!(h.accelerate(&flow), Err(AccelError::RuleInvalid(_))));
    assert!(h.engine.commands().is_empty());
}
