//! Acceleration controller.
//!
//! Ties the flow database, the rule compiler and the engine together. The
//! packet path reaches it through [`AccelController::process_flow`]; engine
//! events are applied with [`AccelController::handle_event`], normally from
//! the dispatcher thread.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use arc_swap::ArcSwap;
use tracing::{debug, info, trace, warn};

use crate::classifier::ClassifierRegistry;
use crate::compile::{CompileContext, RuleCompiler};
use crate::config::{AccelConfig, AccelLimits};
use crate::counters::{CounterSnapshot, GlobalCounters};
use crate::db::FlowDatabase;
use crate::engine::{CommandKind, Engine, EngineCommand, EngineEvent, ResponseOutcome};
use crate::error::{AccelError, Result};
use crate::flow::{FlowRecord, FlowSerial};
use crate::rule::DestroyRule;
use crate::state::{AccelDiagnostics, AccelMode, AckOutcome, CeasedOutcome, DefunctAction};
use crate::topology::TopologyResolver;

/// Flows with a command outstanding at the engine, keyed by serial and
/// command kind. Each entry keeps its flow alive until the response.
type InflightTable = Mutex<HashMap<(FlowSerial, CommandKind), Arc<FlowRecord>>>;

pub struct AccelController {
    pub(crate) db: Arc<dyn FlowDatabase>,
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) topology: Arc<dyn TopologyResolver>,
    pub(crate) classifiers: ClassifierRegistry,
    pub(crate) counters: Arc<GlobalCounters>,
    pub(crate) config: ArcSwap<AccelConfig>,
    inflight: InflightTable,
}

impl AccelController {
    pub fn new(
        db: Arc<dyn FlowDatabase>,
        engine: Arc<dyn Engine>,
        topology: Arc<dyn TopologyResolver>,
        counters: Arc<GlobalCounters>,
        config: AccelConfig,
    ) -> Self {
        Self {
            db,
            engine,
            topology,
            classifiers: ClassifierRegistry::new(),
            counters,
            config: ArcSwap::from_pointee(config),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Use `registry` to instantiate classifiers for new flows.
    pub fn with_classifiers(mut self, registry: ClassifierRegistry) -> Self {
        self.classifiers = registry;
        self
    }

    pub fn db(&self) -> &Arc<dyn FlowDatabase> {
        &self.db
    }

    pub fn config(&self) -> Arc<AccelConfig> {
        self.config.load_full()
    }

    /// Replace the active configuration. Running flows keep their limits.
    pub fn update_config(&self, config: AccelConfig) -> Result<()> {
        config.validate()?;
        self.config.store(Arc::new(config));
        info!("Configuration updated");
        Ok(())
    }

    /// Replace the limits new flows are created with.
    pub fn update_limits(&self, limits: AccelLimits) -> Result<()> {
        let mut config = (**self.config.load()).clone();
        config.limits = limits;
        config.validate()?;
        self.config.store(Arc::new(config));
        info!(
            nack = limits.nack,
            driver_fail = limits.driver_fail,
            no_action = limits.no_action,
            "Limits updated"
        );
        Ok(())
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn state_get(&self, flow: &FlowRecord) -> AccelDiagnostics {
        flow.accel().snapshot()
    }

    /// Number of commands awaiting an engine response.
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    /// Refuse all further acceleration attempts.
    pub fn set_terminate_pending(&self) {
        self.counters.set_terminate_pending();
        info!("Acceleration terminating");
    }

    /// Try to offload `flow`.
    ///
    /// Claims the flow with `pending_set`, compiles its rule and hands the
    /// create to the engine. The outcome arrives later through
    /// [`handle_event`](Self::handle_event).
    pub fn accelerate(&self, flow: &Arc<FlowRecord>, ctx: &CompileContext<'_>) -> Result<()> {
        let accel = flow.accel();
        accel.pending_set(&self.counters)?;

        let serial = flow.serial();
        let regen = flow.regen_occurrences();
        let config = self.config.load();
        let rule = match RuleCompiler::new(self.topology.as_ref(), &config).compile(flow, ctx) {
            Ok(rule) => rule,
            Err(err) => {
                let mode = accel.abort_pending(AccelMode::FailRule);
                debug!(%serial, %mode, error = %err, "Flow cannot be accelerated");
                self.finish_if_defunct(flow, mode);
                return Err(err);
            }
        };

        if flow.regen_occurrences() != regen {
            let mode = accel.abort_pending(AccelMode::Decel);
            debug!(%serial, %mode, "Topology changed during rule compilation");
            self.finish_if_defunct(flow, mode);
            return Err(AccelError::StaleTopology);
        }

        self.track(serial, CommandKind::Create, flow);
        accel.begin_command();
        match self.engine.transmit(EngineCommand::Create { serial, rule }) {
            Ok(()) => {
                accel.create_transmitted();
                debug!(%serial, flow = %flow.tuple(), "Create sent");
                Ok(())
            }
            Err(err) => {
                self.untrack(serial, CommandKind::Create);
                let mode = accel.create_transmit_failed();
                warn!(%serial, %mode, error = %err, "Create not accepted by engine");
                self.finish_if_defunct(flow, mode);
                Err(AccelError::EngineUnavailable)
            }
        }
    }

    /// Stop offloading `flow`.
    ///
    /// Returns true if a destroy was handed to the engine. A request made
    /// while the create is still pending is recorded and carried out once
    /// the create is acknowledged.
    pub fn decelerate(&self, flow: &Arc<FlowRecord>) -> bool {
        if !flow.accel().begin_decelerate() {
            trace!(serial = %flow.serial(), mode = %flow.accel().mode(), "Decelerate not actioned");
            return false;
        }
        self.send_destroy(flow)
    }

    /// Decelerate every flow in the database. Returns how many destroys
    /// were sent.
    pub fn decelerate_all(&self) -> usize {
        let sent = self
            .db
            .flows()
            .iter()
            .filter(|flow| self.decelerate(flow))
            .count();
        if sent > 0 {
            info!(destroys = sent, "Decelerating all flows");
        }
        sent
    }

    /// Mark `flow` defunct and retire it.
    ///
    /// Returns true once the flow has left the database. An accelerated
    /// flow is removed as soon as its destroy is sent; a flow with a
    /// command outstanding is removed when the response arrives.
    pub fn make_defunct(&self, flow: &Arc<FlowRecord>) -> bool {
        let serial = flow.serial();
        match flow.accel().defunct() {
            DefunctAction::AlreadyDefunct => {
                // A destroy that failed to transmit left the flow in Accel
                if flow.accel().begin_decelerate() {
                    return self.retire(flow);
                }
                false
            }
            DefunctAction::Removable => {
                debug!(%serial, "Defunct flow removed");
                self.db.remove(serial);
                true
            }
            DefunctAction::Decelerate => self.retire(flow),
            DefunctAction::Deferred(mode) => {
                debug!(%serial, %mode, "Defunct deferred until engine response");
                false
            }
        }
    }

    /// Retire flows whose idle timer expired, then prune the database.
    /// Returns how many flows left the database.
    pub fn reap_idle(&self, now: Instant) -> usize {
        let timeouts = self.config.load().timeouts.clone();
        let expired = self.db.expired(now, &timeouts);
        let reaped = expired.iter().filter(|flow| self.make_defunct(flow)).count();
        if reaped > 0 {
            debug!(expired = expired.len(), reaped, "Idle flows reaped");
        }
        drop(expired);
        let pruned = self.db.prune();
        if pruned > 0 {
            debug!(pruned, "Serial index pruned");
        }
        reaped
    }

    /// Flag every flow for regeneration on its next packet.
    pub fn topology_changed(&self) -> usize {
        let flows = self.db.flows();
        for flow in &flows {
            flow.needs_regeneration();
        }
        info!(flows = flows.len(), "Topology change flagged");
        flows.len()
    }

    /// Re-resolve both sides of `flow` and decelerate it so the next
    /// packet offloads it with a fresh rule.
    pub fn regenerate(&self, flow: &Arc<FlowRecord>) -> Result<()> {
        let tuple = flow.tuple();
        let from = self.topology.resolve(tuple.src)?;
        let to = self.topology.resolve(tuple.dst)?;
        flow.set_sides(from, to);
        debug!(serial = %flow.serial(), regen = flow.regen_occurrences(), "Flow regenerated");
        if flow.accel().mode() == AccelMode::Accel {
            self.decelerate(flow);
        }
        Ok(())
    }

    /// Apply an event from the engine.
    pub fn handle_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Response {
                serial,
                kind,
                outcome,
            } => self.handle_response(serial, kind, outcome),
            EngineEvent::Ceased { serial } => match self.db.lookup_by_serial(serial) {
                Some(flow) => self.accel_ceased(&flow),
                None => debug!(%serial, "Cessation for unknown flow"),
            },
            EngineEvent::Activity { serial } => {
                if let Some(flow) = self.db.lookup_by_serial(serial) {
                    self.action_seen(&flow);
                }
            }
        }
    }

    /// The engine stopped accelerating `flow` on its own.
    pub fn accel_ceased(&self, flow: &FlowRecord) {
        let serial = flow.serial();
        match flow.accel().accel_ceased(&self.counters) {
            CeasedOutcome::Ignored => trace!(%serial, "Cessation ignored"),
            CeasedOutcome::FlushRaced => debug!(%serial, "Flush raced pending create"),
            CeasedOutcome::Ended(mode) => debug!(%serial, %mode, "Acceleration ceased"),
        }
    }

    pub fn action_seen(&self, flow: &FlowRecord) {
        flow.accel().action_seen();
    }

    fn handle_response(&self, serial: FlowSerial, kind: CommandKind, outcome: ResponseOutcome) {
        let Some(flow) = self.db.lookup_by_serial(serial) else {
            self.inflight
                .lock()
                .unwrap()
                .retain(|(tracked, _), _| *tracked != serial);
            debug!(%serial, %kind, "Response for unknown flow discarded");
            return;
        };

        // Held until the transition is applied
        let Some(_command) = self.untrack(serial, kind) else {
            warn!(%serial, %kind, "Response without matching command discarded");
            return;
        };

        flow.accel().record_command_done();
        match kind {
            CommandKind::Create => self.create_response(&flow, outcome),
            CommandKind::Destroy => self.destroy_response(&flow, outcome),
        }
    }

    fn create_response(&self, flow: &Arc<FlowRecord>, outcome: ResponseOutcome) {
        let serial = flow.serial();
        let accel = flow.accel();
        if let ResponseOutcome::Nack { error } = outcome {
            let mode = accel.create_nacked();
            debug!(%serial, %mode, error, "Create rejected by engine");
            self.finish_if_defunct(flow, mode);
            return;
        }

        match accel.create_acked(&self.counters) {
            AckOutcome::Accelerated => debug!(%serial, "Flow accelerated"),
            AckOutcome::FlushRaced { mode } => {
                debug!(%serial, %mode, "Create acknowledged after flush");
                self.finish_if_defunct(flow, mode);
            }
            AckOutcome::DecelerateRequested { defunct } => {
                debug!(%serial, defunct, "Actioning decelerate requested while pending");
                if defunct {
                    self.make_defunct(flow);
                } else {
                    self.decelerate(flow);
                }
            }
        }
    }

    fn destroy_response(&self, flow: &Arc<FlowRecord>, outcome: ResponseOutcome) {
        let serial = flow.serial();
        self.counters.decel_resolved();
        match flow.accel().destroy_resolved(&self.counters, outcome.is_ack()) {
            Some(mode) => {
                debug!(%serial, %mode, "Flow decelerated");
                self.finish_if_defunct(flow, mode);
            }
            None => debug!(%serial, "Destroy response after acceleration ended"),
        }
    }

    /// Send the destroy for a flow already moved to `DecelPending`.
    fn send_destroy(&self, flow: &Arc<FlowRecord>) -> bool {
        let serial = flow.serial();
        let accel = flow.accel();
        self.counters.decel_issued();
        self.track(serial, CommandKind::Destroy, flow);
        accel.begin_command();

        let rule = DestroyRule::for_flow(flow);
        match self.engine.transmit(EngineCommand::Destroy { serial, rule }) {
            Ok(()) => {
                accel.destroy_transmitted();
                debug!(%serial, "Destroy sent");
                true
            }
            Err(err) => {
                self.untrack(serial, CommandKind::Destroy);
                let mode = accel.destroy_transmit_failed(&self.counters);
                self.counters.decel_resolved();
                warn!(%serial, %mode, error = %err, "Destroy not accepted by engine");
                false
            }
        }
    }

    /// Destroy a defunct flow and take it out of the database, unless the
    /// destroy failed to transmit and will be retried.
    fn retire(&self, flow: &Arc<FlowRecord>) -> bool {
        if self.send_destroy(flow) || flow.accel().mode() == AccelMode::FailDecel {
            debug!(serial = %flow.serial(), "Defunct flow removed");
            self.db.remove(flow.serial());
            return true;
        }
        false
    }

    fn finish_if_defunct(&self, flow: &FlowRecord, mode: AccelMode) {
        if mode == AccelMode::FailDefunct {
            debug!(serial = %flow.serial(), "Defunct flow removed");
            self.db.remove(flow.serial());
        }
    }

    fn track(&self, serial: FlowSerial, kind: CommandKind, flow: &Arc<FlowRecord>) {
        self.inflight
            .lock()
            .unwrap()
            .insert((serial, kind), flow.clone());
    }

    fn untrack(&self, serial: FlowSerial, kind: CommandKind) -> Option<Arc<FlowRecord>> {
        self.inflight.lock().unwrap().remove(&(serial, kind))
    }
}
