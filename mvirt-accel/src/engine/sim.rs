//! In-process simulated acceleration engine.
//!
//! Commands are queued by [`SimEngine::transmit`] and answered when
//! [`SimEngine::pump`] runs, or explicitly through [`SimEngine::respond`].
//! Used by the simulation binary and the integration tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tracing::{debug, trace};

use super::{
    CommandKind, Engine, EngineCommand, EngineEvent, EngineSender, ResponseOutcome, TransmitError,
};
use crate::flow::FlowSerial;

/// Reason code used for simulated rejections.
pub const SIM_NACK_ERROR: u32 = 1;

#[derive(Debug, Clone)]
pub struct SimEngineConfig {
    /// Commands that can be queued before transmit fails.
    pub queue_depth: usize,
    /// Reject one create in every `n`.
    pub nack_every: Option<u32>,
}

impl Default for SimEngineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            nack_every: None,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    queue: VecDeque<EngineCommand>,
    log: Vec<EngineCommand>,
    offloaded: HashSet<FlowSerial>,
    creates_seen: u32,
}

#[derive(Debug)]
pub struct SimEngine {
    config: SimEngineConfig,
    events: EngineSender,
    state: Mutex<SimState>,
    offline: AtomicBool,
    inject_failures: AtomicU32,
}

impl SimEngine {
    pub fn new(events: EngineSender, config: SimEngineConfig) -> Self {
        Self {
            config,
            events,
            state: Mutex::new(SimState::default()),
            offline: AtomicBool::new(false),
            inject_failures: AtomicU32::new(0),
        }
    }

    /// Refuse every transmit until cleared.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Refuse the next `count` transmits.
    pub fn fail_next(&self, count: u32) {
        self.inject_failures.store(count, Ordering::SeqCst);
    }

    /// Answer every queued command. Returns the number answered.
    pub fn pump(&self) -> usize {
        let answered: Vec<EngineEvent> = {
            let mut state = self.state.lock().unwrap();
            let queued: Vec<EngineCommand> = state.queue.drain(..).collect();
            queued
                .into_iter()
                .map(|command| {
                    let outcome = match command.kind() {
                        CommandKind::Create => {
                            state.creates_seen += 1;
                            match self.config.nack_every {
                                Some(n) if n > 0 && state.creates_seen % n == 0 => {
                                    ResponseOutcome::Nack {
                                        error: SIM_NACK_ERROR,
                                    }
                                }
                                _ => ResponseOutcome::Ack,
                            }
                        }
                        CommandKind::Destroy => ResponseOutcome::Ack,
                    };
                    apply_outcome(&mut state, command.serial(), command.kind(), outcome);
                    EngineEvent::Response {
                        serial: command.serial(),
                        kind: command.kind(),
                        outcome,
                    }
                })
                .collect()
        };

        let count = answered.len();
        for event in answered {
            self.events.send(event);
        }
        count
    }

    /// Answer a command explicitly, in whatever order the caller likes.
    pub fn respond(&self, serial: FlowSerial, kind: CommandKind, outcome: ResponseOutcome) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(pos) = state
                .queue
                .iter()
                .position(|c| c.serial() == serial && c.kind() == kind)
            {
                state.queue.remove(pos);
            }
            apply_outcome(&mut state, serial, kind, outcome);
        }
        self.events.send(EngineEvent::Response {
            serial,
            kind,
            outcome,
        });
    }

    /// Stop accelerating a flow on the engine's own initiative.
    pub fn cease(&self, serial: FlowSerial) {
        self.state.lock().unwrap().offloaded.remove(&serial);
        debug!(%serial, "Simulated engine ceased acceleration");
        self.events.send(EngineEvent::Ceased { serial });
    }

    /// Flush every offloaded flow.
    pub fn flush_all(&self) -> usize {
        let flushed: Vec<FlowSerial> = self.state.lock().unwrap().offloaded.drain().collect();
        for serial in &flushed {
            self.events.send(EngineEvent::Ceased { serial: *serial });
        }
        flushed.len()
    }

    /// Report forwarding activity for every offloaded flow.
    pub fn report_activity(&self) -> usize {
        let active: Vec<FlowSerial> = self
            .state
            .lock()
            .unwrap()
            .offloaded
            .iter()
            .copied()
            .collect();
        for serial in &active {
            self.events.send(EngineEvent::Activity { serial: *serial });
        }
        active.len()
    }

    /// Every command accepted so far, in transmit order.
    pub fn commands(&self) -> Vec<EngineCommand> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn queued(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn offloaded(&self) -> usize {
        self.state.lock().unwrap().offloaded.len()
    }
}

fn apply_outcome(state: &mut SimState, serial: FlowSerial, kind: CommandKind, outcome: ResponseOutcome) {
    match (kind, outcome) {
        (CommandKind::Create, ResponseOutcome::Ack) => {
            state.offloaded.insert(serial);
        }
        (CommandKind::Destroy, _) => {
            state.offloaded.remove(&serial);
        }
        (CommandKind::Create, ResponseOutcome::Nack { .. }) => {}
    }
}

impl Engine for SimEngine {
    fn transmit(&self, command: EngineCommand) -> Result<(), TransmitError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransmitError::Offline);
        }
        let injected = self
            .inject_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransmitError::QueueFull);
        }

        let mut state = self.state.lock().unwrap();
        if state.queue.len() >= self.config.queue_depth {
            return Err(TransmitError::QueueFull);
        }
        trace!(serial = %command.serial(), kind = %command.kind(), "Simulated engine queued command");
        state.log.push(command.clone());
        state.queue.push_back(command);
        Ok(())
    }
}
