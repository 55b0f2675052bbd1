//! Acceleration engine interface
//!
//! Commands go to the engine through [`Engine::transmit`], which only
//! queues them. Responses and engine-initiated notifications come back
//! asynchronously as [`EngineEvent`]s on a channel and are applied to the
//! controller by the dispatcher thread.

mod dispatch;
mod sim;

pub use dispatch::{DispatcherHandle, spawn_dispatcher};
pub use sim::{SimEngine, SimEngineConfig};

use std::fmt;

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;

use crate::flow::FlowSerial;
use crate::rule::{CreateRule, DestroyRule};

/// Kind of an engine command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Create,
    Destroy,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Create => "create",
            CommandKind::Destroy => "destroy",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command for the engine, tagged with the flow serial it concerns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    Create { serial: FlowSerial, rule: CreateRule },
    Destroy { serial: FlowSerial, rule: DestroyRule },
}

impl EngineCommand {
    pub fn serial(&self) -> FlowSerial {
        match self {
            EngineCommand::Create { serial, .. } | EngineCommand::Destroy { serial, .. } => *serial,
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            EngineCommand::Create { .. } => CommandKind::Create,
            EngineCommand::Destroy { .. } => CommandKind::Destroy,
        }
    }
}

/// Result code of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    Ack,
    /// Rejected; `error` is the engine's reason code, informational only.
    Nack { error: u32 },
}

impl ResponseOutcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, ResponseOutcome::Ack)
    }
}

/// Asynchronous notification from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// Answer to a previously transmitted command.
    Response {
        serial: FlowSerial,
        kind: CommandKind,
        outcome: ResponseOutcome,
    },
    /// The engine stopped accelerating the flow on its own (flush, eviction).
    Ceased { serial: FlowSerial },
    /// The engine forwarded traffic for the flow.
    Activity { serial: FlowSerial },
}

impl EngineEvent {
    pub fn serial(&self) -> FlowSerial {
        match self {
            EngineEvent::Response { serial, .. }
            | EngineEvent::Ceased { serial }
            | EngineEvent::Activity { serial } => *serial,
        }
    }
}

/// Why a command could not be handed to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransmitError {
    #[error("engine command queue full")]
    QueueFull,
    #[error("engine offline")]
    Offline,
}

/// An acceleration engine
pub trait Engine: Send + Sync {
    /// Queue a command. Must not block; the outcome arrives later as an
    /// [`EngineEvent::Response`] unless this returns an error.
    fn transmit(&self, command: EngineCommand) -> Result<(), TransmitError>;
}

/// Handle engines use to deliver events to the controller
#[derive(Debug, Clone)]
pub struct EngineSender {
    tx: Sender<EngineEvent>,
}

impl EngineSender {
    /// Deliver an event. Returns false once the dispatcher has gone away.
    pub fn send(&self, event: EngineEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Create the event channel between an engine and the dispatcher
pub fn event_channel(capacity: usize) -> (EngineSender, Receiver<EngineEvent>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (EngineSender { tx }, rx)
}
