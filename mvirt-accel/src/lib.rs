//! mvirt-accel: flow acceleration controller
//!
//! Decides which TCP/UDP flows can be offloaded to a hardware acceleration
//! engine, compiles the offload rule from the flow's interface hierarchy,
//! and tracks every flow through the create/destroy command lifecycle.
//!
//! The packet path enters through [`AccelController::process_flow`]. Engine
//! responses arrive on a channel and are applied by the dispatcher thread
//! started with [`engine::spawn_dispatcher`].

pub mod admission;
pub mod classifier;
pub mod compile;
pub mod config;
pub mod controller;
pub mod counters;
pub mod db;
pub mod engine;
pub mod error;
pub mod flow;
pub mod packet;
pub mod rule;
pub mod state;
pub mod topology;

pub use admission::Disposition;
pub use config::{AccelConfig, AccelLimits};
pub use controller::AccelController;
pub use counters::{CounterSnapshot, GlobalCounters};
pub use db::{FlowDatabase, MemoryFlowDb};
pub use error::{AccelError, Result};
pub use state::AccelMode;
