//! Error types for the acceleration controller.

use thiserror::Error;

use crate::state::AccelMode;

/// Errors raised while admitting, compiling or offloading a flow.
///
/// None of these reach the packet path: a failed offload attempt leaves
/// the flow forwarding in software.
#[derive(Debug, Error)]
pub enum AccelError {
    /// The flow's topology cannot be expressed as an offload rule.
    #[error("rule invalid: {0}")]
    RuleInvalid(String),

    /// The engine did not accept the command for transmission.
    #[error("acceleration engine unavailable")]
    EngineUnavailable,

    /// The engine answered a command with a negative acknowledgement.
    #[error("acceleration engine rejected the command")]
    EngineRejected,

    /// The flow's topology was regenerated while its rule was compiled.
    #[error("topology changed during rule compilation")]
    StaleTopology,

    /// Acceleration repeatedly ceased without any offload activity.
    #[error("acceleration ceased without offload activity")]
    NoProgress,

    /// The flow cannot start acceleration from its current mode.
    #[error("acceleration not permitted in mode {0}")]
    NotPermitted(AccelMode),

    #[error("resolution failed: {0}")]
    Resolution(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AccelError {
    /// Map a mode that refuses acceleration to the error explaining why.
    pub fn refused_by(mode: AccelMode) -> Self {
        match mode {
            AccelMode::FailRule => AccelError::RuleInvalid("flow previously failed rule compilation".into()),
            AccelMode::FailDriver => AccelError::EngineUnavailable,
            AccelMode::FailAccelEngine => AccelError::EngineRejected,
            AccelMode::FailNoAction => AccelError::NoProgress,
            other => AccelError::NotPermitted(other),
        }
    }

    /// Whether the attempt can be retried on a later packet.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AccelError::EngineUnavailable | AccelError::StaleTopology | AccelError::NotPermitted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AccelError>;
