//! Per-flow acceleration state machine.
//!
//! Every flow embeds one [`FlowAccel`]. All reads and writes go through its
//! mutex; the global counters are only ever locked while that mutex is
//! held, which keeps each entry into or exit from `Accel` paired with
//! exactly one counter update.
//!
//! ```text
//!            pending_set              ack
//!   Decel ───────────────> AccelPending ─────> Accel
//!     ^                        │  nack/tx fail   │ decelerate
//!     │                        v                 v
//!     └──────────────── (Decel | Fail*)    DecelPending ──> Decel | FailDecel
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error};

use crate::config::AccelLimits;
use crate::counters::GlobalCounters;
use crate::error::{AccelError, Result};
use crate::flow::TransportProtocol;

/// Acceleration mode of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccelMode {
    Decel,
    AccelPending,
    Accel,
    DecelPending,
    /// The flow's topology cannot be expressed as a rule.
    FailRule,
    /// Too many consecutive transmit failures.
    FailDriver,
    /// Too many consecutive negative acknowledgements.
    FailAccelEngine,
    /// Acceleration kept ceasing without any offload activity.
    FailNoAction,
    FailDecel,
    FailDefunct,
    /// Acceleration was never allowed for this flow.
    FailDenied,
}

impl AccelMode {
    pub const ALL: [AccelMode; 11] = [
        AccelMode::Decel,
        AccelMode::AccelPending,
        AccelMode::Accel,
        AccelMode::DecelPending,
        AccelMode::FailRule,
        AccelMode::FailDriver,
        AccelMode::FailAccelEngine,
        AccelMode::FailNoAction,
        AccelMode::FailDecel,
        AccelMode::FailDefunct,
        AccelMode::FailDenied,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccelMode::Decel => "decel",
            AccelMode::AccelPending => "accel_pending",
            AccelMode::Accel => "accel",
            AccelMode::DecelPending => "decel_pending",
            AccelMode::FailRule => "fail_rule",
            AccelMode::FailDriver => "fail_driver",
            AccelMode::FailAccelEngine => "fail_accel_engine",
            AccelMode::FailNoAction => "fail_no_action",
            AccelMode::FailDecel => "fail_decel",
            AccelMode::FailDefunct => "fail_defunct",
            AccelMode::FailDenied => "fail_denied",
        }
    }

    /// Terminal modes. A flow in one of them is never accelerated again.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            AccelMode::FailRule
                | AccelMode::FailDriver
                | AccelMode::FailAccelEngine
                | AccelMode::FailNoAction
                | AccelMode::FailDecel
                | AccelMode::FailDefunct
                | AccelMode::FailDenied
        )
    }
}

impl fmt::Display for AccelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccelMode {
    type Err = AccelError;

    fn from_str(s: &str) -> Result<Self> {
        AccelMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| AccelError::Config(format!("unknown acceleration mode: {s}")))
    }
}

/// A consecutive-event count with its lifetime total and limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimitedCount {
    pub current: u32,
    pub total: u64,
    pub limit: u32,
}

impl LimitedCount {
    fn with_limit(limit: u32) -> Self {
        Self {
            current: 0,
            total: 0,
            limit,
        }
    }

    /// Count one more event; true once the limit is reached.
    fn bump(&mut self) -> bool {
        self.current += 1;
        self.total += 1;
        self.reached()
    }

    fn reached(&self) -> bool {
        self.current >= self.limit
    }
}

#[derive(Debug, Default)]
struct AccelStats {
    nack: LimitedCount,
    driver_fail: LimitedCount,
    no_action_seen: LimitedCount,
    flush_happened: bool,
    flush_happened_total: u64,
    decelerate_pending: bool,
    slow_path_packets: u64,
    cmd_time_begun: Option<Instant>,
    cmd_begun_at: Option<DateTime<Utc>>,
    last_cmd_duration: Option<Duration>,
}

struct AccelInner {
    mode: AccelMode,
    stats: AccelStats,
    is_defunct: bool,
}

/// Outcome of a positive create acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Accelerated,
    /// The engine flushed the rule before acknowledging it; the flow is
    /// back in `mode` and was never counted as accelerated.
    FlushRaced { mode: AccelMode },
    /// A decelerate was requested while the create was pending and must be
    /// issued now. `defunct` asks for the defunct path to be re-driven.
    DecelerateRequested { defunct: bool },
}

/// Outcome of an engine-initiated cessation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeasedOutcome {
    Ignored,
    FlushRaced,
    Ended(AccelMode),
}

/// What the caller must do after marking a flow defunct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefunctAction {
    /// Already defunct; nothing to do.
    AlreadyDefunct,
    /// Nothing is offloaded or outstanding; the flow can be removed now.
    Removable,
    /// The flow is now `DecelPending`; the caller must send the destroy.
    Decelerate,
    /// A command is outstanding; its response finishes the job.
    Deferred(AccelMode),
}

/// Serialisable snapshot of a flow's acceleration state.
#[derive(Debug, Clone, Serialize)]
pub struct AccelDiagnostics {
    pub can_accel: bool,
    pub mode: AccelMode,
    pub decelerate_pending: bool,
    pub is_defunct: bool,
    pub flush_happened: bool,
    pub flush_happened_total: u64,
    pub no_action_seen: LimitedCount,
    pub driver_fail: LimitedCount,
    pub nack: LimitedCount,
    pub slow_path_packets: u64,
    pub last_command_at: Option<DateTime<Utc>>,
    pub last_command_duration_us: Option<u64>,
}

/// Acceleration state of one flow.
pub struct FlowAccel {
    protocol: TransportProtocol,
    can_accel: bool,
    inner: Mutex<AccelInner>,
}

impl FlowAccel {
    pub fn new(protocol: TransportProtocol, can_accel: bool, limits: &AccelLimits) -> Self {
        let mode = if can_accel {
            AccelMode::Decel
        } else {
            AccelMode::FailDenied
        };
        Self {
            protocol,
            can_accel,
            inner: Mutex::new(AccelInner {
                mode,
                stats: AccelStats {
                    nack: LimitedCount::with_limit(limits.nack),
                    driver_fail: LimitedCount::with_limit(limits.driver_fail),
                    no_action_seen: LimitedCount::with_limit(limits.no_action),
                    ..AccelStats::default()
                },
                is_defunct: false,
            }),
        }
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    pub fn can_accel(&self) -> bool {
        self.can_accel
    }

    pub fn mode(&self) -> AccelMode {
        self.inner.lock().unwrap().mode
    }

    pub fn is_defunct(&self) -> bool {
        self.inner.lock().unwrap().is_defunct
    }

    pub fn flush_happened_total(&self) -> u64 {
        self.inner.lock().unwrap().stats.flush_happened_total
    }

    /// Move `Decel -> AccelPending`, claiming the right to send a create.
    pub fn pending_set(&self, counters: &GlobalCounters) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !self.can_accel || inner.mode != AccelMode::Decel {
            return Err(AccelError::refused_by(inner.mode));
        }
        if counters.terminate_pending() {
            return Err(AccelError::NotPermitted(inner.mode));
        }
        inner.mode = AccelMode::AccelPending;
        Ok(())
    }

    /// Abandon a pending create before it was transmitted. Returns the
    /// resulting mode; a flow made defunct meanwhile ends in `FailDefunct`.
    pub fn abort_pending(&self, mode: AccelMode) -> AccelMode {
        let mut inner = self.inner.lock().unwrap();
        if !expect_mode(&inner, AccelMode::AccelPending, "abort_pending") {
            return inner.mode;
        }
        inner.stats.decelerate_pending = false;
        inner.mode = if inner.is_defunct {
            AccelMode::FailDefunct
        } else {
            mode
        };
        inner.mode
    }

    /// Stamp the start of an engine command.
    pub fn begin_command(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.cmd_time_begun = Some(Instant::now());
        inner.stats.cmd_begun_at = Some(Utc::now());
    }

    /// Record how long the outstanding command took.
    pub fn record_command_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(begun) = inner.stats.cmd_time_begun {
            inner.stats.last_cmd_duration = Some(begun.elapsed());
        }
    }

    pub fn create_transmitted(&self) {
        self.inner.lock().unwrap().stats.driver_fail.current = 0;
    }

    /// The engine refused to take a create command.
    pub fn create_transmit_failed(&self) -> AccelMode {
        let mut inner = self.inner.lock().unwrap();
        if !expect_mode(&inner, AccelMode::AccelPending, "create_transmit_failed") {
            return inner.mode;
        }
        let at_limit = inner.stats.driver_fail.bump();
        inner.stats.decelerate_pending = false;
        inner.mode = if inner.is_defunct {
            AccelMode::FailDefunct
        } else if at_limit {
            AccelMode::FailDriver
        } else {
            AccelMode::Decel
        };
        inner.mode
    }

    /// Negative acknowledgement of a create.
    pub fn create_nacked(&self) -> AccelMode {
        let mut inner = self.inner.lock().unwrap();
        if !expect_mode(&inner, AccelMode::AccelPending, "create_nacked") {
            return inner.mode;
        }
        let at_limit = inner.stats.nack.bump();
        inner.stats.decelerate_pending = false;
        inner.mode = if inner.is_defunct {
            AccelMode::FailDefunct
        } else if at_limit {
            AccelMode::FailAccelEngine
        } else {
            AccelMode::Decel
        };
        inner.mode
    }

    /// Positive acknowledgement of a create.
    pub fn create_acked(&self, counters: &GlobalCounters) -> AckOutcome {
        let mut inner = self.inner.lock().unwrap();
        if !expect_mode(&inner, AccelMode::AccelPending, "create_acked") {
            return AckOutcome::FlushRaced { mode: inner.mode };
        }
        let decelerate_pending = std::mem::take(&mut inner.stats.decelerate_pending);

        if inner.stats.flush_happened {
            // The engine already flushed this rule; it was never offloaded.
            inner.stats.flush_happened = false;
            inner.stats.no_action_seen.current += 1;
            inner.mode = if inner.is_defunct {
                AccelMode::FailDefunct
            } else {
                AccelMode::Decel
            };
            return AckOutcome::FlushRaced { mode: inner.mode };
        }

        inner.stats.nack.current = 0;
        inner.mode = AccelMode::Accel;
        counters.accel_started(self.protocol);

        // An ack that only leads to the destroy is not progress
        if decelerate_pending {
            let defunct = std::mem::replace(&mut inner.is_defunct, false);
            return AckOutcome::DecelerateRequested { defunct };
        }
        inner.stats.no_action_seen.current += 1;
        AckOutcome::Accelerated
    }

    /// Ask for `Accel -> DecelPending`.
    ///
    /// Returns true when the caller must now send the destroy. While a
    /// create is pending the request is only recorded and actioned when
    /// the create is acknowledged.
    pub fn begin_decelerate(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        begin_decelerate_locked(&mut inner)
    }

    pub fn destroy_transmitted(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.driver_fail.current = 0;
        inner.stats.slow_path_packets = 0;
    }

    /// The engine refused to take a destroy command.
    ///
    /// Below the driver-fail limit the flow goes back to `Accel` so a later
    /// decelerate retries. At the limit it gives up in `FailDecel`, which
    /// ends acceleration as far as the counters are concerned.
    pub fn destroy_transmit_failed(&self, counters: &GlobalCounters) -> AccelMode {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode != AccelMode::DecelPending {
            debug!(mode = %inner.mode, "Destroy transmit failure after acceleration ended");
            return inner.mode;
        }
        if inner.stats.driver_fail.bump() {
            inner.mode = AccelMode::FailDecel;
            counters.accel_ended(self.protocol);
        } else {
            inner.mode = AccelMode::Accel;
        }
        inner.mode
    }

    /// Response to a destroy. `None` if acceleration had already ended by
    /// other means and the response carries no information.
    pub fn destroy_resolved(&self, counters: &GlobalCounters, acked: bool) -> Option<AccelMode> {
        let mut inner = self.inner.lock().unwrap();
        if inner.mode != AccelMode::DecelPending {
            return None;
        }
        inner.mode = if inner.is_defunct {
            AccelMode::FailDefunct
        } else if acked {
            AccelMode::Decel
        } else {
            AccelMode::FailDecel
        };
        counters.accel_ended(self.protocol);
        Some(inner.mode)
    }

    /// The engine stopped accelerating the flow on its own.
    pub fn accel_ceased(&self, counters: &GlobalCounters) -> CeasedOutcome {
        let mut inner = self.inner.lock().unwrap();
        match inner.mode {
            AccelMode::AccelPending => {
                inner.stats.flush_happened = true;
                inner.stats.flush_happened_total += 1;
                CeasedOutcome::FlushRaced
            }
            AccelMode::Accel => {
                let no_action = &mut inner.stats.no_action_seen;
                if no_action.current > 0 {
                    no_action.total += 1;
                }
                let at_limit = no_action.reached();
                inner.mode = if at_limit {
                    AccelMode::FailNoAction
                } else {
                    AccelMode::Decel
                };
                counters.accel_ended(self.protocol);
                CeasedOutcome::Ended(inner.mode)
            }
            _ => CeasedOutcome::Ignored,
        }
    }

    /// Offload activity was observed.
    pub fn action_seen(&self) {
        self.inner.lock().unwrap().stats.no_action_seen.current = 0;
    }

    /// Mark the flow defunct.
    pub fn defunct(&self) -> DefunctAction {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_defunct {
            return DefunctAction::AlreadyDefunct;
        }
        inner.is_defunct = true;

        if inner.mode.is_failed() {
            return DefunctAction::Removable;
        }
        match inner.mode {
            AccelMode::Decel => {
                inner.mode = AccelMode::FailDefunct;
                DefunctAction::Removable
            }
            AccelMode::DecelPending => DefunctAction::Deferred(AccelMode::DecelPending),
            _ => {
                if begin_decelerate_locked(&mut inner) {
                    DefunctAction::Decelerate
                } else {
                    DefunctAction::Deferred(inner.mode)
                }
            }
        }
    }

    pub fn note_slow_path_packet(&self) {
        self.inner.lock().unwrap().stats.slow_path_packets += 1;
    }

    pub fn snapshot(&self) -> AccelDiagnostics {
        let inner = self.inner.lock().unwrap();
        let stats = &inner.stats;
        AccelDiagnostics {
            can_accel: self.can_accel,
            mode: inner.mode,
            decelerate_pending: stats.decelerate_pending,
            is_defunct: inner.is_defunct,
            flush_happened: stats.flush_happened,
            flush_happened_total: stats.flush_happened_total,
            no_action_seen: stats.no_action_seen,
            driver_fail: stats.driver_fail,
            nack: stats.nack,
            slow_path_packets: stats.slow_path_packets,
            last_command_at: stats.cmd_begun_at,
            last_command_duration_us: stats
                .last_cmd_duration
                .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX)),
        }
    }
}

impl fmt::Debug for FlowAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowAccel")
            .field("protocol", &self.protocol)
            .field("can_accel", &self.can_accel)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

fn begin_decelerate_locked(inner: &mut AccelInner) -> bool {
    match inner.mode {
        AccelMode::AccelPending => {
            inner.stats.decelerate_pending = true;
            false
        }
        AccelMode::Accel => {
            inner.mode = AccelMode::DecelPending;
            true
        }
        _ => false,
    }
}

fn expect_mode(inner: &AccelInner, expected: AccelMode, op: &str) -> bool {
    if inner.mode == expected {
        return true;
    }
    error!(op, mode = %inner.mode, expected = %expected, "Unexpected acceleration mode");
    debug_assert!(false, "{op} in mode {}", inner.mode);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(nack: u32, driver_fail: u32, no_action: u32) -> AccelLimits {
        AccelLimits {
            nack,
            driver_fail,
            no_action,
        }
    }

    fn tcp(limits: &AccelLimits) -> FlowAccel {
        FlowAccel::new(TransportProtocol::Tcp, true, limits)
    }

    #[test]
    fn test_mode_names_round_trip() {
        for mode in AccelMode::ALL {
            assert_eq!(mode.as_str().parse::<AccelMode>().unwrap(), mode);
        }
        assert!("accelerated".parse::<AccelMode>().is_err());
        assert!(AccelMode::FailDenied.is_failed());
        assert!(!AccelMode::DecelPending.is_failed());
    }

    #[test]
    fn test_denied_flow_never_pends() {
        let counters = GlobalCounters::new();
        let accel = FlowAccel::new(TransportProtocol::Udp, false, &AccelLimits::default());
        assert_eq!(accel.mode(), AccelMode::FailDenied);
        assert!(matches!(
            accel.pending_set(&counters),
            Err(AccelError::NotPermitted(AccelMode::FailDenied))
        ));
    }

    #[test]
    fn test_pending_set_only_from_decel() {
        let counters = GlobalCounters::new();
        let accel = tcp(&AccelLimits::default());
        accel.pending_set(&counters).unwrap();
        assert!(matches!(
            accel.pending_set(&counters),
            Err(AccelError::NotPermitted(AccelMode::AccelPending))
        ));
    }

    #[test]
    fn test_pending_set_refused_while_terminating() {
        let counters = GlobalCounters::new();
        counters.set_terminate_pending();
        let accel = tcp(&AccelLimits::default());
        assert!(accel.pending_set(&counters).is_err());
        assert_eq!(accel.mode(), AccelMode::Decel);
    }

    #[test]
    fn test_ack_counts_once_and_destroy_uncounts() {
        let counters = GlobalCounters::new();
        let accel = tcp(&AccelLimits::default());
        accel.pending_set(&counters).unwrap();
        assert_eq!(accel.create_acked(&counters), AckOutcome::Accelerated);
        assert_eq!(counters.snapshot().tcp_accelerated, 1);

        assert!(accel.begin_decelerate());
        assert_eq!(accel.mode(), AccelMode::DecelPending);
        assert_eq!(accel.destroy_resolved(&counters, true), Some(AccelMode::Decel));
        assert_eq!(counters.snapshot().accelerated, 0);

        // A second response carries no information.
        assert_eq!(accel.destroy_resolved(&counters, true), None);
        assert_eq!(counters.snapshot().accelerated, 0);
    }

    #[test]
    fn test_nack_limit() {
        let counters = GlobalCounters::new();
        let accel = tcp(&limits(2, 250, 250));
        accel.pending_set(&counters).unwrap();
        assert_eq!(accel.create_nacked(), AccelMode::Decel);
        accel.pending_set(&counters).unwrap();
        assert_eq!(accel.create_nacked(), AccelMode::FailAccelEngine);
        assert_eq!(accel.snapshot().nack.total, 2);
        assert_eq!(counters.snapshot().accelerated, 0);
    }

    #[test]
    fn test_successful_transmit_resets_driver_fail() {
        let counters = GlobalCounters::new();
        let accel = tcp(&limits(250, 2, 250));
        accel.pending_set(&counters).unwrap();
        assert_eq!(accel.create_transmit_failed(), AccelMode::Decel);
        accel.pending_set(&counters).unwrap();
        accel.create_transmitted();
        accel.create_nacked();
        accel.pending_set(&counters).unwrap();
        assert_eq!(accel.create_transmit_failed(), AccelMode::Decel);
        assert_eq!(accel.snapshot().driver_fail.total, 2);
    }

    #[test]
    fn test_decelerate_while_pending_is_recorded() {
        let counters = GlobalCounters::new();
        let accel = tcp(&AccelLimits::default());
        accel.pending_set(&counters).unwrap();
        assert!(!accel.begin_decelerate());
        assert_eq!(accel.mode(), AccelMode::AccelPending);
        assert!(accel.snapshot().decelerate_pending);

        assert_eq!(
            accel.create_acked(&counters),
            AckOutcome::DecelerateRequested { defunct: false }
        );
        assert_eq!(accel.mode(), AccelMode::Accel);
        assert!(!accel.snapshot().decelerate_pending);
    }

    #[test]
    fn test_flush_race_leaves_counters_alone() {
        let counters = GlobalCounters::new();
        let accel = tcp(&AccelLimits::default());
        accel.pending_set(&counters).unwrap();
        assert_eq!(accel.accel_ceased(&counters), CeasedOutcome::FlushRaced);
        assert_eq!(
            accel.create_acked(&counters),
            AckOutcome::FlushRaced {
                mode: AccelMode::Decel
            }
        );

        let diag = accel.snapshot();
        assert_eq!(diag.flush_happened_total, 1);
        assert!(!diag.flush_happened);
        assert_eq!(diag.no_action_seen.current, 1);
        assert_eq!(diag.no_action_seen.total, 0);
        assert_eq!(counters.snapshot().accelerated, 0);
    }

    #[test]
    fn test_cessation_without_activity_fails_at_limit() {
        let counters = GlobalCounters::new();
        let accel = tcp(&limits(250, 250, 2));
        for expected in [AccelMode::Decel, AccelMode::FailNoAction] {
            accel.pending_set(&counters).unwrap();
            accel.create_acked(&counters);
            assert_eq!(accel.accel_ceased(&counters), CeasedOutcome::Ended(expected));
        }
        assert_eq!(accel.snapshot().no_action_seen.total, 2);
        assert_eq!(counters.snapshot().accelerated, 0);
    }

    #[test]
    fn test_activity_resets_no_action() {
        let counters = GlobalCounters::new();
        let accel = tcp(&limits(250, 250, 1));
        accel.pending_set(&counters).unwrap();
        accel.create_acked(&counters);
        accel.action_seen();
        assert_eq!(
            accel.accel_ceased(&counters),
            CeasedOutcome::Ended(AccelMode::Decel)
        );
    }

    #[test]
    fn test_cessation_ignored_when_not_accelerated() {
        let counters = GlobalCounters::new();
        let accel = tcp(&AccelLimits::default());
        assert_eq!(accel.accel_ceased(&counters), CeasedOutcome::Ignored);
    }

    #[test]
    fn test_destroy_transmit_failure_retries_then_gives_up() {
        let counters = GlobalCounters::new();
        let accel = tcp(&limits(250, 2, 250));
        accel.pending_set(&counters).unwrap();
        accel.create_acked(&counters);

        assert!(accel.begin_decelerate());
        assert_eq!(accel.destroy_transmit_failed(&counters), AccelMode::Accel);
        assert_eq!(counters.snapshot().accelerated, 1);

        assert!(accel.begin_decelerate());
        assert_eq!(accel.destroy_transmit_failed(&counters), AccelMode::FailDecel);
        assert_eq!(counters.snapshot().accelerated, 0);
    }

    #[test]
    fn test_defunct_by_mode() {
        let counters = GlobalCounters::new();
        let limits = AccelLimits::default();

        let idle = tcp(&limits);
        assert_eq!(idle.defunct(), DefunctAction::Removable);
        assert_eq!(idle.mode(), AccelMode::FailDefunct);
        assert_eq!(idle.defunct(), DefunctAction::AlreadyDefunct);

        let pending = tcp(&limits);
        pending.pending_set(&counters).unwrap();
        assert_eq!(
            pending.defunct(),
            DefunctAction::Deferred(AccelMode::AccelPending)
        );
        assert_eq!(
            pending.create_acked(&counters),
            AckOutcome::DecelerateRequested { defunct: true }
        );
        assert!(!pending.is_defunct());

        let accelerated = tcp(&limits);
        accelerated.pending_set(&counters).unwrap();
        accelerated.create_acked(&counters);
        assert_eq!(accelerated.defunct(), DefunctAction::Decelerate);
        assert_eq!(
            accelerated.destroy_resolved(&counters, true),
            Some(AccelMode::FailDefunct)
        );
    }

    #[test]
    fn test_defunct_during_pending_nack() {
        let counters = GlobalCounters::new();
        let accel = tcp(&AccelLimits::default());
        accel.pending_set(&counters).unwrap();
        accel.defunct();
        assert_eq!(accel.create_nacked(), AccelMode::FailDefunct);
    }

    #[test]
    fn test_abort_pending() {
        let counters = GlobalCounters::new();
        let accel = tcp(&AccelLimits::default());
        accel.pending_set(&counters).unwrap();
        assert_eq!(accel.abort_pending(AccelMode::FailRule), AccelMode::FailRule);
        assert!(accel.pending_set(&counters).is_err());
    }

    #[test]
    fn test_diagnostics_serialise() {
        let accel = tcp(&AccelLimits::default());
        accel.note_slow_path_packet();
        accel.begin_command();
        accel.record_command_done();

        let json = serde_json::to_value(accel.snapshot()).unwrap();
        assert_eq!(json["mode"], "decel");
        assert_eq!(json["slow_path_packets"], 1);
        assert_eq!(json["nack"]["limit"], 250);
        assert!(json["last_command_at"].is_string());
    }
}
