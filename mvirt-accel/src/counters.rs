//! Process-wide accelerated-flow counters.

use std::sync::Mutex;

use serde::Serialize;
use tracing::error;

use crate::flow::TransportProtocol;

#[derive(Debug, Default)]
struct CounterState {
    /// Indexed by [`slot`].
    accelerated: [i64; 2],
    accelerated_total: i64,
    pending_decel: i64,
    terminate_pending: bool,
}

fn slot(protocol: TransportProtocol) -> usize {
    match protocol {
        TransportProtocol::Tcp => 0,
        TransportProtocol::Udp => 1,
    }
}

/// Counts of currently accelerated flows and outstanding destroys.
///
/// Always locked after a flow's own lock, never before.
#[derive(Debug, Default)]
pub struct GlobalCounters {
    inner: Mutex<CounterState>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub tcp_accelerated: i64,
    pub udp_accelerated: i64,
    pub accelerated: i64,
    pub pending_decel: i64,
    pub terminate_pending: bool,
}

impl GlobalCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A create was acknowledged.
    pub(crate) fn accel_started(&self, protocol: TransportProtocol) {
        let mut state = self.inner.lock().unwrap();
        state.accelerated[slot(protocol)] += 1;
        state.accelerated_total += 1;
    }

    /// Acceleration of a flow ended, by destroy response or cessation.
    pub(crate) fn accel_ended(&self, protocol: TransportProtocol) {
        let mut state = self.inner.lock().unwrap();
        state.accelerated[slot(protocol)] -= 1;
        state.accelerated_total -= 1;
        check_non_negative(&state);
    }

    pub(crate) fn decel_issued(&self) {
        self.inner.lock().unwrap().pending_decel += 1;
    }

    pub(crate) fn decel_resolved(&self) {
        let mut state = self.inner.lock().unwrap();
        state.pending_decel -= 1;
        check_non_negative(&state);
    }

    pub(crate) fn set_terminate_pending(&self) {
        self.inner.lock().unwrap().terminate_pending = true;
    }

    pub fn terminate_pending(&self) -> bool {
        self.inner.lock().unwrap().terminate_pending
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let state = self.inner.lock().unwrap();
        CounterSnapshot {
            tcp_accelerated: state.accelerated[0],
            udp_accelerated: state.accelerated[1],
            accelerated: state.accelerated_total,
            pending_decel: state.pending_decel,
            terminate_pending: state.terminate_pending,
        }
    }
}

fn check_non_negative(state: &CounterState) {
    let negative = state.accelerated.iter().any(|c| *c < 0)
        || state.accelerated_total < 0
        || state.pending_decel < 0;
    if negative {
        error!(
            tcp = state.accelerated[0],
            udp = state.accelerated[1],
            total = state.accelerated_total,
            pending_decel = state.pending_decel,
            "Accelerated flow counters went negative"
        );
    }
    debug_assert!(!negative, "accelerated flow counters went negative");
}
