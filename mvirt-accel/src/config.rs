//! Controller configuration.
//!
//! Loaded from a JSON file and overridable from the command line. The
//! controller keeps the active configuration behind an `ArcSwap` so limits
//! and switches can be replaced while flows are running; new flows take a
//! copy of the limits that are current when they are created.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AccelError, Result};
use crate::flow::TimerGroup;

/// Default consecutive negative acknowledgements before a flow gives up.
pub const DEFAULT_NACK_LIMIT: u32 = 250;

/// Default consecutive transmit failures before a flow gives up.
pub const DEFAULT_DRIVER_FAIL_LIMIT: u32 = 250;

/// Default consecutive cessations without offload activity before a flow gives up.
pub const DEFAULT_NO_ACTION_LIMIT: u32 = 250;

/// Per-flow failure limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelLimits {
    pub nack: u32,
    pub driver_fail: u32,
    pub no_action: u32,
}

impl Default for AccelLimits {
    fn default() -> Self {
        Self {
            nack: DEFAULT_NACK_LIMIT,
            driver_fail: DEFAULT_DRIVER_FAIL_LIMIT,
            no_action: DEFAULT_NO_ACTION_LIMIT,
        }
    }
}

/// Idle timeouts per timer group, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleTimeouts {
    pub tcp_short_secs: u64,
    pub tcp_long_secs: u64,
    pub tcp_closing_secs: u64,
    pub udp_generic_secs: u64,
    pub udp_well_known_secs: u64,
    pub classifier_secs: u64,
}

impl Default for IdleTimeouts {
    fn default() -> Self {
        Self {
            tcp_short_secs: 120,
            tcp_long_secs: 3600,
            tcp_closing_secs: 30,
            udp_generic_secs: 60,
            udp_well_known_secs: 120,
            classifier_secs: 300,
        }
    }
}

impl IdleTimeouts {
    pub fn for_group(&self, group: TimerGroup) -> Duration {
        let secs = match group {
            TimerGroup::TcpShort => self.tcp_short_secs,
            TimerGroup::TcpLong => self.tcp_long_secs,
            TimerGroup::TcpClosing => self.tcp_closing_secs,
            TimerGroup::UdpGeneric => self.udp_generic_secs,
            TimerGroup::UdpWellKnown => self.udp_well_known_secs,
            TimerGroup::Classifier => self.classifier_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Complete controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    pub limits: AccelLimits,
    /// Tag bridged flows with the VLAN carried by the packet when no
    /// VLAN interface was found in the hierarchy.
    pub vlan_passthrough: bool,
    /// Ask the engine to verify the ingress interface of offloaded packets.
    pub src_interface_check: bool,
    /// Treat every TCP flow as if window tracking were liberal.
    pub tcp_be_liberal: bool,
    /// Skip TCP window checks entirely.
    pub tcp_no_window_check: bool,
    /// Consult the ingress shaper before accelerating.
    pub igs_enabled: bool,
    pub timeouts: IdleTimeouts,
    /// Seconds between counter reports in the simulation binary.
    pub stats_interval_secs: u64,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            limits: AccelLimits::default(),
            vlan_passthrough: false,
            src_interface_check: false,
            tcp_be_liberal: false,
            tcp_no_window_check: false,
            igs_enabled: false,
            timeouts: IdleTimeouts::default(),
            stats_interval_secs: 2,
        }
    }
}

impl AccelConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: AccelConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would fail every flow on its first event.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.nack == 0 || limits.driver_fail == 0 || limits.no_action == 0 {
            return Err(AccelError::Config(format!(
                "limits must be non-zero (nack={}, driver_fail={}, no_action={})",
                limits.nack, limits.driver_fail, limits.no_action
            )));
        }
        if self.stats_interval_secs == 0 {
            return Err(AccelError::Config("stats_interval_secs must be non-zero".into()));
        }
        Ok(())
    }
}
