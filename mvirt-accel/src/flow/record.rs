//! Flow record stored in the flow database.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use smoltcp::wire::EthernetAddress;

use super::{FlowDirection, FlowSerial, FlowTuple, InterfaceHierarchy, Sender, Side, TimerGroup};
use crate::classifier::{Classifier, ClassifierKind};
use crate::config::AccelLimits;
use crate::error::{AccelError, Result};
use crate::state::FlowAccel;

/// Resolved path of one direction: interface stack, endpoint node and MTU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSide {
    pub hierarchy: InterfaceHierarchy,
    pub node_mac: EthernetAddress,
    pub mtu: u32,
}

/// Forwarded and dropped packet/byte totals, split by sending side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DataTotals {
    pub from_packets: u64,
    pub from_bytes: u64,
    pub to_packets: u64,
    pub to_bytes: u64,
    pub from_dropped_packets: u64,
    pub from_dropped_bytes: u64,
    pub to_dropped_packets: u64,
    pub to_dropped_bytes: u64,
}

struct Paths {
    from: ResolvedSide,
    to: ResolvedSide,
}

struct FlowTimer {
    group: TimerGroup,
    last_touched: Instant,
    no_touch: bool,
    removed: bool,
}

/// A tracked flow.
///
/// Shared as `Arc<FlowRecord>` between the database, the packet path and
/// outstanding engine commands. The embedded [`FlowAccel`] carries the
/// acceleration state.
pub struct FlowRecord {
    serial: FlowSerial,
    tuple: FlowTuple,
    direction: FlowDirection,
    routed: bool,
    paths: RwLock<Paths>,
    classifiers: RwLock<Vec<Arc<dyn Classifier>>>,
    timer: Mutex<FlowTimer>,
    regen_occurrences: AtomicU32,
    regen_required: AtomicBool,
    totals: Mutex<DataTotals>,
    accel: FlowAccel,
}

impl FlowRecord {
    pub fn builder(serial: FlowSerial, tuple: FlowTuple, direction: FlowDirection) -> FlowRecordBuilder {
        FlowRecordBuilder::new(serial, tuple, direction)
    }

    pub fn serial(&self) -> FlowSerial {
        self.serial
    }

    pub fn tuple(&self) -> &FlowTuple {
        &self.tuple
    }

    pub fn direction(&self) -> FlowDirection {
        self.direction
    }

    pub fn accel(&self) -> &FlowAccel {
        &self.accel
    }

    pub fn is_routed(&self) -> bool {
        self.routed
    }

    /// Snapshot of both interface stacks, `(from, to)`.
    pub fn hierarchies(&self) -> (InterfaceHierarchy, InterfaceHierarchy) {
        let paths = self.paths.read().unwrap();
        (paths.from.hierarchy.clone(), paths.to.hierarchy.clone())
    }

    pub fn node_mac(&self, side: Side) -> EthernetAddress {
        let paths = self.paths.read().unwrap();
        match side {
            Side::From => paths.from.node_mac,
            Side::To => paths.to.node_mac,
        }
    }

    pub fn mtu(&self, side: Side) -> u32 {
        let paths = self.paths.read().unwrap();
        match side {
            Side::From => paths.from.mtu,
            Side::To => paths.to.mtu,
        }
    }

    /// Replace both resolved paths, e.g. after regeneration.
    pub fn set_sides(&self, from: ResolvedSide, to: ResolvedSide) {
        let mut paths = self.paths.write().unwrap();
        paths.from = from;
        paths.to = to;
    }

    /// Assigned classifiers in ascending priority order.
    pub fn assignments(&self) -> Vec<Arc<dyn Classifier>> {
        self.classifiers.read().unwrap().clone()
    }

    /// Assign a classifier, replacing any existing one of the same kind.
    pub fn assign(&self, classifier: Arc<dyn Classifier>) {
        let mut classifiers = self.classifiers.write().unwrap();
        classifiers.retain(|c| c.kind() != classifier.kind());
        let pos = classifiers
            .iter()
            .position(|c| c.kind() > classifier.kind())
            .unwrap_or(classifiers.len());
        classifiers.insert(pos, classifier);
    }

    /// Unassign a classifier. The default classifier stays assigned for the
    /// whole life of the flow.
    pub fn unassign(&self, kind: ClassifierKind) -> bool {
        if kind == ClassifierKind::Default {
            return false;
        }
        let mut classifiers = self.classifiers.write().unwrap();
        let before = classifiers.len();
        classifiers.retain(|c| c.kind() != kind);
        classifiers.len() != before
    }

    pub fn timer_group(&self) -> TimerGroup {
        self.timer.lock().unwrap().group
    }

    /// Move the flow to another timer group and restart its idle timer.
    pub fn reset_timer(&self, group: TimerGroup) {
        let mut timer = self.timer.lock().unwrap();
        timer.group = group;
        timer.last_touched = Instant::now();
    }

    /// Refresh the idle timer. Returns false once the flow has been removed
    /// from the database.
    pub fn touch(&self) -> bool {
        let mut timer = self.timer.lock().unwrap();
        if timer.removed {
            return false;
        }
        if !timer.no_touch {
            timer.last_touched = Instant::now();
        }
        true
    }

    /// Stop packets from refreshing the idle timer.
    pub fn set_no_touch(&self) {
        self.timer.lock().unwrap().no_touch = true;
    }

    pub fn no_touch(&self) -> bool {
        self.timer.lock().unwrap().no_touch
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timer.lock().unwrap().last_touched)
    }

    pub(crate) fn mark_removed(&self) {
        self.timer.lock().unwrap().removed = true;
    }

    pub fn is_removed(&self) -> bool {
        self.timer.lock().unwrap().removed
    }

    pub fn regen_occurrences(&self) -> u32 {
        self.regen_occurrences.load(Ordering::Acquire)
    }

    /// Record a topology change affecting this flow.
    pub fn needs_regeneration(&self) {
        self.regen_occurrences.fetch_add(1, Ordering::AcqRel);
        self.regen_required.store(true, Ordering::Release);
    }

    /// Consume a pending regeneration request.
    pub fn take_regeneration_required(&self) -> bool {
        self.regen_required.swap(false, Ordering::AcqRel)
    }

    pub fn update_totals(&self, sender: Sender, bytes: usize) {
        let mut totals = self.totals.lock().unwrap();
        match sender {
            Sender::Src => {
                totals.from_packets += 1;
                totals.from_bytes += bytes as u64;
            }
            Sender::Dest => {
                totals.to_packets += 1;
                totals.to_bytes += bytes as u64;
            }
        }
    }

    pub fn update_dropped(&self, sender: Sender, bytes: usize) {
        let mut totals = self.totals.lock().unwrap();
        match sender {
            Sender::Src => {
                totals.from_dropped_packets += 1;
                totals.from_dropped_bytes += bytes as u64;
            }
            Sender::Dest => {
                totals.to_dropped_packets += 1;
                totals.to_dropped_bytes += bytes as u64;
            }
        }
    }

    pub fn totals(&self) -> DataTotals {
        *self.totals.lock().unwrap()
    }
}

impl fmt::Debug for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRecord")
            .field("serial", &self.serial)
            .field("tuple", &self.tuple)
            .field("direction", &self.direction)
            .field("mode", &self.accel.mode())
            .finish_non_exhaustive()
    }
}

/// Builder for a new [`FlowRecord`].
///
/// Admission fills in each resolved piece in turn; dropping the builder on
/// an early return releases everything acquired so far.
pub struct FlowRecordBuilder {
    serial: FlowSerial,
    tuple: FlowTuple,
    direction: FlowDirection,
    routed: bool,
    can_accel: bool,
    limits: AccelLimits,
    from: Option<ResolvedSide>,
    to: Option<ResolvedSide>,
    classifiers: Vec<Arc<dyn Classifier>>,
    timer_group: Option<TimerGroup>,
}

impl FlowRecordBuilder {
    pub fn new(serial: FlowSerial, tuple: FlowTuple, direction: FlowDirection) -> Self {
        Self {
            serial,
            tuple,
            direction,
            routed: true,
            can_accel: true,
            limits: AccelLimits::default(),
            from: None,
            to: None,
            classifiers: Vec::new(),
            timer_group: None,
        }
    }

    pub fn routed(mut self, routed: bool) -> Self {
        self.routed = routed;
        self
    }

    pub fn can_accel(mut self, can_accel: bool) -> Self {
        self.can_accel = can_accel;
        self
    }

    pub fn limits(mut self, limits: AccelLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn from_side(mut self, side: ResolvedSide) -> Self {
        self.from = Some(side);
        self
    }

    pub fn to_side(mut self, side: ResolvedSide) -> Self {
        self.to = Some(side);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifiers.push(classifier);
        self
    }

    pub fn timer_group(mut self, group: TimerGroup) -> Self {
        self.timer_group = Some(group);
        self
    }

    pub fn build(self) -> Result<FlowRecord> {
        let from = self
            .from
            .ok_or_else(|| AccelError::Resolution(format!("flow {}: missing from side", self.serial)))?;
        let to = self
            .to
            .ok_or_else(|| AccelError::Resolution(format!("flow {}: missing to side", self.serial)))?;
        if !self.classifiers.iter().any(|c| c.kind() == ClassifierKind::Default) {
            return Err(AccelError::Resolution(format!(
                "flow {}: default classifier not assigned",
                self.serial
            )));
        }

        let mut classifiers = self.classifiers;
        classifiers.sort_by_key(|c| c.kind());

        let timer_group = self.timer_group.unwrap_or(match self.tuple.protocol {
            super::TransportProtocol::Tcp => TimerGroup::TcpShort,
            super::TransportProtocol::Udp => TimerGroup::UdpGeneric,
        });

        Ok(FlowRecord {
            serial: self.serial,
            tuple: self.tuple,
            direction: self.direction,
            routed: self.routed,
            paths: RwLock::new(Paths { from, to }),
            classifiers: RwLock::new(classifiers),
            timer: Mutex::new(FlowTimer {
                group: timer_group,
                last_touched: Instant::now(),
                no_touch: false,
                removed: false,
            }),
            regen_occurrences: AtomicU32::new(0),
            regen_required: AtomicBool::new(false),
            totals: Mutex::new(DataTotals::default()),
            accel: FlowAccel::new(self.tuple.protocol, self.can_accel, &self.limits),
        })
    }
}
