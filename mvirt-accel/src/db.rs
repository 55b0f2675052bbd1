//! Flow database.
//!
//! Owns the tuple table of live flows. The serial index only holds weak
//! references: a flow removed from the table stays findable by serial for
//! as long as anything else (an outstanding engine command, the packet
//! path) still holds it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Instant;

use tracing::debug;

use crate::config::IdleTimeouts;
use crate::flow::{FlowRecord, FlowSerial, FlowTuple};

pub trait FlowDatabase: Send + Sync {
    /// Find a flow by tuple, in either orientation.
    fn lookup(&self, tuple: &FlowTuple) -> Option<Arc<FlowRecord>>;

    fn lookup_by_serial(&self, serial: FlowSerial) -> Option<Arc<FlowRecord>>;

    /// Insert `record` unless a flow with the same tuple already exists.
    /// Returns the flow that is in the table afterwards and whether it is
    /// the one passed in.
    fn insert_or_get(&self, record: FlowRecord) -> (Arc<FlowRecord>, bool);

    /// Remove a flow from the tuple table.
    fn remove(&self, serial: FlowSerial) -> Option<Arc<FlowRecord>>;

    fn next_serial(&self) -> FlowSerial;

    /// Flows idle past the timeout of their timer group.
    fn expired(&self, now: Instant, timeouts: &IdleTimeouts) -> Vec<Arc<FlowRecord>>;

    /// Every flow in the tuple table.
    fn flows(&self) -> Vec<Arc<FlowRecord>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release bookkeeping of flows that have been freed. Returns the
    /// number of entries dropped.
    fn prune(&self) -> usize {
        0
    }
}

/// In-memory flow database.
#[derive(Debug)]
pub struct MemoryFlowDb {
    flows: RwLock<HashMap<FlowTuple, Arc<FlowRecord>>>,
    serials: RwLock<HashMap<FlowSerial, Weak<FlowRecord>>>,
    next_serial: AtomicU32,
}

impl MemoryFlowDb {
    pub fn new() -> Self {
        Self {
            flows: RwLock::new(HashMap::new()),
            serials: RwLock::new(HashMap::new()),
            next_serial: AtomicU32::new(1),
        }
    }

    pub fn serial_index_len(&self) -> usize {
        self.serials.read().unwrap().len()
    }
}

impl Default for MemoryFlowDb {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowDatabase for MemoryFlowDb {
    fn lookup(&self, tuple: &FlowTuple) -> Option<Arc<FlowRecord>> {
        let flows = self.flows.read().unwrap();
        flows
            .get(tuple)
            .or_else(|| flows.get(&tuple.reversed()))
            .cloned()
    }

    fn lookup_by_serial(&self, serial: FlowSerial) -> Option<Arc<FlowRecord>> {
        if let Some(flow) = self.serials.read().unwrap().get(&serial)?.upgrade() {
            return Some(flow);
        }
        let mut serials = self.serials.write().unwrap();
        if serials
            .get(&serial)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            serials.remove(&serial);
        }
        None
    }

    fn insert_or_get(&self, record: FlowRecord) -> (Arc<FlowRecord>, bool) {
        let tuple = *record.tuple();
        let mut flows = self.flows.write().unwrap();
        if let Some(existing) = flows
            .get(&tuple)
            .or_else(|| flows.get(&tuple.reversed()))
        {
            debug!(
                serial = %existing.serial(),
                loser = %record.serial(),
                "Concurrent flow creation collapsed"
            );
            return (existing.clone(), false);
        }

        let record = Arc::new(record);
        self.serials
            .write()
            .unwrap()
            .insert(record.serial(), Arc::downgrade(&record));
        flows.insert(tuple, record.clone());
        debug!(serial = %record.serial(), flow = %tuple, "Flow added");
        (record, true)
    }

    fn remove(&self, serial: FlowSerial) -> Option<Arc<FlowRecord>> {
        let record = self.lookup_by_serial(serial)?;
        let removed = self.flows.write().unwrap().remove(record.tuple())?;
        removed.mark_removed();
        debug!(%serial, "Flow removed");
        Some(removed)
    }

    fn next_serial(&self) -> FlowSerial {
        FlowSerial(self.next_serial.fetch_add(1, Ordering::Relaxed))
    }

    fn expired(&self, now: Instant, timeouts: &IdleTimeouts) -> Vec<Arc<FlowRecord>> {
        self.flows
            .read()
            .unwrap()
            .values()
            .filter(|flow| flow.idle_for(now) >= timeouts.for_group(flow.timer_group()))
            .cloned()
            .collect()
    }

    fn flows(&self) -> Vec<Arc<FlowRecord>> {
        self.flows.read().unwrap().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.flows.read().unwrap().len()
    }

    fn prune(&self) -> usize {
        let mut serials = self.serials.write().unwrap();
        let before = serials.len();
        serials.retain(|_, weak| weak.strong_count() > 0);
        before - serials.len()
    }
}
