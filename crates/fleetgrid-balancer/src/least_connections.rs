//! Least-connections selection.
//!
//! Every selection increments the chosen instance's open-connection
//! counter; callers must `release` it when the work completes, or the
//! counters only ever grow and selection degenerates toward round-robin.
//! Counters of instances that leave the registry are dropped with
//! `forget` or `retain_live`.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use fleetgrid_state::InstanceRecord;

use crate::strategy::LoadBalancingStrategy;

/// Picks the candidate with the fewest open connections.
#[derive(Debug, Default)]
pub struct LeastConnections {
    /// instance_id → open connections.
    counts: Mutex<HashMap<String, u64>>,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark one connection to `instance_id` as finished.
    ///
    /// Floors at zero; unknown ids are a logged no-op.
    pub fn release(&self, instance_id: &str) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        match counts.get_mut(instance_id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                debug!(%instance_id, open = *count, "connection released");
            }
            Some(_) => debug!(%instance_id, "release on idle instance ignored"),
            None => warn!(%instance_id, "release for unknown instance"),
        }
    }

    /// Drop the counter of an instance that left the registry.
    pub fn forget(&self, instance_id: &str) -> bool {
        let removed = self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(instance_id);
        if let Some(open) = removed {
            debug!(%instance_id, open, "connection counter dropped");
        }
        removed.is_some()
    }

    /// Keep only counters whose id is in `live`. Returns how many were
    /// dropped.
    pub fn retain_live(&self, live: &HashSet<String>) -> usize {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let before = counts.len();
        counts.retain(|id, _| live.contains(id));
        before - counts.len()
    }

    /// Read-only copy of the current counters.
    pub fn snapshot_connection_counts(&self) -> HashMap<String, u64> {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LoadBalancingStrategy for LeastConnections {
    fn name(&self) -> &'static str {
        "least-connections"
    }

    fn select_instance(
        &self,
        _service_name: &str,
        candidates: &[InstanceRecord],
    ) -> Option<InstanceRecord> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);

        // min_by_key keeps the first of equal minima, i.e. input order.
        let chosen = candidates
            .iter()
            .min_by_key(|c| counts.get(&c.id).copied().unwrap_or(0))?;

        let count = counts.entry(chosen.id.clone()).or_insert(0);
        *count += 1;
        debug!(instance_id = %chosen.id, open = *count, "least-connections selection");
        Some(chosen.clone())
    }

    fn release(&self, instance_id: &str) {
        LeastConnections::release(self, instance_id);
    }

    fn forget(&self, instance_id: &str) {
        LeastConnections::forget(self, instance_id);
    }

    fn connection_counts(&self) -> HashMap<String, u64> {
        self.snapshot_connection_counts()
    }
}
