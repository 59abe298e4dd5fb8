//! The strategy trait and the stateless/rotation strategies.
//!
//! A strategy picks one instance out of a candidate list. It never
//! mutates the list and returns `None` on empty input.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use rand::Rng;

use fleetgrid_state::InstanceRecord;

/// A pluggable algorithm for choosing one instance from a candidate set.
pub trait LoadBalancingStrategy: Send + Sync {
    /// Name callers use to request this strategy.
    fn name(&self) -> &'static str;

    /// Pick one of `candidates` for a request to `service_name`.
    fn select_instance(
        &self,
        service_name: &str,
        candidates: &[InstanceRecord],
    ) -> Option<InstanceRecord>;

    /// One connection to `instance_id` finished. No-op unless the
    /// strategy counts connections.
    fn release(&self, _instance_id: &str) {}

    /// Drop per-instance state for an instance that left the registry.
    fn forget(&self, _instance_id: &str) {}

    /// Open-connection counters, empty unless the strategy keeps them.
    fn connection_counts(&self) -> HashMap<String, u64> {
        HashMap::new()
    }
}

/// Per-service cursors shared by the rotation strategies.
#[derive(Debug, Default)]
struct Rotation {
    cursors: Mutex<HashMap<String, usize>>,
}

impl Rotation {
    /// Return the current index for `service_name` and advance it.
    ///
    /// Returns `None` if `len` is zero. New services start at 0.
    fn next(&self, service_name: &str, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        let cursor = cursors.entry(service_name.to_string()).or_insert(0);
        // The candidate list may have shrunk since the last call.
        let idx = *cursor % len;
        *cursor = (idx + 1) % len;
        Some(idx)
    }

    fn current(&self, service_name: &str) -> usize {
        let cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        cursors.get(service_name).copied().unwrap_or(0)
    }
}

/// Cycles through candidates in input order, one cursor per service.
#[derive(Debug, Default)]
pub struct RoundRobin {
    rotation: Rotation,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index the next selection for `service_name` will start from.
    pub fn cursor(&self, service_name: &str) -> usize {
        self.rotation.current(service_name)
    }
}

impl LoadBalancingStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select_instance(
        &self,
        service_name: &str,
        candidates: &[InstanceRecord],
    ) -> Option<InstanceRecord> {
        let idx = self.rotation.next(service_name, candidates.len())?;
        candidates.get(idx).cloned()
    }
}

/// Uniformly random choice. Stateless.
#[derive(Debug, Default)]
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancingStrategy for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select_instance(
        &self,
        _service_name: &str,
        candidates: &[InstanceRecord],
    ) -> Option<InstanceRecord> {
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..candidates.len());
        candidates.get(idx).cloned()
    }
}

/// Weighted rotation. Every instance currently weighs 1, so this rotates
/// exactly like [`RoundRobin`].
// TODO: read per-instance weights from `metadata["weight"]` once producers
// start publishing them.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    rotation: Rotation,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingStrategy for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "weighted-round-robin"
    }

    fn select_instance(
        &self,
        service_name: &str,
        candidates: &[InstanceRecord],
    ) -> Option<InstanceRecord> {
        let idx = self.rotation.next(service_name, candidates.len())?;
        candidates.get(idx).cloned()
    }
}
