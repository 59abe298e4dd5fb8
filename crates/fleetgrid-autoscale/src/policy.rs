//! Where new instances go and which ones leave first.

use fleetgrid_state::{InstanceId, PoolInstance};

/// Placement and victim selection for scaling actions.
pub trait ScalePolicy: Send + Sync + 'static {
    /// One region per instance to create. May return fewer than `count`
    /// (an empty result makes the scale-up a no-op).
    fn place(&mut self, regions: &[String], count: usize) -> Vec<String>;

    /// Up to `count` ids out of `running` to terminate.
    fn victims(&self, running: &[PoolInstance], count: usize) -> Vec<InstanceId>;
}

/// Regions in rotation; oldest-started instances removed first.
#[derive(Debug, Default)]
pub struct RoundRobinOldestFirst {
    next_region: usize,
}

impl RoundRobinOldestFirst {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScalePolicy for RoundRobinOldestFirst {
    fn place(&mut self, regions: &[String], count: usize) -> Vec<String> {
        if regions.is_empty() {
            return Vec::new();
        }
        (0..count)
            .map(|_| {
                let region = regions[self.next_region % regions.len()].clone();
                self.next_region = (self.next_region + 1) % regions.len();
                region
            })
            .collect()
    }

    fn victims(&self, running: &[PoolInstance], count: usize) -> Vec<InstanceId> {
        let mut ordered: Vec<&PoolInstance> = running.iter().collect();
        // Stable sort: equal start times keep pool (creation) order.
        ordered.sort_by_key(|i| (i.started_at.unwrap_or(i.created_at), i.created_at));
        ordered.into_iter().take(count).map(|i| i.id.clone()).collect()
    }
}
