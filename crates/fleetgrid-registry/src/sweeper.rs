//! Background sweeps over the registry.
//!
//! One task drives two timers: the heartbeat sweep (demote stale
//! instances) and the slower cleanup sweep (evict long-silent ones).
//! Missed ticks are skipped, never queued, and a failing sweep only logs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use fleet_core::RegistryConfig;
use fleetgrid_state::epoch_secs;

use crate::registry::ServiceRegistry;

/// Periodic heartbeat and cleanup sweeps for a [`ServiceRegistry`].
pub struct RegistrySweeper {
    registry: Arc<ServiceRegistry>,
    sweep_interval: Duration,
    cleanup_interval: Duration,
}

impl RegistrySweeper {
    pub fn new(registry: Arc<ServiceRegistry>, config: &RegistryConfig) -> Self {
        Self {
            registry,
            sweep_interval: config.sweep_interval(),
            cleanup_interval: config.cleanup_interval(),
        }
    }

    /// Override both intervals.
    pub fn with_intervals(mut self, sweep: Duration, cleanup: Duration) -> Self {
        self.sweep_interval = sweep;
        self.cleanup_interval = cleanup;
        self
    }

    /// Run both sweeps until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cleanup = tokio::time::interval(self.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            sweep_ms = self.sweep_interval.as_millis() as u64,
            cleanup_ms = self.cleanup_interval.as_millis() as u64,
            "registry sweeper started"
        );

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let demoted = self.registry.demote_stale(epoch_secs()).await;
                    if demoted > 0 {
                        debug!(demoted, "heartbeat sweep complete");
                    }
                }
                _ = cleanup.tick() => {
                    let evicted = self.registry.evict_expired(epoch_secs()).await;
                    if evicted > 0 {
                        debug!(evicted, "cleanup sweep complete");
                    }
                }
                _ = shutdown.changed() => {
                    info!("registry sweeper shutting down");
                    break;
                }
            }
        }
    }
}
