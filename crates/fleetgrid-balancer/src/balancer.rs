//! LoadBalancer — resolves a service name to one instance.
//!
//! Fetches the full instance list from the registry (health filtering is
//! a strategy's business, see `HealthBased`), resolves the requested
//! strategy by name, and delegates.
//!
//! Connection accounting (`release`, the counters) goes to whatever
//! strategy is registered as `least-connections` at call time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleet_core::BalancerConfig;
use fleetgrid_registry::ServiceRegistry;
use fleetgrid_state::{ControlEvent, InstanceAddress, InstanceRecord};

use crate::health_based::HealthBased;
use crate::least_connections::LeastConnections;
use crate::strategy::{LoadBalancingStrategy, Random, RoundRobin, WeightedRoundRobin};

/// Outcome of a selection request.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Selected(InstanceRecord),
    /// No instance could be chosen (unknown service or no instances).
    Unavailable,
}

impl Selection {
    pub fn instance(&self) -> Option<&InstanceRecord> {
        match self {
            Selection::Selected(record) => Some(record),
            Selection::Unavailable => None,
        }
    }

    pub fn address(&self) -> Option<&InstanceAddress> {
        self.instance().map(|r| &r.address)
    }

    pub fn into_instance(self) -> Option<InstanceRecord> {
        match self {
            Selection::Selected(record) => Some(record),
            Selection::Unavailable => None,
        }
    }
}

const FALLBACK_STRATEGY: &str = "round-robin";
const CONNECTION_COUNTING: &str = "least-connections";

/// Named strategies over a shared registry.
pub struct LoadBalancer {
    registry: Arc<ServiceRegistry>,
    strategies: HashMap<&'static str, Arc<dyn LoadBalancingStrategy>>,
    default_strategy: &'static str,
}

impl LoadBalancer {
    /// Build a balancer with the built-in strategies registered.
    pub fn new(registry: Arc<ServiceRegistry>, config: &BalancerConfig) -> Self {
        let mut balancer = Self {
            registry,
            strategies: HashMap::new(),
            default_strategy: FALLBACK_STRATEGY,
        };

        balancer.add_strategy(Arc::new(RoundRobin::new()));
        balancer.add_strategy(Arc::new(Random::new()));
        balancer.add_strategy(Arc::new(WeightedRoundRobin::new()));
        balancer.add_strategy(Arc::new(LeastConnections::new()));
        balancer.add_strategy(Arc::new(HealthBased::new(Arc::new(RoundRobin::new()))));

        balancer.set_default_strategy(&config.default_strategy);
        balancer
    }

    /// Register (or replace) a strategy under its own name.
    ///
    /// Replacing `least-connections` also moves `release` and the
    /// connection counters to the new instance.
    pub fn add_strategy(&mut self, strategy: Arc<dyn LoadBalancingStrategy>) {
        self.strategies.insert(strategy.name(), strategy);
    }

    /// Change the default. Unknown names keep the current default.
    pub fn set_default_strategy(&mut self, name: &str) {
        match self.strategies.get_key_value(name) {
            Some((key, _)) => self.default_strategy = key,
            None => warn!(
                strategy = %name,
                default = self.default_strategy,
                "unknown default strategy, keeping current"
            ),
        }
    }

    pub fn default_strategy(&self) -> &'static str {
        self.default_strategy
    }

    /// Registered strategy names, sorted.
    pub fn strategy_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.strategies.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Pick one instance of `service_name`.
    ///
    /// `strategy` of `None` or an unrecognized name uses the default.
    pub async fn select_instance(&self, service_name: &str, strategy: Option<&str>) -> Selection {
        let strategy = self.resolve(strategy);
        let candidates = self.registry.list_instances(service_name).await;

        match strategy.select_instance(service_name, &candidates) {
            Some(record) => {
                debug!(
                    service = %service_name,
                    strategy = strategy.name(),
                    instance_id = %record.id,
                    "instance selected"
                );
                Selection::Selected(record)
            }
            None => {
                debug!(service = %service_name, strategy = strategy.name(), "no instance available");
                Selection::Unavailable
            }
        }
    }

    /// Return a least-connections slot once the work on `instance_id` ends.
    pub fn release(&self, instance_id: &str) {
        match self.strategies.get(CONNECTION_COUNTING) {
            Some(strategy) => strategy.release(instance_id),
            None => warn!(%instance_id, "no connection-counting strategy registered"),
        }
    }

    /// Current least-connections counters.
    pub fn snapshot_connection_counts(&self) -> HashMap<String, u64> {
        self.strategies
            .get(CONNECTION_COUNTING)
            .map(|strategy| strategy.connection_counts())
            .unwrap_or_default()
    }

    /// Drop every strategy's state for an instance that left the registry.
    pub fn forget(&self, instance_id: &str) {
        for strategy in self.strategies.values() {
            strategy.forget(instance_id);
        }
    }

    /// Drop connection counters of instances no longer registered.
    /// Returns how many were dropped.
    pub async fn prune_connection_counts(&self) -> usize {
        let mut live = HashSet::new();
        for service in self.registry.list_services().await {
            live.extend(
                self.registry
                    .list_instances(&service)
                    .await
                    .into_iter()
                    .map(|r| r.id),
            );
        }

        let mut dropped = 0;
        for id in self.snapshot_connection_counts().into_keys() {
            if !live.contains(&id) {
                self.forget(&id);
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(dropped, "stale connection counters pruned");
        }
        dropped
    }

    /// Forget instances as the registry removes them, until `shutdown`
    /// flips. A lagged receiver falls back to a full prune.
    pub async fn track_removals(
        &self,
        mut events: broadcast::Receiver<ControlEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("balancer removal tracking started");
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(ControlEvent::InstanceRemoved { instance_id, .. }) => self.forget(&instance_id),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "balancer lagged behind registry events, pruning");
                        self.prune_connection_counts().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("balancer removal tracking stopped");
    }

    fn resolve(&self, name: Option<&str>) -> Arc<dyn LoadBalancingStrategy> {
        if let Some(name) = name {
            if let Some(strategy) = self.strategies.get(name) {
                return strategy.clone();
            }
            warn!(
                strategy = %name,
                default = self.default_strategy,
                "unknown strategy, using default"
            );
        }
        match self.strategies.get(self.default_strategy) {
            Some(strategy) => strategy.clone(),
            // The default always names a registered strategy; this only
            // guards against a replaced map.
            None => Arc::new(RoundRobin::new()),
        }
    }
}
