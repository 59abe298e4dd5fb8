//! Assembles the control plane from a `FleetConfig`.
//!
//! Construction is explicit: the caller owns the store and the metrics
//! source and hands them in. `start` spawns every background loop against
//! one shutdown signal and returns their handles.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use fleet_core::FleetConfig;
use fleetgrid_autoscale::{AutoScaler, MetricsSource, Provisioner};
use fleetgrid_balancer::LoadBalancer;
use fleetgrid_registry::{RegistrySweeper, ServiceRegistry};
use fleetgrid_state::{EventBus, InstanceStore};

use crate::monitor;

pub struct ControlPlane {
    config: FleetConfig,
    events: EventBus,
    registry: Arc<ServiceRegistry>,
    balancer: Arc<LoadBalancer>,
    autoscaler: Arc<AutoScaler>,
}

impl ControlPlane {
    /// Build every component and reload registry state from `store`.
    pub async fn new(
        config: FleetConfig,
        store: Arc<dyn InstanceStore>,
        metrics: Arc<dyn MetricsSource>,
        provisioner: Arc<dyn Provisioner>,
    ) -> anyhow::Result<Self> {
        let events = EventBus::default();

        let registry = Arc::new(
            ServiceRegistry::new(store, events.clone()).with_config(&config.registry),
        );
        registry.recover().await?;

        let balancer = Arc::new(LoadBalancer::new(Arc::clone(&registry), &config.balancer));
        info!(default_strategy = balancer.default_strategy(), "load balancer initialized");

        let autoscaler = Arc::new(
            AutoScaler::new(config.scaling.clone(), metrics, events.clone())?
                .with_provisioner(provisioner),
        );
        info!(
            min = config.scaling.min_instances,
            max = config.scaling.max_instances,
            "autoscaler initialized"
        );

        Ok(Self {
            config,
            events,
            registry,
            balancer,
            autoscaler,
        })
    }

    /// Bring the pool up to its minimum and spawn the background loops.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(monitor::run(
            self.events.subscribe(),
            shutdown.clone(),
        )));

        self.autoscaler.initialize().await;

        let sweeper = RegistrySweeper::new(Arc::clone(&self.registry), &self.config.registry);
        handles.push(tokio::spawn(sweeper.run(shutdown.clone())));

        let balancer = Arc::clone(&self.balancer);
        let removals = self.events.subscribe();
        let balancer_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            balancer.track_removals(removals, balancer_shutdown).await;
        }));

        let autoscaler = Arc::clone(&self.autoscaler);
        handles.push(tokio::spawn(async move {
            autoscaler.run(shutdown).await;
        }));

        info!(tasks = handles.len(), "background tasks started");
        handles
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    pub fn autoscaler(&self) -> &Arc<AutoScaler> {
        &self.autoscaler
    }
}
