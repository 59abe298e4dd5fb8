//! End-to-end wiring tests.
//!
//! Builds the full control plane over an in-memory (or temp-dir) store and
//! drives it the way producers and callers would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use fleet_core::FleetConfig;
use fleetd::ControlPlane;
use fleetgrid_autoscale::{NoopProvisioner, NullMetrics, StaticMetrics};
use fleetgrid_balancer::Selection;
use fleetgrid_state::*;

fn spec(service: &str, port: u16) -> InstanceSpec {
    InstanceSpec {
        service_name: service.to_string(),
        version: "1.0.0".to_string(),
        host: "10.0.0.5".to_string(),
        port,
        protocol: Protocol::Http,
        health_check_path: "/health".to_string(),
        metadata: HashMap::new(),
    }
}

async fn build_plane(config: FleetConfig, store: Arc<dyn InstanceStore>) -> ControlPlane {
    ControlPlane::new(
        config,
        store,
        Arc::new(NullMetrics),
        Arc::new(NoopProvisioner),
    )
    .await
    .unwrap()
}

async fn in_memory_plane(config: FleetConfig) -> ControlPlane {
    build_plane(config, Arc::new(StateStore::open_in_memory().unwrap())).await
}

#[test]
fn sample_config_is_valid() {
    let config = FleetConfig::from_toml(include_str!("../fleetd.toml")).unwrap();
    assert_eq!(config.balancer.default_strategy, "health-based");
    assert_eq!(config.scaling.regions.len(), 2);
    assert_eq!(config.registry.sweep_interval(), Duration::from_secs(10));
}

#[tokio::test]
async fn register_heartbeat_and_select() {
    let plane = in_memory_plane(FleetConfig::default()).await;
    let registry = plane.registry();

    let a = registry.register(spec("orders", 8001)).await.unwrap();
    let b = registry.register(spec("orders", 8002)).await.unwrap();
    assert!(registry.list_healthy("orders").await.is_empty());

    registry.heartbeat("orders", &b).await;
    let healthy: Vec<String> = registry
        .list_healthy("orders")
        .await
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(healthy, vec![b.clone()]);

    let balancer = plane.balancer();
    for _ in 0..3 {
        let selected = balancer.select_instance("orders", Some("health-based")).await;
        assert_eq!(selected.instance().map(|r| r.id.clone()), Some(b.clone()));
    }

    // Plain round-robin still sees the unknown instance.
    let first = balancer.select_instance("orders", Some("round-robin")).await;
    assert_eq!(first.into_instance().map(|r| r.id), Some(a));

    assert_eq!(
        balancer.select_instance("payments", None).await,
        Selection::Unavailable
    );
}

#[tokio::test]
async fn least_connections_through_the_plane() {
    let plane = in_memory_plane(FleetConfig::default()).await;
    let registry = plane.registry();
    let balancer = plane.balancer();

    let a = registry.register(spec("orders", 8001)).await.unwrap();
    let b = registry.register(spec("orders", 8002)).await.unwrap();
    let c = registry.register(spec("orders", 8003)).await.unwrap();

    let mut held = Vec::new();
    for _ in 0..4 {
        let selected = balancer
            .select_instance("orders", Some("least-connections"))
            .await
            .into_instance()
            .unwrap();
        held.push(selected.id);
    }
    assert_eq!(held, vec![a.clone(), b.clone(), c.clone(), a.clone()]);

    balancer.release(&b);
    let chosen = balancer
        .select_instance("orders", Some("least-connections"))
        .await
        .into_instance()
        .unwrap();
    assert_eq!(chosen.id, b);

    let counts = balancer.snapshot_connection_counts();
    assert_eq!((counts[&a], counts[&b], counts[&c]), (2, 1, 1));
}

#[tokio::test]
async fn registry_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleetgrid.redb");

    let id = {
        let store = StateStore::open(&path).unwrap();
        let plane = build_plane(FleetConfig::default(), Arc::new(store)).await;
        let id = plane.registry().register(spec("orders", 9000)).await.unwrap();
        plane.registry().unregister("orders", "missing").await.unwrap();
        id
    };

    let store = StateStore::open(&path).unwrap();
    let plane = build_plane(FleetConfig::default(), Arc::new(store)).await;
    let record = plane.registry().get_instance("orders", &id).await.unwrap();
    assert_eq!(record.address.port, 9000);
    assert_eq!(plane.registry().stats().await.totals.total, 1);
}

#[tokio::test]
async fn start_initializes_pool_and_stops_cleanly() {
    let mut config = FleetConfig::default();
    config.scaling.min_instances = 2;
    config.scaling.regions = vec!["us".to_string(), "eu".to_string()];
    let plane = in_memory_plane(config).await;
    let mut events = plane.events().subscribe();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = plane.start(shutdown_rx).await;

    let status = plane.autoscaler().status().await;
    assert_eq!(status.starting + status.running, 2);

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("background task did not stop")
            .unwrap();
    }
    plane.autoscaler().shutdown();

    // Registration after start still publishes.
    plane.registry().register(spec("orders", 8001)).await.unwrap();
    let mut registered = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ControlEvent::InstanceRegistered { .. }) {
            registered = true;
        }
    }
    assert!(registered);
}

#[tokio::test]
async fn unregistered_instances_leave_the_connection_counters() {
    let plane = in_memory_plane(FleetConfig::default()).await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = plane.start(shutdown_rx).await;

    let registry = plane.registry();
    let balancer = plane.balancer();
    let id = registry.register(spec("orders", 8001)).await.unwrap();
    balancer.select_instance("orders", Some("least-connections")).await;
    assert_eq!(balancer.snapshot_connection_counts()[&id], 1);

    registry.unregister("orders", &id).await.unwrap();
    for _ in 0..100 {
        if balancer.snapshot_connection_counts().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(balancer.snapshot_connection_counts().is_empty());

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
    plane.autoscaler().shutdown();
}

#[tokio::test(start_paused = true)]
async fn autoscaler_reacts_to_load() {
    let mut config = FleetConfig::default();
    config.scaling.min_instances = 4;
    config.scaling.regions = vec!["us".to_string(), "eu".to_string()];

    let metrics = Arc::new(StaticMetrics::new(InstanceMetrics {
        cpu_utilization: 95.0,
        memory_utilization: 40.0,
        requests_per_second: 200.0,
        response_time_ms: 150.0,
    }));
    let plane = ControlPlane::new(
        config,
        Arc::new(StateStore::open_in_memory().unwrap()),
        metrics,
        Arc::new(NoopProvisioner),
    )
    .await
    .unwrap();

    let scaler = plane.autoscaler();
    scaler.initialize().await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    for now in [1000, 1030, 1060] {
        scaler.tick_at(now).await;
    }
    let history = scaler.scaling_history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].instances_added, 2);
    assert_eq!(history[0].total_instances, 6);
}
