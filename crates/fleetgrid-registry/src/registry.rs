//! ServiceRegistry — which instances exist per service name, and their health.
//!
//! All mutations go through one `RwLock` over the per-service instance
//! lists, so a heartbeat and a sweep touching the same instance are
//! linearized. Reads clone a snapshot under the read lock.
//!
//! `register` and `unregister` wait for the durable store and surface its
//! errors. Heartbeat and health writes are handed to a blocking task and
//! never hold up the caller; failures are logged and the sweeps reconcile.
//! A detached write persists whatever the in-memory record holds when it
//! runs, under the read lock, and is dropped if the instance is gone. So
//! it can neither resurrect an unregistered instance nor store a stale
//! copy over a newer one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fleet_core::RegistryConfig;
use fleetgrid_state::*;

use crate::error::{RegistryError, RegistryResult};

/// Per-service instance counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

impl ServiceStats {
    fn count(&mut self, health: HealthStatus) {
        self.total += 1;
        match health {
            HealthStatus::Healthy => self.healthy += 1,
            HealthStatus::Unhealthy => self.unhealthy += 1,
            HealthStatus::Unknown => self.unknown += 1,
        }
    }
}

/// Registry-wide counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub services: BTreeMap<String, ServiceStats>,
    pub totals: ServiceStats,
}

/// Tracks registered instances per logical service name.
pub struct ServiceRegistry {
    /// service_name → instances in registration order.
    services: Arc<RwLock<HashMap<String, Vec<InstanceRecord>>>>,
    store: Arc<dyn InstanceStore>,
    events: EventBus,
    /// Heartbeat age after which an instance is demoted.
    stale_after: Duration,
    /// Heartbeat age after which an instance is purged.
    evict_after: Duration,
}

impl ServiceRegistry {
    /// Create a registry with default thresholds (30s stale, 5m evict).
    pub fn new(store: Arc<dyn InstanceStore>, events: EventBus) -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            store,
            events,
            stale_after: Duration::from_secs(30),
            evict_after: Duration::from_secs(300),
        }
    }

    /// Apply thresholds from the `[registry]` config section.
    pub fn with_config(self, config: &RegistryConfig) -> Self {
        self.with_stale_after(config.stale_after())
            .with_evict_after(config.evict_after())
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_evict_after(mut self, evict_after: Duration) -> Self {
        self.evict_after = evict_after;
        self
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ── Request path ───────────────────────────────────────────────

    /// Register a new instance and return its id.
    ///
    /// The record is persisted before it becomes visible. It starts
    /// `Unknown` and stays out of `list_healthy` until promoted.
    pub async fn register(&self, spec: InstanceSpec) -> RegistryResult<InstanceId> {
        validate_spec(&spec)?;

        let id = Uuid::new_v4().to_string();
        let record = InstanceRecord::from_spec(id.clone(), spec, epoch_secs());

        let stored = record.clone();
        self.with_store(move |store| store.put(&stored)).await?;

        let service_name = record.service_name.clone();
        let endpoint = record.address.endpoint();
        {
            let mut services = self.services.write().await;
            services
                .entry(service_name.clone())
                .or_default()
                .push(record);
        }

        info!(service = %service_name, instance_id = %id, %endpoint, "instance registered");
        self.events.publish(ControlEvent::InstanceRegistered {
            service_name,
            instance_id: id.clone(),
        });
        Ok(id)
    }

    /// Remove an instance. Unknown ids are a no-op.
    pub async fn unregister(&self, service_name: &str, id: &str) -> RegistryResult<()> {
        let removed = {
            let mut services = self.services.write().await;
            remove_instance(&mut services, service_name, id)
        };

        if removed.is_none() {
            warn!(service = %service_name, instance_id = %id, "unregister for unknown instance");
            return Ok(());
        }
        self.events.publish(ControlEvent::InstanceRemoved {
            service_name: service_name.to_string(),
            instance_id: id.to_string(),
        });

        let key = instance_key(service_name, id);
        self.with_store(move |store| store.delete(&key)).await?;
        info!(service = %service_name, instance_id = %id, "instance unregistered");
        Ok(())
    }

    /// Record a liveness signal.
    ///
    /// A heartbeat promotes `Unknown` and `Unhealthy` instances to
    /// `Healthy`. Unknown instances are logged and ignored.
    pub async fn heartbeat(&self, service_name: &str, id: &str) {
        let now = epoch_secs();
        let (record, previous) = {
            let mut services = self.services.write().await;
            let Some(record) = find_instance_mut(&mut services, service_name, id) else {
                warn!(service = %service_name, instance_id = %id, "heartbeat from unknown instance");
                return;
            };
            record.touch(now);
            let previous = record.health;
            record.health = HealthStatus::Healthy;
            (record.clone(), previous)
        };

        debug!(service = %service_name, instance_id = %id, "heartbeat received");
        if previous != HealthStatus::Healthy {
            self.announce_health_change(&record, previous);
        }
        self.persist_detached(&record);
    }

    /// Explicit health transition from an external health checker.
    ///
    /// Also refreshes the heartbeat. Moving back to `Unknown` is not a
    /// legal transition and is ignored.
    pub async fn set_health(&self, service_name: &str, id: &str, status: HealthStatus) {
        if status == HealthStatus::Unknown {
            warn!(service = %service_name, instance_id = %id, "refusing transition to unknown health");
            return;
        }

        let now = epoch_secs();
        let (record, previous) = {
            let mut services = self.services.write().await;
            let Some(record) = find_instance_mut(&mut services, service_name, id) else {
                warn!(service = %service_name, instance_id = %id, "health update for unknown instance");
                return;
            };
            record.touch(now);
            let previous = record.health;
            record.health = status;
            (record.clone(), previous)
        };

        if previous != status {
            self.announce_health_change(&record, previous);
        }
        self.persist_detached(&record);
    }

    /// Healthy instances of a service, in registration order.
    pub async fn list_healthy(&self, service_name: &str) -> Vec<InstanceRecord> {
        let services = self.services.read().await;
        services
            .get(service_name)
            .map(|list| list.iter().filter(|r| r.is_healthy()).cloned().collect())
            .unwrap_or_default()
    }

    /// Every instance of a service regardless of health.
    pub async fn list_instances(&self, service_name: &str) -> Vec<InstanceRecord> {
        let services = self.services.read().await;
        services.get(service_name).cloned().unwrap_or_default()
    }

    pub async fn get_instance(&self, service_name: &str, id: &str) -> Option<InstanceRecord> {
        let services = self.services.read().await;
        services
            .get(service_name)
            .and_then(|list| list.iter().find(|r| r.id == id).cloned())
    }

    /// Service names with at least one instance, sorted.
    pub async fn list_services(&self) -> Vec<String> {
        let services = self.services.read().await;
        let mut names: Vec<String> = services.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn stats(&self) -> RegistryStats {
        let services = self.services.read().await;
        let mut stats = RegistryStats::default();
        for (name, list) in services.iter() {
            let entry = stats.services.entry(name.clone()).or_default();
            for record in list {
                entry.count(record.health);
                stats.totals.count(record.health);
            }
        }
        stats
    }

    // ── Sweeps ─────────────────────────────────────────────────────

    /// Demote every instance whose heartbeat age exceeds the staleness
    /// threshold. Returns the number of instances demoted.
    pub async fn demote_stale(&self, now: u64) -> usize {
        let threshold = self.stale_after.as_secs();
        let demoted: Vec<(InstanceRecord, HealthStatus)> = {
            let mut services = self.services.write().await;
            services
                .values_mut()
                .flat_map(|list| list.iter_mut())
                .filter(|r| r.health != HealthStatus::Unhealthy && r.heartbeat_age(now) > threshold)
                .map(|r| {
                    let previous = r.health;
                    r.health = HealthStatus::Unhealthy;
                    (r.clone(), previous)
                })
                .collect()
        };

        for (record, previous) in &demoted {
            warn!(
                service = %record.service_name,
                instance_id = %record.id,
                age_secs = record.heartbeat_age(now),
                "instance heartbeat stale, marked unhealthy"
            );
            self.announce_health_change(record, *previous);
            self.persist_detached(record);
        }
        demoted.len()
    }

    /// Purge instances silent beyond the eviction threshold from memory
    /// and the durable store. Returns the number evicted.
    pub async fn evict_expired(&self, now: u64) -> usize {
        let threshold = self.evict_after.as_secs();
        let evicted: Vec<InstanceRecord> = {
            let mut services = self.services.write().await;
            let mut evicted = Vec::new();
            for list in services.values_mut() {
                let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(list)
                    .into_iter()
                    .partition(|r| r.heartbeat_age(now) > threshold);
                *list = kept;
                evicted.extend(expired);
            }
            services.retain(|_, list| !list.is_empty());
            evicted
        };

        for record in &evicted {
            self.events.publish(ControlEvent::InstanceRemoved {
                service_name: record.service_name.clone(),
                instance_id: record.id.clone(),
            });
            let key = record.table_key();
            match self.with_store(move |store| store.delete(&key)).await {
                Ok(_) => info!(
                    service = %record.service_name,
                    instance_id = %record.id,
                    "expired instance evicted"
                ),
                Err(e) => error!(
                    service = %record.service_name,
                    instance_id = %record.id,
                    error = %e,
                    "failed to delete evicted instance from store"
                ),
            }
        }
        evicted.len()
    }

    /// Reload every record from the durable store (startup recovery).
    ///
    /// Records already in memory are left untouched. Returns the number
    /// of records loaded.
    pub async fn recover(&self) -> RegistryResult<usize> {
        let records = self.with_store(|store| store.list_prefix("")).await?;

        let mut services = self.services.write().await;
        let mut loaded = 0;
        for record in records {
            let list = services.entry(record.service_name.clone()).or_default();
            if list.iter().any(|r| r.id == record.id) {
                continue;
            }
            list.push(record);
            loaded += 1;
        }
        for list in services.values_mut() {
            list.sort_by_key(|r| r.registered_at);
        }

        info!(loaded, "registry recovered from durable store");
        Ok(loaded)
    }

    // ── Internals ──────────────────────────────────────────────────

    async fn with_store<T, F>(&self, op: F) -> RegistryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn InstanceStore) -> StateResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|e| RegistryError::Store(StateError::Unavailable(e.to_string())))?
            .map_err(RegistryError::Store)
    }

    /// Fire-and-forget write for hot-path updates.
    ///
    /// Holds the read lock across the put: `unregister` and eviction take
    /// the write lock to drop the record before deleting it, so the write
    /// lands either before the delete or not at all.
    fn persist_detached(&self, record: &InstanceRecord) {
        let services = Arc::clone(&self.services);
        let store = Arc::clone(&self.store);
        let service_name = record.service_name.clone();
        let id = record.id.clone();
        tokio::task::spawn_blocking(move || {
            let services = services.blocking_read();
            let Some(current) = services
                .get(&service_name)
                .and_then(|list| list.iter().find(|r| r.id == id))
            else {
                debug!(service = %service_name, instance_id = %id, "instance gone, update not persisted");
                return;
            };
            if let Err(e) = store.put(current) {
                error!(
                    service = %service_name,
                    instance_id = %id,
                    error = %e,
                    "failed to persist instance update"
                );
            }
        });
    }

    fn announce_health_change(&self, record: &InstanceRecord, previous: HealthStatus) {
        info!(
            service = %record.service_name,
            instance_id = %record.id,
            from = ?previous,
            to = ?record.health,
            "instance health changed"
        );
        self.events.publish(ControlEvent::InstanceHealthChanged {
            service_name: record.service_name.clone(),
            instance_id: record.id.clone(),
            from: previous,
            to: record.health,
        });
    }
}

fn validate_spec(spec: &InstanceSpec) -> RegistryResult<()> {
    if spec.service_name.trim().is_empty() {
        return Err(RegistryError::Validation("service name is required".to_string()));
    }
    if spec.host.trim().is_empty() {
        return Err(RegistryError::Validation("host is required".to_string()));
    }
    if spec.port == 0 {
        return Err(RegistryError::Validation("port is required".to_string()));
    }
    Ok(())
}

fn find_instance_mut<'a>(
    services: &'a mut HashMap<String, Vec<InstanceRecord>>,
    service_name: &str,
    id: &str,
) -> Option<&'a mut InstanceRecord> {
    services
        .get_mut(service_name)?
        .iter_mut()
        .find(|r| r.id == id)
}

fn remove_instance(
    services: &mut HashMap<String, Vec<InstanceRecord>>,
    service_name: &str,
    id: &str,
) -> Option<InstanceRecord> {
    let list = services.get_mut(service_name)?;
    let idx = list.iter().position(|r| r.id == id)?;
    let removed = list.remove(idx);
    if list.is_empty() {
        services.remove(service_name);
    }
    Some(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Wraps the in-memory store and fails every call while `failing` is set.
    struct FlakyStore {
        inner: StateStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: StateStore::open_in_memory().unwrap(),
                failing: AtomicBool::new(false),
            })
        }

        fn check(&self) -> StateResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                Err(StateError::Unavailable("disk on fire".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl InstanceStore for FlakyStore {
        fn put(&self, record: &InstanceRecord) -> StateResult<()> {
            self.check()?;
            self.inner.put(record)
        }
        fn get(&self, key: &str) -> StateResult<Option<InstanceRecord>> {
            self.check()?;
            self.inner.get(key)
        }
        fn delete(&self, key: &str) -> StateResult<bool> {
            self.check()?;
            self.inner.delete(key)
        }
        fn list_prefix(&self, prefix: &str) -> StateResult<Vec<InstanceRecord>> {
            self.check()?;
            self.inner.list_prefix(prefix)
        }
    }

    /// In-memory store whose writes take a while to land.
    struct SlowPutStore {
        inner: StateStore,
        delay: Duration,
    }

    impl InstanceStore for SlowPutStore {
        fn put(&self, record: &InstanceRecord) -> StateResult<()> {
            std::thread::sleep(self.delay);
            self.inner.put(record)
        }
        fn get(&self, key: &str) -> StateResult<Option<InstanceRecord>> {
            self.inner.get(key)
        }
        fn delete(&self, key: &str) -> StateResult<bool> {
            self.inner.delete(key)
        }
        fn list_prefix(&self, prefix: &str) -> StateResult<Vec<InstanceRecord>> {
            self.inner.list_prefix(prefix)
        }
    }

    fn spec(service: &str, port: u16) -> InstanceSpec {
        InstanceSpec {
            service_name: service.to_string(),
            version: "1.0.0".to_string(),
            host: "10.0.0.1".to_string(),
            port,
            protocol: Protocol::Http,
            health_check_path: "/health".to_string(),
            metadata: HashMap::new(),
        }
    }

    fn registry_with(store: Arc<dyn InstanceStore>) -> ServiceRegistry {
        ServiceRegistry::new(store, EventBus::default())
            .with_stale_after(Duration::from_secs(30))
            .with_evict_after(Duration::from_secs(300))
    }

    fn registry() -> ServiceRegistry {
        registry_with(Arc::new(StateStore::open_in_memory().unwrap()))
    }

    /// Backdate an instance's heartbeat for sweep tests.
    async fn set_last_heartbeat(reg: &ServiceRegistry, service: &str, id: &str, at: u64) {
        let mut services = reg.services.write().await;
        let rec = find_instance_mut(&mut services, service, id).unwrap();
        rec.last_heartbeat = at;
        rec.registered_at = rec.registered_at.min(at);
    }

    async fn health_of(reg: &ServiceRegistry, service: &str, id: &str) -> HealthStatus {
        reg.get_instance(service, id).await.unwrap().health
    }

    #[tokio::test]
    async fn register_assigns_unique_ids_and_persists() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let reg = registry_with(store.clone());

        let a = reg.register(spec("orders", 8080)).await.unwrap();
        let b = reg.register(spec("orders", 8081)).await.unwrap();
        assert_ne!(a, b);

        assert_eq!(reg.list_instances("orders").await.len(), 2);
        let stored = store.get(&instance_key("orders", &a)).unwrap().unwrap();
        assert_eq!(stored.health, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn register_rejects_missing_host_or_port() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let reg = registry_with(store.clone());

        let mut no_host = spec("orders", 8080);
        no_host.host = "  ".to_string();
        assert!(matches!(
            reg.register(no_host).await,
            Err(RegistryError::Validation(_))
        ));
        assert!(matches!(
            reg.register(spec("orders", 0)).await,
            Err(RegistryError::Validation(_))
        ));
        assert!(matches!(
            reg.register(spec("", 8080)).await,
            Err(RegistryError::Validation(_))
        ));

        assert!(reg.list_instances("orders").await.is_empty());
        assert!(store.list_prefix("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_surfaces_store_failure() {
        let store = FlakyStore::new();
        store.failing.store(true, Ordering::SeqCst);
        let reg = registry_with(store.clone());

        let result = reg.register(spec("orders", 8080)).await;
        assert!(matches!(result, Err(RegistryError::Store(_))));
        assert!(reg.list_instances("orders").await.is_empty());

        // Retryable once the store recovers.
        store.failing.store(false, Ordering::SeqCst);
        assert!(reg.register(spec("orders", 8080)).await.is_ok());
    }

    #[tokio::test]
    async fn fresh_instances_are_not_healthy() {
        let reg = registry();
        let id = reg.register(spec("orders", 8080)).await.unwrap();

        assert!(reg.list_healthy("orders").await.is_empty());

        reg.set_health("orders", &id, HealthStatus::Healthy).await;
        let healthy = reg.list_healthy("orders").await;
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, id);
    }

    #[tokio::test]
    async fn heartbeat_promotes_instance() {
        let reg = registry();
        let id = reg.register(spec("orders", 8080)).await.unwrap();

        reg.heartbeat("orders", &id).await;
        assert_eq!(reg.list_healthy("orders").await.len(), 1);
    }

    #[tokio::test]
    async fn list_healthy_unknown_service_is_empty() {
        let reg = registry();
        assert!(reg.list_healthy("nope").await.is_empty());
        assert!(reg.list_instances("nope").await.is_empty());
    }

    #[tokio::test]
    async fn list_healthy_keeps_registration_order() {
        let reg = registry();
        let a = reg.register(spec("orders", 1)).await.unwrap();
        let b = reg.register(spec("orders", 2)).await.unwrap();
        let c = reg.register(spec("orders", 3)).await.unwrap();

        reg.set_health("orders", &c, HealthStatus::Healthy).await;
        reg.set_health("orders", &a, HealthStatus::Healthy).await;
        reg.set_health("orders", &b, HealthStatus::Unhealthy).await;

        let ids: Vec<String> = reg.list_healthy("orders").await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let reg = registry_with(store.clone());
        let id = reg.register(spec("orders", 8080)).await.unwrap();

        reg.unregister("orders", &id).await.unwrap();
        reg.unregister("orders", &id).await.unwrap();
        reg.unregister("ghost", "nobody").await.unwrap();

        assert!(reg.get_instance("orders", &id).await.is_none());
        assert!(store.get(&instance_key("orders", &id)).unwrap().is_none());
        assert!(reg.list_services().await.is_empty());
    }

    #[tokio::test]
    async fn unregister_surfaces_store_failure() {
        let store = FlakyStore::new();
        let reg = registry_with(store.clone());
        let id = reg.register(spec("orders", 8080)).await.unwrap();

        store.failing.store(true, Ordering::SeqCst);
        assert!(matches!(
            reg.unregister("orders", &id).await,
            Err(RegistryError::Store(_))
        ));
    }

    #[tokio::test]
    async fn heartbeat_and_health_survive_store_failure() {
        let store = FlakyStore::new();
        let reg = registry_with(store.clone());
        let id = reg.register(spec("orders", 8080)).await.unwrap();

        store.failing.store(true, Ordering::SeqCst);
        reg.heartbeat("orders", &id).await;
        reg.set_health("orders", &id, HealthStatus::Unhealthy).await;

        let rec = reg.get_instance("orders", &id).await.unwrap();
        assert_eq!(rec.health, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn late_heartbeat_write_does_not_resurrect_unregistered_instance() {
        let store = Arc::new(SlowPutStore {
            inner: StateStore::open_in_memory().unwrap(),
            delay: Duration::from_millis(100),
        });
        let reg = registry_with(store.clone());
        let id = reg.register(spec("orders", 8080)).await.unwrap();

        reg.heartbeat("orders", &id).await;
        reg.unregister("orders", &id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(store.get(&instance_key("orders", &id)).unwrap().is_none());
        let restarted = registry_with(store.clone());
        assert_eq!(restarted.recover().await.unwrap(), 0);
        assert!(restarted.list_services().await.is_empty());
    }

    #[tokio::test]
    async fn detached_writes_persist_latest_health() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let reg = registry_with(store.clone());
        let id = reg.register(spec("orders", 8080)).await.unwrap();

        reg.heartbeat("orders", &id).await;
        reg.set_health("orders", &id, HealthStatus::Unhealthy).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stored = store.get(&instance_key("orders", &id)).unwrap().unwrap();
        assert_eq!(stored.health, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_instance_is_noop() {
        let reg = registry();
        reg.heartbeat("orders", "ghost").await;
        reg.set_health("orders", "ghost", HealthStatus::Healthy).await;
        assert!(reg.list_services().await.is_empty());
    }

    #[tokio::test]
    async fn set_health_refuses_unknown() {
        let reg = registry();
        let id = reg.register(spec("orders", 8080)).await.unwrap();
        reg.set_health("orders", &id, HealthStatus::Healthy).await;
        reg.set_health("orders", &id, HealthStatus::Unknown).await;

        let rec = reg.get_instance("orders", &id).await.unwrap();
        assert_eq!(rec.health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn demote_stale_hits_exactly_the_stale_instances() {
        let reg = registry();
        let fresh = reg.register(spec("orders", 1)).await.unwrap();
        let edge = reg.register(spec("orders", 2)).await.unwrap();
        let stale = reg.register(spec("orders", 3)).await.unwrap();
        let silent = reg.register(spec("billing", 4)).await.unwrap();
        for id in [&fresh, &edge, &stale] {
            reg.set_health("orders", id, HealthStatus::Healthy).await;
        }

        let now = 10_000;
        set_last_heartbeat(&reg, "orders", &fresh, now - 5).await;
        // Exactly at the threshold is not stale.
        set_last_heartbeat(&reg, "orders", &edge, now - 30).await;
        set_last_heartbeat(&reg, "orders", &stale, now - 31).await;
        set_last_heartbeat(&reg, "billing", &silent, now - 100).await;

        assert_eq!(reg.demote_stale(now).await, 2);

        assert_eq!(health_of(&reg, "orders", &fresh).await, HealthStatus::Healthy);
        assert_eq!(health_of(&reg, "orders", &edge).await, HealthStatus::Healthy);
        assert_eq!(health_of(&reg, "orders", &stale).await, HealthStatus::Unhealthy);
        assert_eq!(health_of(&reg, "billing", &silent).await, HealthStatus::Unhealthy);

        // A second sweep finds nothing new.
        assert_eq!(reg.demote_stale(now).await, 0);

        // A later heartbeat brings the instance back.
        reg.heartbeat("orders", &stale).await;
        assert_eq!(health_of(&reg, "orders", &stale).await, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn demotion_publishes_health_event() {
        let reg = registry();
        let mut rx = reg.events().subscribe();
        let id = reg.register(spec("orders", 1)).await.unwrap();
        set_last_heartbeat(&reg, "orders", &id, 0).await;

        reg.demote_stale(1_000).await;

        let registered = rx.recv().await.unwrap();
        assert!(matches!(registered, ControlEvent::InstanceRegistered { .. }));
        let changed = rx.recv().await.unwrap();
        assert_eq!(
            changed,
            ControlEvent::InstanceHealthChanged {
                service_name: "orders".to_string(),
                instance_id: id,
                from: HealthStatus::Unknown,
                to: HealthStatus::Unhealthy,
            }
        );
    }

    #[tokio::test]
    async fn evict_expired_purges_memory_and_store() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let reg = registry_with(store.clone());
        let keep = reg.register(spec("orders", 1)).await.unwrap();
        let gone = reg.register(spec("orders", 2)).await.unwrap();
        let lone = reg.register(spec("billing", 3)).await.unwrap();

        let now = 100_000;
        set_last_heartbeat(&reg, "orders", &keep, now - 60).await;
        set_last_heartbeat(&reg, "orders", &gone, now - 301).await;
        set_last_heartbeat(&reg, "billing", &lone, now - 1_000).await;

        assert_eq!(reg.evict_expired(now).await, 2);

        assert!(reg.get_instance("orders", &keep).await.is_some());
        assert!(reg.get_instance("orders", &gone).await.is_none());
        assert_eq!(reg.list_services().await, vec!["orders".to_string()]);
        assert!(store.get(&instance_key("orders", &gone)).unwrap().is_none());
        assert!(store.get(&instance_key("billing", &lone)).unwrap().is_none());
    }

    #[tokio::test]
    async fn unregister_and_eviction_publish_removal() {
        let reg = registry();
        let gone = reg.register(spec("orders", 1)).await.unwrap();
        let stale = reg.register(spec("orders", 2)).await.unwrap();
        let mut rx = reg.events().subscribe();

        reg.unregister("orders", &gone).await.unwrap();
        set_last_heartbeat(&reg, "orders", &stale, 0).await;
        reg.evict_expired(10_000).await;

        let mut removed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ControlEvent::InstanceRemoved { instance_id, .. } = event {
                removed.push(instance_id);
            }
        }
        assert_eq!(removed, vec![gone, stale]);
    }

    #[tokio::test]
    async fn stats_counts_per_service_and_total() {
        let reg = registry();
        let a = reg.register(spec("orders", 1)).await.unwrap();
        let b = reg.register(spec("orders", 2)).await.unwrap();
        reg.register(spec("billing", 3)).await.unwrap();

        reg.set_health("orders", &a, HealthStatus::Healthy).await;
        reg.set_health("orders", &b, HealthStatus::Unhealthy).await;

        let stats = reg.stats().await;
        assert_eq!(
            stats.services["orders"],
            ServiceStats { total: 2, healthy: 1, unhealthy: 1, unknown: 0 }
        );
        assert_eq!(stats.services["billing"].unknown, 1);
        assert_eq!(stats.totals.total, 3);
        assert_eq!(stats.totals.healthy, 1);
    }

    #[tokio::test]
    async fn recover_reloads_from_store() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let first = registry_with(store.clone());
        let a = first.register(spec("orders", 1)).await.unwrap();
        first.register(spec("billing", 2)).await.unwrap();

        let second = registry_with(store.clone());
        assert_eq!(second.recover().await.unwrap(), 2);
        assert!(second.get_instance("orders", &a).await.is_some());

        // Recovering again does not duplicate.
        assert_eq!(second.recover().await.unwrap(), 0);
        assert_eq!(second.stats().await.totals.total, 2);
    }
}
