//! Domain types shared by the registry, balancer, and autoscaler.
//!
//! Registry records are JSON-serialized into redb's `&[u8]` value columns;
//! pool instances live only in the autoscaler's memory.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a registered or pooled instance.
pub type InstanceId = String;

// ── Registry ──────────────────────────────────────────────────────

/// Wire protocol an instance serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

/// Network address of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAddress {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl InstanceAddress {
    /// Full address string, e.g. `http://10.0.0.1:8080`.
    pub fn endpoint(&self) -> String {
        let scheme = match self.protocol {
            Protocol::Http => "http",
            Protocol::Https => "https",
        };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Health status as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Registration input supplied by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub service_name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

/// A registered instance of a logical service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub service_name: String,
    pub version: String,
    pub address: InstanceAddress,
    pub health_check_path: String,
    pub metadata: HashMap<String, String>,
    /// Unix timestamp (seconds) of registration.
    pub registered_at: u64,
    /// Unix timestamp (seconds) of the last heartbeat or health update.
    pub last_heartbeat: u64,
    pub health: HealthStatus,
}

impl InstanceRecord {
    /// Build a fresh record from a registration spec.
    ///
    /// New records always start `Unknown`.
    pub fn from_spec(id: InstanceId, spec: InstanceSpec, now: u64) -> Self {
        Self {
            id,
            service_name: spec.service_name,
            version: spec.version,
            address: InstanceAddress {
                host: spec.host,
                port: spec.port,
                protocol: spec.protocol,
            },
            health_check_path: spec.health_check_path,
            metadata: spec.metadata,
            registered_at: now,
            last_heartbeat: now,
            health: HealthStatus::Unknown,
        }
    }

    /// Build the composite key for the instances table.
    pub fn table_key(&self) -> String {
        instance_key(&self.service_name, &self.id)
    }

    pub fn is_healthy(&self) -> bool {
        self.health == HealthStatus::Healthy
    }

    /// Seconds since the last heartbeat, saturating at zero.
    pub fn heartbeat_age(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_heartbeat)
    }

    /// Refresh the heartbeat timestamp without moving it backwards.
    pub fn touch(&mut self, now: u64) {
        self.last_heartbeat = self.last_heartbeat.max(now);
    }
}

/// Composite key `{service}:{id}` used by the durable store.
pub fn instance_key(service_name: &str, id: &str) -> String {
    format!("{service_name}:{id}")
}

/// Key prefix matching every instance of a service.
pub fn service_prefix(service_name: &str) -> String {
    format!("{service_name}:")
}

// ── Autoscaler pool ───────────────────────────────────────────────

/// Lifecycle status of a pooled instance.
///
/// Transitions are strictly `Starting → Running → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleStatus {
    /// Whether `self → next` is a legal single step.
    pub fn can_transition_to(self, next: LifecycleStatus) -> bool {
        matches!(
            (self, next),
            (LifecycleStatus::Starting, LifecycleStatus::Running)
                | (LifecycleStatus::Running, LifecycleStatus::Stopping)
                | (LifecycleStatus::Stopping, LifecycleStatus::Stopped)
        )
    }

    /// Starting or running instances count against capacity.
    pub fn is_active(self) -> bool {
        matches!(self, LifecycleStatus::Starting | LifecycleStatus::Running)
    }
}

/// Hardware descriptor for pooled instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    pub cpu: u32,
    pub memory_mb: u64,
    pub cost_per_hour: f64,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Per-instance utilization reported by the telemetry collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct InstanceMetrics {
    /// CPU utilization, percent (0–100).
    pub cpu_utilization: f64,
    /// Memory utilization, percent (0–100).
    pub memory_utilization: f64,
    pub requests_per_second: f64,
    pub response_time_ms: f64,
}

/// An instance managed by the autoscaler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolInstance {
    pub id: InstanceId,
    pub status: LifecycleStatus,
    pub region: String,
    pub instance_type: InstanceType,
    /// Unix timestamp (seconds) when creation was requested.
    pub created_at: u64,
    /// Unix timestamp (seconds) when the instance reached `Running`.
    pub started_at: Option<u64>,
    pub metrics: Option<InstanceMetrics>,
}

impl PoolInstance {
    pub fn new(id: InstanceId, region: String, instance_type: InstanceType, now: u64) -> Self {
        Self {
            id,
            status: LifecycleStatus::Starting,
            region,
            instance_type,
            created_at: now,
            started_at: None,
            metrics: None,
        }
    }

    /// Apply a lifecycle transition. Returns false (and leaves the
    /// instance untouched) if the step is not legal.
    pub fn transition(&mut self, next: LifecycleStatus, now: u64) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        if next == LifecycleStatus::Running {
            self.started_at = Some(now);
        }
        self.status = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_type() -> InstanceType {
        InstanceType {
            name: "small".to_string(),
            cpu: 2,
            memory_mb: 4096,
            cost_per_hour: 0.05,
            capabilities: vec![],
        }
    }

    #[test]
    fn lifecycle_only_moves_forward_one_step() {
        use LifecycleStatus::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));

        assert!(!Starting.can_transition_to(Stopping));
        assert!(!Starting.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Stopped));
    }

    #[test]
    fn pool_instance_records_start_time() {
        let mut inst = PoolInstance::new("i-1".to_string(), "us".to_string(), test_type(), 100);
        assert_eq!(inst.status, LifecycleStatus::Starting);
        assert!(!inst.transition(LifecycleStatus::Stopped, 105));
        assert!(inst.transition(LifecycleStatus::Running, 110));
        assert_eq!(inst.started_at, Some(110));
        assert!(inst.transition(LifecycleStatus::Stopping, 120));
        assert!(!inst.transition(LifecycleStatus::Running, 121));
        assert_eq!(inst.status, LifecycleStatus::Stopping);
    }

    #[test]
    fn record_from_spec_starts_unknown() {
        let spec = InstanceSpec {
            service_name: "orders".to_string(),
            version: "1.2.0".to_string(),
            host: "10.0.0.1".to_string(),
            port: 8080,
            protocol: Protocol::Https,
            health_check_path: "/healthz".to_string(),
            metadata: HashMap::new(),
        };
        let rec = InstanceRecord::from_spec("abc".to_string(), spec, 1000);
        assert_eq!(rec.health, HealthStatus::Unknown);
        assert_eq!(rec.registered_at, rec.last_heartbeat);
        assert_eq!(rec.table_key(), "orders:abc");
        assert_eq!(rec.address.endpoint(), "https://10.0.0.1:8080");
    }

    #[test]
    fn touch_never_moves_heartbeat_backwards() {
        let spec = InstanceSpec {
            service_name: "orders".to_string(),
            version: "1".to_string(),
            host: "h".to_string(),
            port: 1,
            protocol: Protocol::Http,
            health_check_path: "/".to_string(),
            metadata: HashMap::new(),
        };
        let mut rec = InstanceRecord::from_spec("a".to_string(), spec, 1000);
        rec.touch(900);
        assert_eq!(rec.last_heartbeat, 1000);
        rec.touch(1050);
        assert_eq!(rec.heartbeat_age(1060), 10);
        assert_eq!(rec.heartbeat_age(10), 0);
    }
}
