//! fleetd.toml configuration parser.
//!
//! Every section is optional; missing keys take the defaults below.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use fleetgrid_state::InstanceType;
use thiserror::Error;

use crate::duration::parse_duration;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct FleetConfig {
    pub registry: RegistryConfig,
    pub balancer: BalancerConfig,
    pub scaling: ScalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Heartbeat age after which an instance is demoted to unhealthy.
    pub stale_after: String,
    /// Heartbeat age after which an instance is purged.
    pub evict_after: String,
    pub sweep_interval: String,
    pub cleanup_interval: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after: "30s".to_string(),
            evict_after: "5m".to_string(),
            sweep_interval: "10s".to_string(),
            cleanup_interval: "60s".to_string(),
        }
    }
}

impl RegistryConfig {
    pub fn stale_after(&self) -> Duration {
        parse_duration(&self.stale_after).unwrap_or(Duration::from_secs(30))
    }

    pub fn evict_after(&self) -> Duration {
        parse_duration(&self.evict_after).unwrap_or(Duration::from_secs(300))
    }

    pub fn sweep_interval(&self) -> Duration {
        parse_duration(&self.sweep_interval).unwrap_or(Duration::from_secs(10))
    }

    pub fn cleanup_interval(&self) -> Duration {
        parse_duration(&self.cleanup_interval).unwrap_or(Duration::from_secs(60))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let stale = parse_duration(&self.stale_after)?;
        let evict = parse_duration(&self.evict_after)?;
        let sweep = parse_duration(&self.sweep_interval)?;
        let cleanup = parse_duration(&self.cleanup_interval)?;
        if evict <= stale {
            return Err(ConfigError::Invalid(
                "registry.evict_after must exceed registry.stale_after".to_string(),
            ));
        }
        if sweep.is_zero() || cleanup.is_zero() {
            return Err(ConfigError::Invalid(
                "registry sweep intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BalancerConfig {
    /// Strategy used when a caller names none or an unknown one.
    pub default_strategy: String,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            default_strategy: "round-robin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScalingConfig {
    pub min_instances: u32,
    pub max_instances: u32,
    /// Percent (0–100).
    pub target_cpu_utilization: f64,
    /// Percent (0–100).
    pub target_memory_utilization: f64,
    pub scale_up_cooldown_seconds: u64,
    pub scale_down_cooldown_seconds: u64,
    pub regions: Vec<String>,
    pub instance_types: Vec<InstanceType>,
    pub tick_interval: String,
    /// Number of aggregate samples kept in the sliding window.
    pub metrics_window: usize,
    pub provisioning_delay: String,
    pub teardown_delay: String,
    /// Mean response time above which the fleet scales up.
    pub high_response_time_ms: f64,
    /// Mean response time below which the fleet may scale down.
    pub low_response_time_ms: f64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_instances: 2,
            max_instances: 10,
            target_cpu_utilization: 70.0,
            target_memory_utilization: 80.0,
            scale_up_cooldown_seconds: 300,
            scale_down_cooldown_seconds: 600,
            regions: vec!["us-east-1".to_string()],
            instance_types: vec![InstanceType {
                name: "standard".to_string(),
                cpu: 2,
                memory_mb: 4096,
                cost_per_hour: 0.10,
                capabilities: vec![],
            }],
            tick_interval: "30s".to_string(),
            metrics_window: 10,
            provisioning_delay: "5s".to_string(),
            teardown_delay: "3s".to_string(),
            high_response_time_ms: 1000.0,
            low_response_time_ms: 200.0,
        }
    }
}

impl ScalingConfig {
    pub fn tick_interval(&self) -> Duration {
        parse_duration(&self.tick_interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn provisioning_delay(&self) -> Duration {
        parse_duration(&self.provisioning_delay).unwrap_or(Duration::from_secs(5))
    }

    pub fn teardown_delay(&self) -> Duration {
        parse_duration(&self.teardown_delay).unwrap_or(Duration::from_secs(3))
    }

    /// Clamp a desired instance count into `[min_instances, max_instances]`.
    pub fn clamp(&self, desired: u32) -> u32 {
        desired.clamp(self.min_instances, self.max_instances)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_instances > self.max_instances {
            return Err(ConfigError::Invalid(format!(
                "scaling.min_instances ({}) exceeds scaling.max_instances ({})",
                self.min_instances, self.max_instances
            )));
        }
        if self.regions.is_empty() {
            return Err(ConfigError::Invalid(
                "scaling.regions must not be empty".to_string(),
            ));
        }
        if self.instance_types.is_empty() {
            return Err(ConfigError::Invalid(
                "scaling.instance_types must not be empty".to_string(),
            ));
        }
        for (name, value) in [
            ("target_cpu_utilization", self.target_cpu_utilization),
            ("target_memory_utilization", self.target_memory_utilization),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::Invalid(format!(
                    "scaling.{name} must be in (0, 100], got {value}"
                )));
            }
        }
        if self.metrics_window < 3 {
            return Err(ConfigError::Invalid(
                "scaling.metrics_window must hold at least 3 samples".to_string(),
            ));
        }
        if self.low_response_time_ms > self.high_response_time_ms {
            return Err(ConfigError::Invalid(
                "scaling.low_response_time_ms exceeds scaling.high_response_time_ms".to_string(),
            ));
        }
        if parse_duration(&self.tick_interval)?.is_zero() {
            return Err(ConfigError::Invalid(
                "scaling.tick_interval must be non-zero".to_string(),
            ));
        }
        parse_duration(&self.provisioning_delay)?;
        parse_duration(&self.teardown_delay)?;
        Ok(())
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registry.validate()?;
        self.scaling.validate()?;
        if self.balancer.default_strategy.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "balancer.default_strategy must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
