pub mod config;
pub mod duration;

pub use config::{BalancerConfig, ConfigError, FleetConfig, RegistryConfig, ScalingConfig};
pub use duration::parse_duration;
