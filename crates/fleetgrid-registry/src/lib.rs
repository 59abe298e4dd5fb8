//! fleetgrid-registry — which service instances exist and whether they are healthy.
//!
//! # Architecture
//!
//! ```text
//! ServiceRegistry
//!   ├── RwLock<service → Vec<InstanceRecord>>   (request-path state)
//!   ├── InstanceStore (durable copy, redb in production)
//!   └── EventBus (instance_registered / instance_health_changed)
//!
//! RegistrySweeper (background task)
//!   ├── heartbeat sweep: demote instances silent > stale_after
//!   └── cleanup sweep:   evict instances silent > evict_after
//! ```
//!
//! Health verdicts from outside checkers arrive through
//! `ServiceRegistry::set_health`.
//!
//! Register and unregister surface durable-store failures. Heartbeats and
//! health updates never wait on the store; the sweeps reconcile.

pub mod error;
pub mod registry;
pub mod sweeper;

pub use error::{RegistryError, RegistryResult};
pub use registry::{RegistryStats, ServiceRegistry, ServiceStats};
pub use sweeper::RegistrySweeper;
