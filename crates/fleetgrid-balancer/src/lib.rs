//! fleetgrid-balancer — choose one instance of a service per request.
//!
//! # Architecture
//!
//! ```text
//! LoadBalancer
//!   ├── ServiceRegistry (full instance list per service)
//!   └── name → Arc<dyn LoadBalancingStrategy>
//!       ├── round-robin           per-service cursor
//!       ├── weighted-round-robin  same rotation, all weights 1
//!       ├── random                uniform, stateless
//!       ├── least-connections     open-connection counters + release()
//!       └── health-based          healthy filter → inner strategy,
//!                                 unfiltered fallback when none healthy
//! ```

pub mod balancer;
pub mod health_based;
pub mod least_connections;
pub mod strategy;

pub use balancer::{LoadBalancer, Selection};
pub use health_based::HealthBased;
pub use least_connections::LeastConnections;
pub use strategy::{LoadBalancingStrategy, Random, RoundRobin, WeightedRoundRobin};
