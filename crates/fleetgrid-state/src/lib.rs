//! fleetgrid-state — shared data model and durable store for FleetGrid.
//!
//! Holds the types every control-plane component agrees on
//! (`InstanceRecord`, `PoolInstance`, lifecycle and health enums), the
//! `ControlEvent` bus, and the redb-backed `StateStore`.
//!
//! # Architecture
//!
//! Registry records are JSON-serialized into redb's `&[u8]` value columns
//! under composite keys `{service_name}:{instance_id}`, so listing a
//! service is a prefix scan. The `StateStore` is `Clone` + `Send` + `Sync`
//! (backed by `Arc<Database>`) and can be shared across async tasks.

pub mod error;
pub mod events;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use events::{ControlEvent, EventBus, ScalingEvent, ScalingKind};
pub use store::{InstanceStore, StateStore};
pub use types::*;

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
