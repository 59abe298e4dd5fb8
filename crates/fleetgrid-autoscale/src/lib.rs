//! fleetgrid-autoscale — metrics-driven pool scaling.
//!
//! Manages a pool of `PoolInstance`s spread across regions. A periodic
//! tick samples utilization through a [`MetricsSource`], and creation or
//! termination goes through a [`Provisioner`]. Every action is recorded as
//! a `ScalingEvent` and published on the `EventBus`.
//!
//! # Scaling Algorithm
//!
//! ```text
//! window  = last `metrics_window` fleet-wide means (running instances only)
//! mean    = average of the newest 3 samples   (fewer than 3 → skip)
//!
//! scale up   if running < max and up-cooldown elapsed and
//!               (cpu > target_cpu or mem > target_mem or rt > high_rt):
//!     add ceil(running * 0.5), capped so starting + running <= max
//!
//! otherwise
//! scale down if running > min and down-cooldown elapsed and
//!               cpu < target_cpu/2 and mem < target_mem/2 and rt < low_rt:
//!     remove floor(running * 0.25), capped so running - removed >= min
//! ```
//!
//! Placement and victim choice go through [`ScalePolicy`]; the default
//! rotates regions and removes the oldest-started instances first.
//!
//! # Instance Lifecycle
//!
//! ```text
//! Starting ──provisioning_delay──▶ Running ──▶ Stopping ──teardown_delay──▶ Stopped (evicted)
//! ```

pub mod collaborators;
pub mod decision;
pub mod error;
pub mod policy;
pub mod scaler;

pub use collaborators::{
    BoxFuture, MetricsSource, NoopProvisioner, NullMetrics, Provisioner, StaticMetrics,
};
pub use decision::{Cooldowns, FleetCounts, ScaleDecision};
pub use error::{ScaleError, ScaleResult};
pub use policy::{RoundRobinOldestFirst, ScalePolicy};
pub use scaler::{AutoScaler, PoolStatus, TickOutcome};
