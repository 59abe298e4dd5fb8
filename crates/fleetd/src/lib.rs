//! fleetd — the FleetGrid daemon.
//!
//! Single process that assembles the control plane:
//! - State store (redb)
//! - Service registry + heartbeat/cleanup sweeps
//! - Load balancer (drops counters of removed instances)
//! - Autoscaler
//! - Control event log
//!
//! The binary lives in `main.rs`; this library exposes the wiring so it
//! can be driven from tests.

pub mod control_plane;
pub mod monitor;

pub use control_plane::ControlPlane;
