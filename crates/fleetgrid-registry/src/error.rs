//! Registry error types.

use thiserror::Error;

/// Errors surfaced to registry callers.
///
/// Only `register` and `unregister` return these; heartbeat and health
/// writes log failures and leave reconciliation to the sweeps.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid registration: {0}")]
    Validation(String),

    #[error("durable store error: {0}")]
    Store(#[from] fleetgrid_state::StateError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
