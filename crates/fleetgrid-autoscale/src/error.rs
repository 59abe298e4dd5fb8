use fleet_core::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("invalid scaling config: {0}")]
    InvalidConfig(#[from] ConfigError),
}

pub type ScaleResult<T> = Result<T, ScaleError>;
