use thiserror::Error;

use fleet_core::{ConfigError, HashError};
use fleetscale_provider::ProviderError;

#[derive(Debug, Error)]
pub enum AutoscalerError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Internal invariant violation; fatal to the tick, not the process.
    #[error("cluster state mismatch: {0}")]
    ConfigMismatch(String),

    #[error("hashing error: {0}")]
    Hash(#[from] HashError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("tick exceeded its {0}s deadline")]
    Deadline(u64),
}

impl AutoscalerError {
    pub fn kind(&self) -> &'static str {
        match self {
            AutoscalerError::Provider(e) => e.kind(),
            AutoscalerError::ConfigMismatch(_) => "config_mismatch",
            AutoscalerError::Hash(_) => "hash",
            AutoscalerError::Config(_) => "config",
            AutoscalerError::Deadline(_) => "deadline",
        }
    }
}

pub type AutoscalerResult<T> = Result<T, AutoscalerError>;
