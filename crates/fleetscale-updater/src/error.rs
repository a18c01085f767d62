use std::time::Duration;

use fleetscale_provider::{ProviderError, RunnerError};

/// Why a node update attempt failed. Every variant taints the node:
/// it is replaced, never retried in place.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("update timed out after {0:?}")]
    Timeout(Duration),

    #[error("command {command:?} exited with {exit_code:?}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to sync {target}: {source}")]
    FileSync {
        target: String,
        #[source]
        source: RunnerError,
    },

    #[error("remote exec failed: {0}")]
    Runner(#[from] RunnerError),

    #[error("node terminated before it became ready")]
    NodeTerminated,

    #[error("updater task aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl UpdateError {
    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateError::Timeout(_) => "update_timeout",
            UpdateError::CommandFailed { .. } => "update_command_failed",
            UpdateError::FileSync { .. } => "file_sync_failed",
            UpdateError::Runner(_) => "runner_error",
            UpdateError::NodeTerminated => "node_terminated",
            UpdateError::Aborted(_) => "aborted",
            UpdateError::Provider(_) => "provider_error",
        }
    }
}

pub type UpdateResult = Result<(), UpdateError>;
