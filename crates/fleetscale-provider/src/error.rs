use fleet_core::NodeId;

/// Failure of a provider call.
///
/// Transient errors (timeouts, throttling) are retried with backoff;
/// everything else propagates to the caller on the first occurrence.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("permanent provider error: {0}")]
    Permanent(String),

    #[error("{0} is not supported by this provider")]
    NotSupported(&'static str),

    #[error("node not found: {0}")]
    NotFound(NodeId),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Transient(_) => "transient",
            ProviderError::Permanent(_) => "permanent",
            ProviderError::NotSupported(_) => "not_supported",
            ProviderError::NotFound(_) => "not_found",
        }
    }
}

/// Failure of a remote command or file copy.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {code:?}: {stderr}")]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

pub type ProviderResult<T> = Result<T, ProviderError>;
