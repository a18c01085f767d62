//! fleetscale-provider: the node provider contract and its backends.
//!
//! # Architecture
//!
//! ```text
//! Autoscaler ──► Arc<dyn NodeProvider> ──┬── StaticProvider (on-prem host pool)
//!                        │               └── FakeProvider   (in-memory)
//!                        ▼
//!               command_runner(node) ──► CommandRunner ── ssh / rsync
//! ```
//!
//! Cloud VM, Kubernetes and container backends plug in by implementing
//! `NodeProvider`; the control loop only ever sees the trait object.
//! Transient failures are retried by callers through `with_retries`.

pub mod error;
pub mod fake;
pub mod provider;
pub mod retry;
pub mod runner;
pub mod static_provider;

use std::sync::Arc;

use tracing::info;

use fleet_core::{ClusterConfig, ProviderConfig};

pub use error::{ProviderError, ProviderResult, RunnerError};
pub use fake::{FakeCommandRunner, FakeProvider, Invocation};
pub use provider::NodeProvider;
pub use retry::{RetryPolicy, with_retries};
pub use runner::{CommandOutput, CommandRunner, SshCommandRunner};
pub use static_provider::StaticProvider;

/// Instantiate the backend selected by `[provider]`.
pub fn build_provider(config: &ClusterConfig) -> ProviderResult<Arc<dyn NodeProvider>> {
    let provider: Arc<dyn NodeProvider> = match &config.provider {
        ProviderConfig::Static {
            state_path,
            hosts,
            external_ips,
        } => Arc::new(StaticProvider::open(
            hosts,
            external_ips.clone(),
            state_path.clone(),
        )?),
        ProviderConfig::Fake { auto_run } => Arc::new(FakeProvider::new().with_auto_run(*auto_run)),
    };
    info!(provider = provider.name(), cluster = %config.cluster_name, "node provider ready");
    Ok(provider)
}
