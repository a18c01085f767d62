//! The backend contract every node provider implements.

use std::sync::Arc;

use async_trait::async_trait;

use fleet_core::{AuthConfig, LaunchConfig, NodeId, NodeTags};

use crate::error::{ProviderError, ProviderResult};
use crate::runner::{CommandRunner, SshCommandRunner};

/// Capability interface over a concrete fleet backend.
///
/// The backend is the source of truth for which nodes exist and what
/// tags they carry. Callers treat everything they remember about a
/// node as a cache and re-read it every tick.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Nodes carrying every tag in `tag_filter`, excluding nodes in a
    /// terminal backend state.
    async fn list_nodes(&self, tag_filter: &NodeTags) -> ProviderResult<Vec<NodeId>>;

    /// Never true together with `is_terminated`. A node the backend
    /// has not made visible yet is neither.
    async fn is_running(&self, node_id: &NodeId) -> ProviderResult<bool>;

    async fn is_terminated(&self, node_id: &NodeId) -> ProviderResult<bool>;

    async fn node_tags(&self, node_id: &NodeId) -> ProviderResult<NodeTags>;

    /// Merge `tags` into the node's tags. Writes may become visible
    /// to `node_tags` with a delay.
    async fn set_node_tags(&self, node_id: &NodeId, tags: &NodeTags) -> ProviderResult<()>;

    async fn internal_ip(&self, node_id: &NodeId) -> ProviderResult<String>;

    async fn external_ip(&self, _node_id: &NodeId) -> ProviderResult<String> {
        Err(ProviderError::NotSupported("external_ip"))
    }

    /// Request `count` new nodes. `Ok` means all of them were created;
    /// a backend that can only satisfy part of the request fails
    /// without creating any. Not idempotent: a retried call may create
    /// nodes twice, so callers reconcile counts before retrying.
    async fn create_node(
        &self,
        template: &LaunchConfig,
        tags: &NodeTags,
        count: u32,
    ) -> ProviderResult<()>;

    /// Terminating an already terminated node is a no-op.
    async fn terminate_node(&self, node_id: &NodeId) -> ProviderResult<()>;

    async fn terminate_nodes(&self, node_ids: &[NodeId]) -> ProviderResult<()> {
        for node_id in node_ids {
            self.terminate_node(node_id).await?;
        }
        Ok(())
    }

    /// Exec/copy primitives for one node. Defaults to ssh against the
    /// external address, falling back to the internal one.
    async fn command_runner(
        &self,
        node_id: &NodeId,
        auth: &AuthConfig,
    ) -> ProviderResult<Arc<dyn CommandRunner>> {
        let address = match self.external_ip(node_id).await {
            Ok(ip) => ip,
            Err(ProviderError::NotSupported(_)) => self.internal_ip(node_id).await?,
            Err(e) => return Err(e),
        };
        Ok(Arc::new(SshCommandRunner::new(address, auth.clone())))
    }
}
