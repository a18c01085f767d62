//! Bring one node from "created" to "ready to accept work".
//!
//! ```text
//! waiting-for-node ──► syncing-files ──► setting-up ──► up-to-date
//!        │                   │                │
//!        └───────────────────┴────────────────┴──────► update-failed
//! ```
//!
//! The whole sequence runs under one timeout. Nothing is rolled back
//! on failure; the node is tagged `update-failed` and left for the
//! autoscaler to replace.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use fleet_core::tags::{
    STATUS_SETTING_UP, STATUS_SYNCING_FILES, STATUS_UP_TO_DATE, STATUS_UPDATE_FAILED,
    STATUS_WAITING_FOR_NODE, TAG_FILE_SYNC, TAG_NODE_STATUS,
};
use fleet_core::{AuthConfig, ConfigHash, NodeId, NodeTags};
use fleetscale_provider::{CommandRunner, NodeProvider, RetryPolicy, with_retries};

use crate::error::{UpdateError, UpdateResult};

/// Command used to decide the node's shell is reachable.
const READY_CHECK: &str = "uptime";

/// What to apply to one node.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub node_id: NodeId,
    pub node_type: String,
    /// Remote destination → local source.
    pub file_mounts: BTreeMap<String, PathBuf>,
    pub init_commands: Vec<String>,
    /// Files hash written to the node on success.
    pub target_hash: ConfigHash,
}

pub struct NodeUpdater {
    provider: Arc<dyn NodeProvider>,
    auth: AuthConfig,
    request: UpdateRequest,
    timeout: Duration,
    poll_interval: Duration,
    retry: RetryPolicy,
}

impl NodeUpdater {
    pub fn new(provider: Arc<dyn NodeProvider>, auth: AuthConfig, request: UpdateRequest) -> Self {
        Self {
            provider,
            auth,
            request,
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// How often to re-check `is_running` and the shell check.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.request.node_id
    }

    pub fn node_type(&self) -> &str {
        &self.request.node_type
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the full update. On failure the node is tagged
    /// `update-failed` on a best-effort basis.
    pub async fn run(self) -> UpdateResult {
        let node_id = self.request.node_id.clone();
        let started = Instant::now();
        info!(
            %node_id,
            node_type = %self.request.node_type,
            target = %self.request.target_hash.short(),
            "updating node"
        );

        let result = match tokio::time::timeout(self.timeout, self.apply()).await {
            Ok(result) => result,
            Err(_) => Err(UpdateError::Timeout(self.timeout)),
        };

        match &result {
            Ok(()) => {
                info!(
                    %node_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "node up to date"
                );
            }
            Err(e) => {
                warn!(
                    %node_id,
                    node_type = %self.request.node_type,
                    kind = e.kind(),
                    error = %e,
                    "node update failed"
                );
                if let Err(tag_err) = self.set_status(STATUS_UPDATE_FAILED).await {
                    warn!(%node_id, error = %tag_err, "failed to tag node as update-failed");
                }
            }
        }
        result
    }

    async fn apply(&self) -> UpdateResult {
        self.set_status(STATUS_WAITING_FOR_NODE).await?;
        self.wait_until_running().await?;
        let runner = self
            .provider
            .command_runner(&self.request.node_id, &self.auth)
            .await?;
        self.wait_for_shell(runner.as_ref()).await;

        self.set_status(STATUS_SYNCING_FILES).await?;
        for (target, source) in &self.request.file_mounts {
            debug!(node_id = %self.request.node_id, %target, "syncing mount");
            runner
                .sync_files(source, target)
                .await
                .map_err(|source| UpdateError::FileSync {
                    target: target.clone(),
                    source,
                })?;
        }

        self.set_status(STATUS_SETTING_UP).await?;
        for command in &self.request.init_commands {
            let output = runner.run(command).await?;
            if !output.success() {
                return Err(UpdateError::CommandFailed {
                    command: command.clone(),
                    exit_code: output.exit_code,
                    stderr: output.stderr,
                });
            }
        }

        let tags: NodeTags = [
            (TAG_FILE_SYNC.to_string(), self.request.target_hash.to_string()),
            (TAG_NODE_STATUS.to_string(), STATUS_UP_TO_DATE.to_string()),
        ]
        .into_iter()
        .collect();
        let node_id = &self.request.node_id;
        with_retries(&self.retry, "set_node_tags", || {
            self.provider.set_node_tags(node_id, &tags)
        })
        .await?;
        Ok(())
    }

    async fn wait_until_running(&self) -> UpdateResult {
        let node_id = &self.request.node_id;
        loop {
            if with_retries(&self.retry, "is_terminated", || self.provider.is_terminated(node_id))
                .await?
            {
                return Err(UpdateError::NodeTerminated);
            }
            if with_retries(&self.retry, "is_running", || self.provider.is_running(node_id)).await? {
                return Ok(());
            }
            debug!(%node_id, "waiting for node to start");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Poll until the readiness check succeeds. Bounded by the outer timeout.
    async fn wait_for_shell(&self, runner: &dyn CommandRunner) {
        loop {
            match runner.run(READY_CHECK).await {
                Ok(out) if out.success() => return,
                Ok(out) => debug!(node_id = %self.request.node_id, code = ?out.exit_code, "shell not ready"),
                Err(e) => debug!(node_id = %self.request.node_id, error = %e, "shell not reachable"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn set_status(&self, status: &str) -> UpdateResult {
        let tags: NodeTags = [(TAG_NODE_STATUS.to_string(), status.to_string())]
            .into_iter()
            .collect();
        let node_id = &self.request.node_id;
        with_retries(&self.retry, "set_node_tags", || {
            self.provider.set_node_tags(node_id, &tags)
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::tags::TAG_NODE_TYPE;
    use fleetscale_provider::{FakeCommandRunner, FakeProvider, Invocation};

    async fn provider_with_node(runner: FakeCommandRunner, running: bool) -> (Arc<FakeProvider>, NodeId) {
        let provider = Arc::new(FakeProvider::new().with_runner(runner));
        let tags: NodeTags = [(TAG_NODE_TYPE.to_string(), "worker".to_string())]
            .into_iter()
            .collect();
        let id = provider.insert_node(tags, running).await;
        (provider, id)
    }

    fn request(node_id: &NodeId, mounts: BTreeMap<String, PathBuf>, cmds: &[&str]) -> UpdateRequest {
        UpdateRequest {
            node_id: node_id.clone(),
            node_type: "worker".into(),
            file_mounts: mounts,
            init_commands: cmds.iter().map(|c| c.to_string()).collect(),
            target_hash: ConfigHash::from_hex("abc123"),
        }
    }

    fn updater(provider: Arc<FakeProvider>, req: UpdateRequest) -> NodeUpdater {
        NodeUpdater::new(provider, AuthConfig::default(), req)
            .with_poll_interval(Duration::from_millis(5))
            .with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn applies_mounts_then_commands_then_tags() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeCommandRunner::new();
        let (provider, id) = provider_with_node(runner.clone(), true).await;
        let mounts: BTreeMap<String, PathBuf> =
            [("/srv/app".to_string(), dir.path().to_path_buf())].into_iter().collect();

        updater(provider.clone(), request(&id, mounts, &["make", "make install"]))
            .run()
            .await
            .unwrap();

        let calls = runner.invocations().await;
        assert!(matches!(&calls[0], Invocation::Command { command, .. } if command == READY_CHECK));
        assert!(matches!(&calls[1], Invocation::Sync { target, .. } if target == "/srv/app"));
        assert_eq!(
            runner.commands_for(&id).await,
            vec![READY_CHECK, "make", "make install"]
        );

        let tags = provider.node_tags(&id).await.unwrap();
        assert_eq!(tags[TAG_FILE_SYNC], "abc123");
        assert_eq!(tags[TAG_NODE_STATUS], STATUS_UP_TO_DATE);
    }

    #[tokio::test]
    async fn aborts_on_first_failing_command() {
        let runner = FakeCommandRunner::new();
        runner.fail_command("step-two", 2).await;
        let (provider, id) = provider_with_node(runner.clone(), true).await;

        let err = updater(
            provider.clone(),
            request(&id, BTreeMap::new(), &["step-one", "step-two", "step-three"]),
        )
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, UpdateError::CommandFailed { exit_code: Some(2), .. }));
        let cmds = runner.commands_for(&id).await;
        assert!(!cmds.contains(&"step-three".to_string()));

        let tags = provider.node_tags(&id).await.unwrap();
        assert_eq!(tags[TAG_NODE_STATUS], STATUS_UPDATE_FAILED);
        assert!(!tags.contains_key(TAG_FILE_SYNC));
    }

    #[tokio::test]
    async fn waits_for_pending_node() {
        let (provider, id) = provider_with_node(FakeCommandRunner::new(), false).await;
        let task = tokio::spawn(updater(provider.clone(), request(&id, BTreeMap::new(), &["true"])).run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!task.is_finished());
        provider.set_running(&id).await;

        task.await.unwrap().unwrap();
        let tags = provider.node_tags(&id).await.unwrap();
        assert_eq!(tags[TAG_FILE_SYNC], "abc123");
    }

    #[tokio::test]
    async fn times_out_as_a_failure() {
        let runner = FakeCommandRunner::new().with_latency(Duration::from_millis(200));
        let (provider, id) = provider_with_node(runner, true).await;

        let err = NodeUpdater::new(
            provider.clone(),
            AuthConfig::default(),
            request(&id, BTreeMap::new(), &["slow"]),
        )
        .with_poll_interval(Duration::from_millis(5))
        .with_timeout(Duration::from_millis(50))
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, UpdateError::Timeout(_)));
        let tags = provider.node_tags(&id).await.unwrap();
        assert_eq!(tags[TAG_NODE_STATUS], STATUS_UPDATE_FAILED);
    }

    #[tokio::test]
    async fn terminated_node_fails_fast() {
        let (provider, id) = provider_with_node(FakeCommandRunner::new(), false).await;
        provider.terminate_node(&id).await.unwrap();

        let err = updater(provider, request(&id, BTreeMap::new(), &[]))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::NodeTerminated));
    }
}
