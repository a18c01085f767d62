//! In-memory backend for development and tests.
//!
//! Behaves like a small cloud: created nodes start pending (or
//! running with `auto_run`), ids are never reused, and terminated
//! nodes drop out of `list_nodes`. Failures can be scripted per call
//! and every call is counted so tests can assert on what the control
//! loop asked for.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use fleet_core::{AuthConfig, LaunchConfig, NodeId, NodeTags};

use crate::error::{ProviderError, ProviderResult, RunnerError};
use crate::provider::NodeProvider;
use crate::runner::{CommandOutput, CommandRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Running,
    Terminated,
}

#[derive(Debug, Clone)]
struct FakeNode {
    phase: Phase,
    tags: NodeTags,
    internal_ip: String,
}

#[derive(Debug, Default)]
struct FakeState {
    nodes: BTreeMap<NodeId, FakeNode>,
    next_id: u64,
    create_failures: VecDeque<ProviderError>,
    terminate_failures: VecDeque<ProviderError>,
    terminated: Vec<NodeId>,
}

impl FakeState {
    fn add_node(&mut self, tags: NodeTags, phase: Phase) -> NodeId {
        self.next_id += 1;
        let n = self.next_id;
        let id = NodeId::new(format!("fake-{n}"));
        self.nodes.insert(
            id.clone(),
            FakeNode {
                phase,
                tags,
                internal_ip: format!("10.10.{}.{}", n / 256, n % 256),
            },
        );
        id
    }
}

pub struct FakeProvider {
    state: Mutex<FakeState>,
    auto_run: bool,
    create_latency: Duration,
    runner: FakeCommandRunner,
    create_calls: AtomicU32,
    terminate_calls: AtomicU32,
    creates_in_flight: AtomicU32,
    peak_creates_in_flight: AtomicU32,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvider {
    /// Nodes start pending until `set_running` is called.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            auto_run: false,
            create_latency: Duration::ZERO,
            runner: FakeCommandRunner::new(),
            create_calls: AtomicU32::new(0),
            terminate_calls: AtomicU32::new(0),
            creates_in_flight: AtomicU32::new(0),
            peak_creates_in_flight: AtomicU32::new(0),
        }
    }

    pub fn with_auto_run(mut self, auto_run: bool) -> Self {
        self.auto_run = auto_run;
        self
    }

    /// Make every `create_node` call take at least `latency`.
    pub fn with_create_latency(mut self, latency: Duration) -> Self {
        self.create_latency = latency;
        self
    }

    pub fn with_runner(mut self, runner: FakeCommandRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn runner(&self) -> &FakeCommandRunner {
        &self.runner
    }

    /// The next `n` `create_node` calls fail with `error`.
    pub async fn fail_next_creates(&self, n: usize, error: ProviderError) {
        let mut state = self.state.lock().await;
        state.create_failures.extend(std::iter::repeat_n(error, n));
    }

    /// The next `n` terminate calls fail with `error`.
    pub async fn fail_next_terminates(&self, n: usize, error: ProviderError) {
        let mut state = self.state.lock().await;
        state.terminate_failures.extend(std::iter::repeat_n(error, n));
    }

    /// Move a pending node to running.
    pub async fn set_running(&self, node_id: &NodeId) {
        let mut state = self.state.lock().await;
        if let Some(node) = state.nodes.get_mut(node_id)
            && node.phase == Phase::Pending
        {
            node.phase = Phase::Running;
        }
    }

    /// Move every pending node to running.
    pub async fn run_all_pending(&self) {
        let mut state = self.state.lock().await;
        for node in state.nodes.values_mut() {
            if node.phase == Phase::Pending {
                node.phase = Phase::Running;
            }
        }
    }

    /// Add a node behind the autoscaler's back, e.g. one left over
    /// from a previous daemon with different tags.
    pub async fn insert_node(&self, tags: NodeTags, running: bool) -> NodeId {
        let phase = if running { Phase::Running } else { Phase::Pending };
        self.state.lock().await.add_node(tags, phase)
    }

    /// Ids of nodes not yet terminated.
    pub async fn live_nodes(&self) -> Vec<NodeId> {
        let state = self.state.lock().await;
        state
            .nodes
            .iter()
            .filter(|(_, n)| n.phase != Phase::Terminated)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ids terminated so far, in order.
    pub async fn terminated(&self) -> Vec<NodeId> {
        self.state.lock().await.terminated.clone()
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> u32 {
        self.terminate_calls.load(Ordering::SeqCst)
    }

    /// Most `create_node` calls ever observed running at once.
    pub fn peak_concurrent_creates(&self) -> u32 {
        self.peak_creates_in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter even if the call is cancelled.
struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeProvider for FakeProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn list_nodes(&self, tag_filter: &NodeTags) -> ProviderResult<Vec<NodeId>> {
        let state = self.state.lock().await;
        Ok(state
            .nodes
            .iter()
            .filter(|(_, n)| n.phase != Phase::Terminated)
            .filter(|(_, n)| tag_filter.iter().all(|(k, v)| n.tags.get(k) == Some(v)))
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn is_running(&self, node_id: &NodeId) -> ProviderResult<bool> {
        let state = self.state.lock().await;
        Ok(state
            .nodes
            .get(node_id)
            .is_some_and(|n| n.phase == Phase::Running))
    }

    async fn is_terminated(&self, node_id: &NodeId) -> ProviderResult<bool> {
        let state = self.state.lock().await;
        Ok(state
            .nodes
            .get(node_id)
            .is_some_and(|n| n.phase == Phase::Terminated))
    }

    async fn node_tags(&self, node_id: &NodeId) -> ProviderResult<NodeTags> {
        let state = self.state.lock().await;
        state
            .nodes
            .get(node_id)
            .map(|n| n.tags.clone())
            .ok_or_else(|| ProviderError::NotFound(node_id.clone()))
    }

    async fn set_node_tags(&self, node_id: &NodeId, tags: &NodeTags) -> ProviderResult<()> {
        let mut state = self.state.lock().await;
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ProviderError::NotFound(node_id.clone()))?;
        node.tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn internal_ip(&self, node_id: &NodeId) -> ProviderResult<String> {
        let state = self.state.lock().await;
        state
            .nodes
            .get(node_id)
            .map(|n| n.internal_ip.clone())
            .ok_or_else(|| ProviderError::NotFound(node_id.clone()))
    }

    async fn create_node(
        &self,
        template: &LaunchConfig,
        tags: &NodeTags,
        count: u32,
    ) -> ProviderResult<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.creates_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.creates_in_flight);
        self.peak_creates_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.create_latency.is_zero() {
            tokio::time::sleep(self.create_latency).await;
        }

        let mut state = self.state.lock().await;
        if let Some(err) = state.create_failures.pop_front() {
            return Err(err);
        }
        let phase = if self.auto_run { Phase::Running } else { Phase::Pending };
        for _ in 0..count {
            let id = state.add_node(tags.clone(), phase);
            debug!(node_id = %id, node_type = %template.node_type, "fake node created");
        }
        Ok(())
    }

    async fn terminate_node(&self, node_id: &NodeId) -> ProviderResult<()> {
        self.terminate_nodes(std::slice::from_ref(node_id)).await
    }

    async fn terminate_nodes(&self, node_ids: &[NodeId]) -> ProviderResult<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if let Some(err) = state.terminate_failures.pop_front() {
            return Err(err);
        }
        for id in node_ids {
            if let Some(node) = state.nodes.get_mut(id)
                && node.phase != Phase::Terminated
            {
                node.phase = Phase::Terminated;
                state.terminated.push(id.clone());
            }
        }
        Ok(())
    }

    async fn command_runner(
        &self,
        node_id: &NodeId,
        _auth: &AuthConfig,
    ) -> ProviderResult<Arc<dyn CommandRunner>> {
        if !self.state.lock().await.nodes.contains_key(node_id) {
            return Err(ProviderError::NotFound(node_id.clone()));
        }
        Ok(Arc::new(self.runner.bind(node_id.clone())))
    }
}

// ── Recording command runner ────────────────────────────────────

/// One call made through a [`FakeCommandRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Command { node_id: NodeId, command: String },
    Sync { node_id: NodeId, source: PathBuf, target: String },
}

#[derive(Debug, Default)]
struct RunnerShared {
    log: Mutex<Vec<Invocation>>,
    /// Commands containing the pattern exit with the code.
    failing: Mutex<Vec<(String, i32)>>,
}

/// Records every command and copy instead of executing it. Clones
/// share one log.
#[derive(Debug, Clone, Default)]
pub struct FakeCommandRunner {
    shared: Arc<RunnerShared>,
    node_id: Option<NodeId>,
    latency: Duration,
}

impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command takes at least `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Commands containing `pattern` exit with `exit_code`.
    pub async fn fail_command(&self, pattern: &str, exit_code: i32) {
        self.shared
            .failing
            .lock()
            .await
            .push((pattern.to_string(), exit_code));
    }

    pub async fn invocations(&self) -> Vec<Invocation> {
        self.shared.log.lock().await.clone()
    }

    /// Commands run on `node_id`, in order.
    pub async fn commands_for(&self, node_id: &NodeId) -> Vec<String> {
        self.shared
            .log
            .lock()
            .await
            .iter()
            .filter_map(|inv| match inv {
                Invocation::Command { node_id: n, command } if n == node_id => {
                    Some(command.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn bind(&self, node_id: NodeId) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            node_id: Some(node_id),
            latency: self.latency,
        }
    }

    fn bound_id(&self) -> NodeId {
        self.node_id.clone().unwrap_or_else(|| NodeId::from("unbound"))
    }
}

#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(&self, command: &str) -> Result<CommandOutput, RunnerError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.shared.log.lock().await.push(Invocation::Command {
            node_id: self.bound_id(),
            command: command.to_string(),
        });

        let failing = self.shared.failing.lock().await;
        let exit_code = failing
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map_or(0, |(_, code)| *code);
        Ok(CommandOutput {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("fake failure for {command:?}")
            },
        })
    }

    async fn sync_files(&self, source: &Path, target: &str) -> Result<(), RunnerError> {
        self.shared.log.lock().await.push(Invocation::Sync {
            node_id: self.bound_id(),
            source: source.to_path_buf(),
            target: target.to_string(),
        });
        Ok(())
    }
}
