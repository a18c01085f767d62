//! Autoscaler: the per-cluster control loop.
//!
//! Every tick re-derives the cluster from the provider, decides what
//! to terminate and launch, and dispatches updaters for nodes whose
//! files hash is behind. Nothing remembered between ticks is trusted
//! over what the provider reports.
//!
//! ```text
//! control cmds → merge updater results → reconcile (list_nodes, tags)
//!   → forced terminations (unknown type, update-failed, drift, stale)
//!   → targets (demand + utilization) → excess terminations
//!   → launch deficit (unless breaker tripped) → dispatch updaters
//!   → publish status
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fleet_core::bootstrap;
use fleet_core::tags::{
    STATUS_UNINITIALIZED, STATUS_UPDATE_FAILED, TAG_CLUSTER_NAME, TAG_FILE_SYNC,
    TAG_LAUNCH_CONFIG, TAG_NODE_NAME, TAG_NODE_STATUS, TAG_NODE_TYPE,
};
use fleet_core::{
    AutoscalerStatus, BreakerState, ClusterConfig, LaunchConfig, NodeId, NodeState, NodeTags,
    NodeTypeHashes, NodeView, ResourceDemand, TickSummary, epoch_secs, hashes_for,
};
use fleetscale_metrics::{LoadMetrics, SharedLoadMetrics};
use fleetscale_provider::{NodeProvider, ProviderError, RetryPolicy, with_retries};
use fleetscale_updater::{NodeUpdater, UpdateOutcome, UpdateRequest, UpdaterPool};

use crate::breaker::FailureBreaker;
use crate::control::{ControlCommand, ControlReceiver};
use crate::demand::{NodeCapacity, compute_targets};
use crate::error::{AutoscalerError, AutoscalerResult};

/// One node as the provider reported it this tick.
#[derive(Debug, Clone)]
struct NodeRecord {
    id: NodeId,
    tags: NodeTags,
    running: bool,
}

impl NodeRecord {
    fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    fn node_type(&self) -> Option<&str> {
        self.tag(TAG_NODE_TYPE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TerminateReason {
    UnknownType,
    UpdateFailed,
    LaunchDrift,
    HeartbeatStale,
    Excess,
}

impl TerminateReason {
    fn as_str(self) -> &'static str {
        match self {
            TerminateReason::UnknownType => "unknown_node_type",
            TerminateReason::UpdateFailed => "update_failed",
            TerminateReason::LaunchDrift => "launch_config_drift",
            TerminateReason::HeartbeatStale => "heartbeat_stale",
            TerminateReason::Excess => "excess",
        }
    }
}

/// Where non-head nodes should point.
#[derive(Debug, Clone)]
enum HeadAddress {
    Known(String),
    /// A head node exists but is not reachable yet.
    Pending,
    /// No head node at all.
    Absent,
}

/// Result of one node type's launch task.
struct LaunchReport {
    node_type: String,
    launched: u32,
    error: Option<ProviderError>,
}

pub struct Autoscaler {
    config: Arc<ClusterConfig>,
    provider: Arc<dyn NodeProvider>,
    load_metrics: SharedLoadMetrics,
    demand: watch::Receiver<ResourceDemand>,
    hashes: BTreeMap<String, NodeTypeHashes>,
    updaters: UpdaterPool,
    /// Outcomes drained outside a tick, merged by the next one.
    finished: Vec<UpdateOutcome>,
    updater_poll_interval: Option<Duration>,
    breaker: FailureBreaker,
    retry: RetryPolicy,
    /// Nodes whose update failed; terminated on the next pass.
    tainted: HashSet<NodeId>,
    node_states: HashMap<NodeId, NodeState>,
    control_rx: Option<ControlReceiver>,
    status_tx: watch::Sender<AutoscalerStatus>,
    tick_count: u64,
    launched_total: u64,
    terminated_total: u64,
    update_failures_total: u64,
}

impl Autoscaler {
    pub fn new(
        config: ClusterConfig,
        provider: Arc<dyn NodeProvider>,
        load_metrics: SharedLoadMetrics,
        demand: watch::Receiver<ResourceDemand>,
    ) -> AutoscalerResult<Self> {
        let hashes = hashes_for(&config)?;
        for (node_type, h) in &hashes {
            debug!(
                %node_type,
                launch = %h.launch.short(),
                files = %h.files.short(),
                "node type hashes"
            );
        }

        let tunables = &config.autoscaler;
        let breaker = FailureBreaker::new(tunables.max_num_failures, tunables.failure_window_ticks);
        let retry = RetryPolicy::new(tunables.provider_max_retries);
        let (status_tx, _) = watch::channel(AutoscalerStatus {
            cluster_name: config.cluster_name.clone(),
            breaker: breaker.state(),
            ..Default::default()
        });

        Ok(Self {
            config: Arc::new(config),
            provider,
            load_metrics,
            demand,
            hashes,
            updaters: UpdaterPool::new(),
            finished: Vec::new(),
            updater_poll_interval: None,
            breaker,
            retry,
            tainted: HashSet::new(),
            node_states: HashMap::new(),
            control_rx: None,
            status_tx,
            tick_count: 0,
            launched_total: 0,
            terminated_total: 0,
            update_failures_total: 0,
        })
    }

    /// Accept operator commands on `rx`.
    pub fn with_control(mut self, rx: ControlReceiver) -> Self {
        self.control_rx = Some(rx);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// How long an updater may overrun its timeout before it is
    /// abandoned and its node treated as failed.
    pub fn with_updater_abandon_grace(mut self, grace: Duration) -> Self {
        let pool = std::mem::take(&mut self.updaters);
        self.updaters = pool.with_abandon_grace(grace);
        self
    }

    /// Override how often updaters poll a booting node.
    pub fn with_updater_poll_interval(mut self, interval: Duration) -> Self {
        self.updater_poll_interval = Some(interval);
        self
    }

    /// Subscribe to the status published after every tick.
    pub fn status(&self) -> watch::Receiver<AutoscalerStatus> {
        self.status_tx.subscribe()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn hashes(&self) -> &BTreeMap<String, NodeTypeHashes> {
        &self.hashes
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn reset_breaker(&mut self) {
        self.breaker.reset();
        let state = self.breaker.state();
        self.status_tx.send_modify(|s| s.breaker = state);
    }

    /// Swap in a new config and recompute every hash. The cluster name
    /// cannot change: nodes are found by it.
    pub async fn reconfigure(&mut self, config: ClusterConfig) -> AutoscalerResult<()> {
        if config.cluster_name != self.config.cluster_name {
            return Err(AutoscalerError::ConfigMismatch(format!(
                "cluster name cannot change from {:?} to {:?}",
                self.config.cluster_name, config.cluster_name
            )));
        }
        let hashes = hashes_for(&config)?;
        for (node_type, new) in &hashes {
            match self.hashes.get(node_type) {
                Some(old) if old.launch != new.launch => {
                    info!(%node_type, "launch config changed, nodes will be replaced");
                }
                Some(old) if old.files != new.files => {
                    info!(%node_type, "files changed, nodes will be updated");
                }
                Some(_) => {}
                None => info!(%node_type, "new node type"),
            }
        }

        let tunables = &config.autoscaler;
        self.breaker
            .set_limits(tunables.max_num_failures, tunables.failure_window_ticks);
        self.retry.max_retries = tunables.provider_max_retries;
        self.load_metrics
            .write()
            .await
            .set_heartbeat_timeout_s(tunables.heartbeat_timeout_s);

        self.hashes = hashes;
        self.config = Arc::new(config);
        info!(cluster = %self.config.cluster_name, "cluster config reloaded");
        Ok(())
    }

    /// Wait for every in-flight updater. Results are merged by the
    /// next tick.
    pub async fn wait_for_updaters(&mut self) -> usize {
        let outcomes = self.updaters.wait_all().await;
        let n = outcomes.len();
        self.finished.extend(outcomes);
        n
    }

    /// Run one tick with `now` as the heartbeat clock (epoch seconds).
    pub async fn tick_at(&mut self, now: u64) -> AutoscalerResult<TickSummary> {
        self.tick_count += 1;
        let tick = self.tick_count;
        self.breaker.advance(tick);
        let mut summary = TickSummary {
            tick,
            started_at: now,
            ..Default::default()
        };

        self.apply_control_commands().await;

        let mut outcomes = std::mem::take(&mut self.finished);
        outcomes.extend(self.updaters.collect_finished().await);
        self.merge_updates(outcomes, now, &mut summary).await;

        // 1. Reconcile.
        let nodes = self.reconcile().await?;
        self.observe_states(&nodes);
        let snapshot = self.load_snapshot(&nodes, now).await;

        // 2. Forced terminations.
        let mut doomed: Vec<(NodeId, TerminateReason)> = Vec::new();
        let mut healthy: Vec<&NodeRecord> = Vec::new();
        for node in &nodes {
            match self.forced_reason(node, &snapshot, now) {
                Some(reason) => doomed.push((node.id.clone(), reason)),
                None => healthy.push(node),
            }
        }

        // 3. Targets and excess.
        let capacities: Vec<NodeCapacity> = healthy
            .iter()
            .map(|node| self.capacity_of(node, &snapshot, now))
            .collect();
        let demand = self.demand.borrow().clone();
        let targets = compute_targets(
            &self.config.node_types,
            &capacities,
            &demand,
            self.config.autoscaler.target_utilization_fraction,
        );
        let excess = self.plan_excess(&healthy, &capacities, &targets);
        doomed.extend(excess.iter().map(|id| (id.clone(), TerminateReason::Excess)));

        let removed = self.terminate(&nodes, &doomed, tick, &mut summary).await;
        let (departed, survivors): (Vec<NodeRecord>, Vec<NodeRecord>) =
            nodes.iter().cloned().partition(|n| removed.contains(&n.id));

        // 4. Launch deficit.
        let remaining: Vec<&NodeRecord> = healthy
            .iter()
            .copied()
            .filter(|n| !excess.contains(&n.id))
            .collect();
        let deficits = self.plan_launches(&remaining, &targets);
        if !deficits.is_empty() {
            if self.breaker.is_tripped() {
                summary.launches_blocked = true;
                warn!(
                    deficit = deficits.iter().map(|(_, n)| n).sum::<u32>(),
                    "failure breaker tripped, skipping launches"
                );
            } else {
                self.launch(deficits, tick, &mut summary).await;
            }
        }

        // 5. Bootstrap. Nodes whose termination failed are left alone.
        let doomed_ids: HashSet<&NodeId> = doomed.iter().map(|(id, _)| id).collect();
        let updatable: Vec<NodeRecord> = survivors
            .iter()
            .filter(|n| !doomed_ids.contains(&n.id))
            .cloned()
            .collect();
        self.dispatch_updaters(&updatable, &mut summary).await;

        summary.nodes = survivors.len();
        summary.targets = targets;
        self.publish(&survivors, &departed, &snapshot, now, &summary);

        info!(
            tick,
            nodes = summary.nodes,
            launched = summary.launched,
            terminated = summary.terminated,
            updaters = summary.updaters_dispatched,
            updates_failed = summary.updates_failed,
            provider_failures = summary.provider_failures,
            breaker_tripped = self.breaker.is_tripped(),
            "autoscaler tick"
        );
        Ok(summary)
    }

    /// Tick every `update_interval_s` until `shutdown` fires. Ticks
    /// never overlap; a tick that runs long makes the next one skip.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut period = self.config.autoscaler.update_interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            cluster = %self.config.cluster_name,
            provider = self.provider.name(),
            interval_secs = period.as_secs(),
            "autoscaler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let deadline = self.config.autoscaler.tick_deadline();
                    let result = match tokio::time::timeout(deadline, self.tick_at(epoch_secs())).await {
                        Ok(result) => result.map(|_| ()),
                        Err(_) => Err(AutoscalerError::Deadline(deadline.as_secs())),
                    };
                    if let Err(e) = result {
                        error!(kind = e.kind(), error = %e, "autoscaler tick failed");
                        let message = e.to_string();
                        self.status_tx.send_modify(|s| s.last_error = Some(message));
                    }

                    let configured = self.config.autoscaler.update_interval();
                    if configured != period {
                        period = configured;
                        interval = tokio::time::interval(period);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        info!(interval_secs = period.as_secs(), "tick interval changed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
        self.updaters.abort_all();
    }

    // ── Tick phases ─────────────────────────────────────────────

    async fn apply_control_commands(&mut self) {
        let mut commands = Vec::new();
        if let Some(rx) = self.control_rx.as_mut() {
            while let Ok(command) = rx.try_recv() {
                commands.push(command);
            }
        }
        for command in commands {
            match command {
                ControlCommand::ResetBreaker => self.reset_breaker(),
                ControlCommand::Reconfigure(config) => {
                    if let Err(e) = self.reconfigure(*config).await {
                        warn!(kind = e.kind(), error = %e, "reconfiguration rejected");
                    }
                }
            }
        }
    }

    async fn merge_updates(&mut self, outcomes: Vec<UpdateOutcome>, now: u64, summary: &mut TickSummary) {
        if outcomes.is_empty() {
            return;
        }
        let mut load = self.load_metrics.write().await;
        for outcome in outcomes {
            match outcome.result {
                Ok(()) => {
                    summary.updates_succeeded += 1;
                    load.mark_active(&outcome.node_id, now);
                    self.node_states.insert(outcome.node_id, NodeState::Ready);
                }
                Err(e) => {
                    error!(
                        node_id = %outcome.node_id,
                        node_type = %outcome.node_type,
                        kind = e.kind(),
                        error = %e,
                        elapsed_s = outcome.elapsed.as_secs(),
                        "node update failed, node will be replaced"
                    );
                    summary.updates_failed += 1;
                    self.update_failures_total += 1;
                    self.tainted.insert(outcome.node_id);
                }
            }
        }
    }

    /// Authoritative node set for this cluster. A node that vanishes
    /// between listing and reading its tags is skipped.
    async fn reconcile(&self) -> AutoscalerResult<Vec<NodeRecord>> {
        let filter: NodeTags = [(TAG_CLUSTER_NAME.to_string(), self.config.cluster_name.clone())]
            .into_iter()
            .collect();
        let provider = &self.provider;
        let filter = &filter;
        let ids = with_retries(&self.retry, "list_nodes", move || provider.list_nodes(filter)).await?;

        let mut seen = HashSet::with_capacity(ids.len());
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if !seen.insert(id.clone()) {
                error!(node_id = %id, "provider listed the same node twice");
                return Err(AutoscalerError::ConfigMismatch(format!(
                    "node {id} listed more than once"
                )));
            }
            let node = &id;
            let tags = match with_retries(&self.retry, "node_tags", move || provider.node_tags(node)).await {
                Ok(tags) => tags,
                Err(e) => {
                    warn!(node_id = %id, kind = e.kind(), error = %e, "skipping node, tags unreadable");
                    continue;
                }
            };
            let running = match with_retries(&self.retry, "is_running", move || provider.is_running(node)).await {
                Ok(running) => running,
                Err(e) => {
                    warn!(node_id = %id, kind = e.kind(), error = %e, "skipping node, state unreadable");
                    continue;
                }
            };
            nodes.push(NodeRecord { id, tags, running });
        }
        Ok(nodes)
    }

    fn observe_states(&mut self, nodes: &[NodeRecord]) {
        let live: HashSet<&NodeId> = nodes.iter().map(|n| &n.id).collect();
        self.node_states.retain(|id, _| live.contains(id));
        self.tainted.retain(|id| live.contains(id));

        for node in nodes {
            let next = if self.updaters.is_updating(&node.id) {
                NodeState::Updating
            } else if !node.running {
                NodeState::Pending
            } else if self.is_up_to_date(node) {
                NodeState::Ready
            } else {
                NodeState::RunningUnconfigured
            };
            let state = self.node_states.entry(node.id.clone()).or_insert(next);
            if *state != next {
                if !state.can_transition_to(next) {
                    debug!(node_id = %node.id, from = %state, to = %next, "node state re-derived from provider");
                }
                *state = next;
            }
        }
    }

    /// Prune departed nodes, seed a heartbeat clock for ready nodes
    /// that never reported, and take this tick's snapshot.
    async fn load_snapshot(&self, nodes: &[NodeRecord], now: u64) -> LoadMetrics {
        let live: HashSet<NodeId> = nodes.iter().map(|n| n.id.clone()).collect();
        let mut load = self.load_metrics.write().await;
        load.prune(&live);
        for node in nodes {
            if self.node_states.get(&node.id) == Some(&NodeState::Ready) && load.get(&node.id).is_none() {
                load.mark_active(&node.id, now);
            }
        }
        load.clone()
    }

    fn forced_reason(&self, node: &NodeRecord, snapshot: &LoadMetrics, now: u64) -> Option<TerminateReason> {
        if self.updaters.is_updating(&node.id) {
            return None;
        }
        let Some(hashes) = node.node_type().and_then(|t| self.hashes.get(t)) else {
            return Some(TerminateReason::UnknownType);
        };
        if self.tainted.contains(&node.id) || node.tag(TAG_NODE_STATUS) == Some(STATUS_UPDATE_FAILED) {
            return Some(TerminateReason::UpdateFailed);
        }
        if node.tag(TAG_LAUNCH_CONFIG) != Some(hashes.launch.as_str()) {
            return Some(TerminateReason::LaunchDrift);
        }
        if snapshot.is_stale(&node.id, now) {
            return Some(TerminateReason::HeartbeatStale);
        }
        None
    }

    fn capacity_of(&self, node: &NodeRecord, snapshot: &LoadMetrics, now: u64) -> NodeCapacity {
        let node_type = node.node_type().unwrap_or_default().to_string();
        let configured = self
            .config
            .node_type(&node_type)
            .map(|nt| nt.resources.clone())
            .unwrap_or_default();
        // Seeded records carry no resources; fall back to the type's.
        let load = snapshot.get(&node.id).filter(|l| !l.total().is_empty());
        NodeCapacity {
            available: load.map_or(configured, |l| l.available.clone()),
            utilization: load.map(|l| l.utilization()),
            idle: snapshot
                .idle_for(&node.id, now)
                .is_some_and(|idle| idle > self.config.autoscaler.idle_timeout_s),
            node_type,
        }
    }

    /// Nodes above each type's target: idle first, then least
    /// utilized. Nodes that have not reported count as fully busy.
    fn plan_excess(
        &self,
        healthy: &[&NodeRecord],
        capacities: &[NodeCapacity],
        targets: &BTreeMap<String, u32>,
    ) -> Vec<NodeId> {
        let mut excess = Vec::new();
        for (node_type, &target) in targets {
            let mut candidates: Vec<(bool, f64, &NodeId)> = healthy
                .iter()
                .zip(capacities)
                .filter(|(node, _)| node.node_type() == Some(node_type.as_str()))
                .map(|(node, cap)| (cap.idle, cap.utilization.unwrap_or(1.0), &node.id))
                .collect();
            let count = candidates.len() as u32;
            if count <= target {
                continue;
            }
            candidates.retain(|(_, _, id)| !self.updaters.is_updating(id));
            candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.total_cmp(&b.1)));
            excess.extend(
                candidates
                    .into_iter()
                    .take((count - target) as usize)
                    .map(|(_, _, id)| id.clone()),
            );
        }
        excess
    }

    /// Issue every termination for this tick in one call. Returns the
    /// ids the provider accepted.
    async fn terminate(
        &mut self,
        nodes: &[NodeRecord],
        doomed: &[(NodeId, TerminateReason)],
        tick: u64,
        summary: &mut TickSummary,
    ) -> HashSet<NodeId> {
        if doomed.is_empty() {
            return HashSet::new();
        }
        let types: HashMap<&NodeId, &str> = nodes
            .iter()
            .map(|n| (&n.id, n.node_type().unwrap_or("unknown")))
            .collect();
        for (id, reason) in doomed {
            info!(
                node_id = %id,
                node_type = types.get(id).copied().unwrap_or("unknown"),
                reason = reason.as_str(),
                "terminating node"
            );
            self.node_states.insert(id.clone(), NodeState::Terminating);
        }

        let ids: Vec<NodeId> = doomed.iter().map(|(id, _)| id.clone()).collect();
        let provider = &self.provider;
        let batch = &ids;
        match with_retries(&self.retry, "terminate_nodes", move || provider.terminate_nodes(batch)).await {
            Ok(()) => {
                let mut load = self.load_metrics.write().await;
                for id in &ids {
                    load.remove(id);
                    self.tainted.remove(id);
                    self.node_states.insert(id.clone(), NodeState::Removed);
                }
                summary.terminated += ids.len() as u32;
                self.terminated_total += ids.len() as u64;
                ids.into_iter().collect()
            }
            Err(e) => {
                warn!(count = ids.len(), kind = e.kind(), error = %e, "terminate failed");
                summary.provider_failures += 1;
                self.breaker.record_failure(tick);
                HashSet::new()
            }
        }
    }

    /// Per-type deficits in head-first order, capped so pending nodes
    /// plus new requests stay within `max_concurrent_launches`.
    fn plan_launches(&self, nodes: &[&NodeRecord], targets: &BTreeMap<String, u32>) -> Vec<(String, u32)> {
        let pending = nodes.iter().filter(|n| !n.running).count() as u32;
        let mut budget = self
            .config
            .autoscaler
            .max_concurrent_launches
            .saturating_sub(pending);

        let mut deficits = Vec::new();
        for node_type in self.config.node_type_order() {
            let target = targets.get(&node_type).copied().unwrap_or(0);
            let have = nodes
                .iter()
                .filter(|n| n.node_type() == Some(node_type.as_str()))
                .count() as u32;
            let deficit = target.saturating_sub(have);
            if deficit == 0 {
                continue;
            }
            let n = deficit.min(budget);
            if n < deficit {
                debug!(%node_type, deficit, pending, "launch deferred by max_concurrent_launches");
            }
            if n > 0 {
                budget -= n;
                deficits.push((node_type, n));
            }
        }
        deficits
    }

    /// One task per node type; each issues its batches in order and
    /// stops at the first failure. `create_node` is not retried here:
    /// the next tick recounts before asking again.
    async fn launch(&mut self, deficits: Vec<(String, u32)>, tick: u64, summary: &mut TickSummary) {
        let batch = self.config.autoscaler.max_launch_batch.max(1);
        let mut tasks = JoinSet::new();

        for (node_type, count) in deficits {
            let (Some(template), Some(hashes)) = (
                LaunchConfig::for_node_type(&self.config, &node_type),
                self.hashes.get(&node_type),
            ) else {
                continue;
            };
            let tags = self.launch_tags(&node_type, hashes);
            let provider = Arc::clone(&self.provider);
            info!(%node_type, count, batch, "launching nodes");

            tasks.spawn(async move {
                let mut launched = 0;
                while launched < count {
                    let n = (count - launched).min(batch);
                    if let Err(e) = provider.create_node(&template, &tags, n).await {
                        return LaunchReport {
                            node_type,
                            launched,
                            error: Some(e),
                        };
                    }
                    launched += n;
                }
                LaunchReport {
                    node_type,
                    launched,
                    error: None,
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let report = match joined {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "launch task failed to complete");
                    summary.provider_failures += 1;
                    self.breaker.record_failure(tick);
                    continue;
                }
            };
            if report.launched > 0 {
                summary.launched += report.launched;
                self.launched_total += u64::from(report.launched);
                self.breaker.record_success();
            }
            if let Some(e) = report.error {
                warn!(
                    node_type = %report.node_type,
                    launched = report.launched,
                    kind = e.kind(),
                    error = %e,
                    "launch failed"
                );
                summary.provider_failures += 1;
                self.breaker.record_failure(tick);
            }
        }
    }

    fn launch_tags(&self, node_type: &str, hashes: &NodeTypeHashes) -> NodeTags {
        let cluster = &self.config.cluster_name;
        [
            (TAG_CLUSTER_NAME, cluster.clone()),
            (TAG_NODE_TYPE, node_type.to_string()),
            (TAG_NODE_NAME, format!("{cluster}-{node_type}")),
            (TAG_NODE_STATUS, STATUS_UNINITIALIZED.to_string()),
            (TAG_LAUNCH_CONFIG, hashes.launch.as_str().to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// Dispatch an updater for every running, correctly launched node
    /// whose files hash is behind.
    async fn dispatch_updaters(&mut self, nodes: &[NodeRecord], summary: &mut TickSummary) {
        let mut head: Option<HeadAddress> = None;

        for node in nodes {
            if !node.running || self.updaters.is_updating(&node.id) || self.tainted.contains(&node.id) {
                continue;
            }
            let Some(node_type) = node.node_type() else {
                continue;
            };
            let Some(hashes) = self.hashes.get(node_type) else {
                continue;
            };
            if node.tag(TAG_LAUNCH_CONFIG) != Some(hashes.launch.as_str())
                || node.tag(TAG_NODE_STATUS) == Some(STATUS_UPDATE_FAILED)
                || node.tag(TAG_FILE_SYNC) == Some(hashes.files.as_str())
            {
                continue;
            }
            let target_hash = hashes.files.clone();

            let mut init_commands = bootstrap::recipe(&self.config, node_type);
            if !self.config.is_head(node_type) {
                if head.is_none() {
                    head = Some(self.head_address(nodes).await);
                }
                match &head {
                    Some(HeadAddress::Known(ip)) => {
                        init_commands = bootstrap::with_head_ip(&init_commands, ip);
                    }
                    Some(HeadAddress::Pending) => {
                        debug!(node_id = %node.id, "head not reachable yet, deferring update");
                        continue;
                    }
                    Some(HeadAddress::Absent) | None => {}
                }
            }

            let request = UpdateRequest {
                node_id: node.id.clone(),
                node_type: node_type.to_string(),
                file_mounts: self.config.file_mounts_for(node_type),
                init_commands,
                target_hash,
            };
            let mut updater = NodeUpdater::new(
                Arc::clone(&self.provider),
                self.config.auth.clone(),
                request,
            )
            .with_timeout(self.config.autoscaler.update_timeout())
            .with_retry(self.retry.clone());
            if let Some(interval) = self.updater_poll_interval {
                updater = updater.with_poll_interval(interval);
            }

            if self.updaters.dispatch(updater) {
                debug!(node_id = %node.id, %node_type, "updater dispatched");
                summary.updaters_dispatched += 1;
                self.node_states.insert(node.id.clone(), NodeState::Updating);
            }
        }
    }

    async fn head_address(&self, nodes: &[NodeRecord]) -> HeadAddress {
        let heads: Vec<&NodeRecord> = nodes
            .iter()
            .filter(|n| n.node_type() == Some(self.config.head_node_type.as_str()))
            .collect();
        let Some(head) = heads.iter().find(|n| n.running) else {
            return if heads.is_empty() {
                HeadAddress::Absent
            } else {
                HeadAddress::Pending
            };
        };

        let provider = &self.provider;
        let id = &head.id;
        match with_retries(&self.retry, "internal_ip", move || provider.internal_ip(id)).await {
            Ok(ip) => HeadAddress::Known(ip),
            Err(e) => {
                warn!(node_id = %head.id, kind = e.kind(), error = %e, "head address unavailable");
                HeadAddress::Pending
            }
        }
    }

    fn is_up_to_date(&self, node: &NodeRecord) -> bool {
        node.node_type()
            .and_then(|t| self.hashes.get(t))
            .is_some_and(|h| {
                node.tag(TAG_LAUNCH_CONFIG) == Some(h.launch.as_str())
                    && node.tag(TAG_FILE_SYNC) == Some(h.files.as_str())
            })
    }

    /// `departed` nodes were terminated this tick. They are listed as
    /// `removed` once and left out of the per-type counts.
    fn publish(
        &mut self,
        nodes: &[NodeRecord],
        departed: &[NodeRecord],
        snapshot: &LoadMetrics,
        now: u64,
        summary: &TickSummary,
    ) {
        let mut nodes_by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut views = Vec::with_capacity(nodes.len() + departed.len());
        for node in nodes {
            let node_type = node.node_type().unwrap_or("unknown").to_string();
            *nodes_by_type.entry(node_type.clone()).or_insert(0) += 1;
            views.push(NodeView {
                node_id: node.id.clone(),
                node_type,
                state: self
                    .node_states
                    .get(&node.id)
                    .copied()
                    .unwrap_or(NodeState::Pending),
                heartbeat_age_s: snapshot
                    .get(&node.id)
                    .map(|l| now.saturating_sub(l.last_heartbeat)),
            });
        }
        views.extend(departed.iter().map(|node| NodeView {
            node_id: node.id.clone(),
            node_type: node.node_type().unwrap_or("unknown").to_string(),
            state: NodeState::Removed,
            heartbeat_age_s: None,
        }));

        self.status_tx.send_replace(AutoscalerStatus {
            cluster_name: self.config.cluster_name.clone(),
            ticks: self.tick_count,
            nodes_by_type,
            nodes: views,
            updaters_in_flight: self.updaters.in_flight(),
            launched_total: self.launched_total,
            terminated_total: self.terminated_total,
            update_failures_total: self.update_failures_total,
            breaker: self.breaker.state(),
            last_tick: Some(summary.clone()),
            last_error: None,
        });
    }
}
