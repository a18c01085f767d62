//! Control-loop behavior against the in-memory provider.
//!
//! Ticks are driven by hand with an explicit heartbeat clock, so every
//! scenario is deterministic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use fleet_core::tags::{
    STATUS_UP_TO_DATE, TAG_CLUSTER_NAME, TAG_FILE_SYNC, TAG_LAUNCH_CONFIG, TAG_NODE_STATUS,
    TAG_NODE_TYPE,
};
use fleet_core::{ClusterConfig, NodeId, NodeState, NodeTags, ResourceDemand, Resources};
use fleetscale_autoscale::{Autoscaler, ControlCommand, ControlSender, control_channel};
use fleetscale_metrics::{LoadMetrics, SharedLoadMetrics};
use fleetscale_provider::{
    FakeCommandRunner, FakeProvider, Invocation, NodeProvider, ProviderError, RetryPolicy,
};

const BASE: &str = r#"
cluster_name = "it"
head_node_type = "head"

[autoscaler]
max_num_failures = 3
heartbeat_timeout_s = 30
idle_timeout_s = 60

[provider]
type = "fake"
auto_run = false

[node_types.head]
min_workers = 1
max_workers = 1
resources = { CPU = 4 }
setup_commands = ["echo head-setup"]

[node_types.worker]
max_workers = 4
resources = { CPU = 2 }
setup_commands = ["echo worker-setup"]
"#;

struct Harness {
    provider: Arc<FakeProvider>,
    scaler: Autoscaler,
    demand: watch::Sender<ResourceDemand>,
    load: SharedLoadMetrics,
    control: ControlSender,
}

fn harness(config: ClusterConfig, provider: FakeProvider) -> Harness {
    let provider = Arc::new(provider);
    let load = LoadMetrics::shared(config.autoscaler.heartbeat_timeout_s);
    let (demand, demand_rx) = watch::channel(Vec::new());
    let (control, control_rx) = control_channel();
    let scaler = Autoscaler::new(config, provider.clone(), load.clone(), demand_rx)
        .unwrap()
        .with_control(control_rx)
        .with_retry(RetryPolicy::new(0))
        .with_updater_poll_interval(Duration::from_millis(5));
    Harness {
        provider,
        scaler,
        demand,
        load,
        control,
    }
}

fn base() -> Harness {
    harness(ClusterConfig::from_toml_str(BASE).unwrap(), FakeProvider::new())
}

fn cpu(n: f64) -> Resources {
    Resources::new().with("CPU", n)
}

impl Harness {
    fn tags(&self, node_type: &str, up_to_date: bool) -> NodeTags {
        let hashes = &self.scaler.hashes()[node_type];
        let mut tags: NodeTags = [
            (TAG_CLUSTER_NAME.to_string(), "it".to_string()),
            (TAG_NODE_TYPE.to_string(), node_type.to_string()),
            (TAG_LAUNCH_CONFIG.to_string(), hashes.launch.as_str().to_string()),
        ]
        .into_iter()
        .collect();
        if up_to_date {
            tags.insert(TAG_FILE_SYNC.into(), hashes.files.as_str().to_string());
            tags.insert(TAG_NODE_STATUS.into(), STATUS_UP_TO_DATE.into());
        }
        tags
    }

    /// A running, fully configured node.
    async fn ready_node(&self, node_type: &str) -> NodeId {
        self.provider.insert_node(self.tags(node_type, true), true).await
    }

    async fn beat(&self, node_id: &NodeId, used: f64, available: f64, now: u64) {
        self.load
            .write()
            .await
            .record_heartbeat(node_id, cpu(used), cpu(available), now);
    }
}

#[tokio::test]
async fn head_scenario_launches_once_then_bootstraps() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("app.py"), "print('hi')").unwrap();
    let config = format!(
        "{BASE}\n[node_types.head.file_mounts]\n\"/srv/app\" = {:?}\n",
        dir.path().display().to_string()
    );
    let mut h = harness(ClusterConfig::from_toml_str(&config).unwrap(), FakeProvider::new());
    h.demand.send_replace(vec![cpu(4.0)]);

    let s = h.scaler.tick_at(1_000).await.unwrap();
    assert_eq!(s.launched, 1);
    assert_eq!(s.targets["head"], 1);
    assert_eq!(s.targets["worker"], 0);
    assert_eq!(h.provider.create_calls(), 1);

    // Still pending: nothing to bootstrap, nothing more to launch.
    let s = h.scaler.tick_at(1_005).await.unwrap();
    assert_eq!(s.updaters_dispatched, 0);
    assert_eq!(h.provider.create_calls(), 1);

    h.provider.run_all_pending().await;
    let s = h.scaler.tick_at(1_010).await.unwrap();
    assert_eq!(s.updaters_dispatched, 1);
    assert_eq!(h.scaler.wait_for_updaters().await, 1);

    let head = h.provider.live_nodes().await.remove(0);
    let hashes = h.scaler.hashes()["head"].clone();
    let tags = h.provider.node_tags(&head).await.unwrap();
    assert_eq!(tags[TAG_LAUNCH_CONFIG], hashes.launch.as_str());
    assert_eq!(tags[TAG_FILE_SYNC], hashes.files.as_str());
    assert_eq!(tags[TAG_NODE_STATUS], STATUS_UP_TO_DATE);

    let runner = h.provider.runner();
    assert!(runner.commands_for(&head).await.contains(&"echo head-setup".to_string()));
    assert!(runner.invocations().await.iter().any(|inv| matches!(
        inv,
        Invocation::Sync { node_id, target, .. } if *node_id == head && target == "/srv/app"
    )));

    // Up to date: left untouched.
    let s = h.scaler.tick_at(1_015).await.unwrap();
    assert_eq!(s.updates_succeeded, 1);
    assert_eq!(s.updaters_dispatched, 0);
    assert_eq!(h.provider.create_calls(), 1);
    let status = h.scaler.status().borrow().clone();
    assert_eq!(status.nodes[0].state, NodeState::Ready);
}

#[tokio::test]
async fn repeated_tick_issues_no_additional_launches() {
    let mut h = base();
    h.demand.send_replace(vec![cpu(2.0); 3]);

    let s = h.scaler.tick_at(1_000).await.unwrap();
    assert_eq!(s.targets["head"], 1);
    assert_eq!(s.targets["worker"], 1);
    assert_eq!(h.provider.create_calls(), 2);

    let s = h.scaler.tick_at(1_005).await.unwrap();
    assert_eq!(s.launched, 0);
    assert_eq!(h.provider.create_calls(), 2);
    assert_eq!(h.provider.live_nodes().await.len(), 2);
}

#[tokio::test]
async fn launches_stay_within_concurrency_limit() {
    let config = r#"
cluster_name = "it"
head_node_type = "head"

[autoscaler]
max_concurrent_launches = 3
max_launch_batch = 1

[provider]
type = "fake"

[node_types.head]
max_workers = 1
resources = { CPU = 4 }

[node_types.a]
min_workers = 2
max_workers = 2
resources = { CPU = 1 }

[node_types.b]
min_workers = 2
max_workers = 2
resources = { CPU = 1 }

[node_types.c]
min_workers = 2
max_workers = 2
resources = { CPU = 1 }
"#;
    let provider = FakeProvider::new().with_create_latency(Duration::from_millis(20));
    let mut h = harness(ClusterConfig::from_toml_str(config).unwrap(), provider);

    let s = h.scaler.tick_at(1_000).await.unwrap();
    assert_eq!(s.launched, 3);
    assert!(h.provider.peak_concurrent_creates() <= 3);

    // Three nodes still pending: no budget left.
    h.scaler.tick_at(1_005).await.unwrap();
    assert_eq!(h.provider.create_calls(), 3);

    h.provider.run_all_pending().await;
    let s = h.scaler.tick_at(1_010).await.unwrap();
    assert_eq!(s.launched, 3);
    assert_eq!(h.provider.live_nodes().await.len(), 6);
    assert!(h.provider.peak_concurrent_creates() <= 3);
    h.scaler.wait_for_updaters().await;
}

#[tokio::test]
async fn breaker_halts_launches_but_not_terminations() {
    let mut h = base();
    h.provider
        .fail_next_creates(3, ProviderError::Permanent("quota exceeded".into()))
        .await;

    for (i, now) in [1_000, 1_005, 1_010].into_iter().enumerate() {
        let s = h.scaler.tick_at(now).await.unwrap();
        assert_eq!(s.provider_failures, 1);
        assert_eq!(h.provider.create_calls(), i as u32 + 1);
    }
    assert!(h.scaler.breaker_state().tripped);

    let s = h.scaler.tick_at(1_015).await.unwrap();
    assert!(s.launches_blocked);
    assert_eq!(h.provider.create_calls(), 3);

    let mut drifted = h.tags("head", true);
    drifted.insert(TAG_LAUNCH_CONFIG.into(), "0ld".into());
    let node = h.provider.insert_node(drifted, true).await;
    let s = h.scaler.tick_at(1_020).await.unwrap();
    assert_eq!(s.terminated, 1);
    assert_eq!(h.provider.terminated().await, vec![node]);
    assert_eq!(h.provider.create_calls(), 3);

    h.control.send(ControlCommand::ResetBreaker).await.unwrap();
    let s = h.scaler.tick_at(1_025).await.unwrap();
    assert_eq!(s.launched, 1);
    assert_eq!(h.provider.create_calls(), 4);
    assert!(!h.scaler.breaker_state().tripped);
    assert_eq!(h.scaler.breaker_state().total_failures, 3);
}

#[tokio::test]
async fn stale_node_is_reaped_one_second_past_timeout() {
    let mut h = base();
    let head = h.ready_node("head").await;
    let worker = h.ready_node("worker").await;
    h.beat(&worker, 1.0, 1.0, 1_000).await;

    h.beat(&head, 0.0, 4.0, 1_030).await;
    let s = h.scaler.tick_at(1_030).await.unwrap();
    assert_eq!(s.terminated, 0);

    h.beat(&head, 0.0, 4.0, 1_031).await;
    let s = h.scaler.tick_at(1_031).await.unwrap();
    assert_eq!(s.terminated, 1);
    assert_eq!(h.provider.terminated().await, vec![worker.clone()]);
    assert!(h.load.read().await.get(&worker).is_none());
}

#[tokio::test]
async fn drifted_node_is_replaced_not_updated() {
    let mut h = base();
    let mut tags = h.tags("head", false);
    tags.insert(TAG_LAUNCH_CONFIG.into(), "0ld".into());
    let drifted = h.provider.insert_node(tags, true).await;

    let s = h.scaler.tick_at(1_000).await.unwrap();
    assert_eq!(s.terminated, 1);
    assert_eq!(s.updaters_dispatched, 0);
    assert_eq!(h.provider.terminated().await, vec![drifted.clone()]);
    assert_eq!(h.provider.create_calls(), 1);
    assert!(h.provider.runner().commands_for(&drifted).await.is_empty());
}

#[tokio::test]
async fn failed_update_taints_and_replaces_without_tripping_breaker() {
    let runner = FakeCommandRunner::new();
    runner.fail_command("head-setup", 2).await;
    let provider = FakeProvider::new().with_auto_run(true).with_runner(runner);
    let mut h = harness(ClusterConfig::from_toml_str(BASE).unwrap(), provider);

    h.scaler.tick_at(1_000).await.unwrap();
    let s = h.scaler.tick_at(1_005).await.unwrap();
    assert_eq!(s.updaters_dispatched, 1);
    h.scaler.wait_for_updaters().await;
    let broken = h.provider.live_nodes().await.remove(0);

    let s = h.scaler.tick_at(1_010).await.unwrap();
    assert_eq!(s.updates_failed, 1);
    assert_eq!(s.terminated, 1);
    assert_eq!(s.launched, 1);
    assert_eq!(h.provider.terminated().await, vec![broken]);

    let status = h.scaler.status().borrow().clone();
    assert_eq!(status.update_failures_total, 1);
    assert_eq!(status.breaker.failures_in_window, 0);
}

#[tokio::test]
async fn non_head_updates_export_head_address() {
    let mut h = base();
    let head = h.ready_node("head").await;
    let worker = h.provider.insert_node(h.tags("worker", false), true).await;

    let s = h.scaler.tick_at(1_000).await.unwrap();
    assert_eq!(s.updaters_dispatched, 1);
    h.scaler.wait_for_updaters().await;

    let head_ip = h.provider.internal_ip(&head).await.unwrap();
    let commands = h.provider.runner().commands_for(&worker).await;
    assert!(commands.iter().any(|c| c.contains("FLEET_HEAD_IP")
        && c.contains(&head_ip)
        && c.contains("echo worker-setup")));
    let tags = h.provider.node_tags(&worker).await.unwrap();
    assert_eq!(tags[TAG_FILE_SYNC], h.scaler.hashes()["worker"].files.as_str());
}

#[tokio::test]
async fn idle_workers_scale_down_to_min() {
    let mut h = base();
    let head = h.ready_node("head").await;
    let w1 = h.ready_node("worker").await;
    let w2 = h.ready_node("worker").await;
    for node in [&head, &w1, &w2] {
        h.beat(node, 0.0, 2.0, 1_000).await;
        h.beat(node, 0.0, 2.0, 1_100).await;
    }

    let s = h.scaler.tick_at(1_100).await.unwrap();
    assert_eq!(s.targets["worker"], 0);
    assert_eq!(s.terminated, 2);
    let mut gone = h.provider.terminated().await;
    gone.sort();
    assert_eq!(gone, vec![w1, w2]);
    assert_eq!(h.provider.live_nodes().await, vec![head]);
}

#[tokio::test]
async fn idle_worker_that_absorbs_demand_is_kept() {
    let mut h = base();
    let head = h.ready_node("head").await;
    let worker = h.ready_node("worker").await;
    h.beat(&head, 4.0, 0.0, 1_000).await;
    h.beat(&worker, 0.0, 2.0, 1_000).await;
    h.beat(&head, 4.0, 0.0, 1_100).await;
    h.beat(&worker, 0.0, 2.0, 1_100).await;
    h.demand.send_replace(vec![cpu(2.0)]);

    let s = h.scaler.tick_at(1_100).await.unwrap();
    assert_eq!(s.targets["worker"], 1);
    assert_eq!(s.terminated, 0);
}

#[tokio::test]
async fn unknown_types_are_terminated_and_other_clusters_ignored() {
    let mut h = base();
    h.ready_node("head").await;
    let mut alien = h.tags("head", true);
    alien.insert(TAG_NODE_TYPE.into(), "gpu".into());
    let alien = h.provider.insert_node(alien, true).await;
    let mut foreign = h.tags("head", true);
    foreign.insert(TAG_CLUSTER_NAME.into(), "other".into());
    let foreign = h.provider.insert_node(foreign, true).await;

    let s = h.scaler.tick_at(1_000).await.unwrap();
    assert_eq!(s.terminated, 1);
    assert_eq!(h.provider.terminated().await, vec![alien]);
    assert!(h.provider.live_nodes().await.contains(&foreign));
}

#[tokio::test]
async fn reload_reupdates_changed_files_and_replaces_changed_launch() {
    let mut h = base();
    let head = h.ready_node("head").await;

    let mut config = ClusterConfig::from_toml_str(BASE).unwrap();
    config.setup_commands = vec!["echo global".into()];
    h.control
        .send(ControlCommand::Reconfigure(Box::new(config.clone())))
        .await
        .unwrap();
    let s = h.scaler.tick_at(1_000).await.unwrap();
    assert_eq!(s.terminated, 0);
    assert_eq!(s.updaters_dispatched, 1);
    h.scaler.wait_for_updaters().await;
    assert!(h.provider.runner().commands_for(&head).await.contains(&"echo global".to_string()));

    if let Some(nt) = config.node_types.get_mut("head") {
        nt.resources = cpu(8.0);
    }
    h.control
        .send(ControlCommand::Reconfigure(Box::new(config)))
        .await
        .unwrap();
    let s = h.scaler.tick_at(1_005).await.unwrap();
    assert_eq!(s.terminated, 1);
    assert_eq!(s.launched, 1);
    assert_eq!(h.provider.terminated().await, vec![head]);
}

#[tokio::test]
async fn status_is_published_every_tick() {
    let mut h = base();
    let status = h.scaler.status();
    h.ready_node("head").await;
    h.ready_node("worker").await;

    h.scaler.tick_at(1_000).await.unwrap();
    h.scaler.tick_at(1_005).await.unwrap();

    let snapshot = status.borrow().clone();
    assert_eq!(snapshot.cluster_name, "it");
    assert_eq!(snapshot.ticks, 2);
    assert_eq!(snapshot.nodes_by_type["head"], 1);
    assert_eq!(snapshot.nodes_by_type["worker"], 1);
    assert!(snapshot.last_error.is_none());
    assert_eq!(snapshot.last_tick.unwrap().tick, 2);
}

#[tokio::test]
async fn terminated_node_is_listed_as_removed_for_one_tick() {
    let mut h = base();
    let status = h.scaler.status();
    h.ready_node("head").await;
    let mut alien = h.tags("head", true);
    alien.insert(TAG_NODE_TYPE.into(), "gpu".into());
    let alien = h.provider.insert_node(alien, true).await;

    let s = h.scaler.tick_at(1_000).await.unwrap();
    assert_eq!(s.terminated, 1);
    let snapshot = status.borrow().clone();
    let view = snapshot.nodes.iter().find(|v| v.node_id == alien).unwrap();
    assert_eq!(view.state, NodeState::Removed);
    assert_eq!(view.node_type, "gpu");
    assert!(!snapshot.nodes_by_type.contains_key("gpu"));

    h.scaler.tick_at(1_005).await.unwrap();
    let snapshot = status.borrow().clone();
    assert!(snapshot.nodes.iter().all(|v| v.node_id != alien));
    assert_eq!(snapshot.nodes.len(), 1);
}

#[tokio::test]
async fn overlong_tick_is_reported_in_status() {
    let mut config = ClusterConfig::from_toml_str(BASE).unwrap();
    config.autoscaler.tick_deadline_s = 1;
    config.autoscaler.update_interval_s = 1;
    let Harness { provider, mut scaler, .. } = harness(
        config,
        FakeProvider::new().with_create_latency(Duration::from_secs(3)),
    );
    let mut status = scaler.status();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        scaler.run(shutdown_rx).await;
    });

    // The head launch outlives the deadline on the first tick.
    let error = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            status.changed().await.unwrap();
            if let Some(e) = status.borrow_and_update().last_error.clone() {
                return e;
            }
        }
    })
    .await
    .unwrap();
    assert!(error.contains("deadline"), "{error}");
    assert!(provider.create_calls() >= 1);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}
