//! Load metrics: per-node heartbeats aggregated into a cluster view.
//!
//! Each node's record is keyed independently; aggregation is a plain
//! sum over nodes whose heartbeat is still fresh. The control loop
//! clones the whole store at the start of a tick and reads only that
//! snapshot, while the heartbeat feed keeps writing to the shared one.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use fleet_core::{NodeId, Resources};

/// Heartbeat store shared between the feed and the control loop.
pub type SharedLoadMetrics = Arc<RwLock<LoadMetrics>>;

/// Latest report from one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeLoad {
    pub used: Resources,
    pub available: Resources,
    pub last_heartbeat: u64,
    /// Last heartbeat that reported any non-zero usage.
    pub last_used: u64,
}

impl NodeLoad {
    pub fn total(&self) -> Resources {
        Resources::sum(&self.used, &self.available)
    }

    /// Largest used/total fraction across resources.
    pub fn utilization(&self) -> f64 {
        self.used.max_fraction_of(&self.total())
    }
}

/// Cluster-wide usage over non-stale nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    /// `nodes_used / node_count`, 0 for an empty cluster.
    pub utilization_fraction: f64,
    /// Sum of per-node utilization; a node at 50% counts as 0.5.
    pub nodes_used: f64,
    pub node_count: usize,
    pub used_by_resource: BTreeMap<String, f64>,
    pub available_by_resource: BTreeMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct LoadMetrics {
    nodes: HashMap<NodeId, NodeLoad>,
    heartbeat_timeout_s: u64,
}

impl LoadMetrics {
    pub fn new(heartbeat_timeout_s: u64) -> Self {
        Self {
            nodes: HashMap::new(),
            heartbeat_timeout_s,
        }
    }

    pub fn shared(heartbeat_timeout_s: u64) -> SharedLoadMetrics {
        Arc::new(RwLock::new(Self::new(heartbeat_timeout_s)))
    }

    pub fn heartbeat_timeout_s(&self) -> u64 {
        self.heartbeat_timeout_s
    }

    pub fn set_heartbeat_timeout_s(&mut self, timeout_s: u64) {
        self.heartbeat_timeout_s = timeout_s;
    }

    /// Record a heartbeat. Reports older than the stored one are
    /// dropped, so redelivery never moves a node backwards in time.
    pub fn record_heartbeat(
        &mut self,
        node_id: &NodeId,
        used: Resources,
        available: Resources,
        now: u64,
    ) -> bool {
        let busy = !used.is_zero();
        match self.nodes.get_mut(node_id) {
            Some(load) if now < load.last_heartbeat => {
                warn!(%node_id, now, last = load.last_heartbeat, "out-of-order heartbeat dropped");
                false
            }
            Some(load) => {
                load.used = used;
                load.available = available;
                load.last_heartbeat = now;
                if busy {
                    load.last_used = now;
                }
                true
            }
            None => {
                debug!(%node_id, "first heartbeat");
                self.nodes.insert(
                    node_id.clone(),
                    NodeLoad {
                        used,
                        available,
                        last_heartbeat: now,
                        last_used: now,
                    },
                );
                true
            }
        }
    }

    /// Start the heartbeat clock for a node that has just become
    /// ready, so a node that never reports still goes stale.
    pub fn mark_active(&mut self, node_id: &NodeId, now: u64) {
        self.nodes.entry(node_id.clone()).or_insert(NodeLoad {
            used: Resources::new(),
            available: Resources::new(),
            last_heartbeat: now,
            last_used: now,
        });
    }

    /// Nodes whose last heartbeat is strictly before `older_than`.
    pub fn mark_stale(&self, older_than: u64) -> BTreeSet<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, load)| load.last_heartbeat < older_than)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Nodes silent for longer than the heartbeat timeout at `now`.
    pub fn stale_nodes(&self, now: u64) -> BTreeSet<NodeId> {
        self.mark_stale(now.saturating_sub(self.heartbeat_timeout_s))
    }

    pub fn is_stale(&self, node_id: &NodeId, now: u64) -> bool {
        self.nodes
            .get(node_id)
            .is_some_and(|load| now.saturating_sub(load.last_heartbeat) > self.heartbeat_timeout_s)
    }

    /// Seconds a node has reported zero usage, if it has reported.
    pub fn idle_for(&self, node_id: &NodeId, now: u64) -> Option<u64> {
        self.nodes
            .get(node_id)
            .map(|load| now.saturating_sub(load.last_used))
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&NodeLoad> {
        self.nodes.get(node_id)
    }

    /// Usage summed over nodes with a fresh heartbeat at `now`.
    pub fn get_resource_usage(&self, now: u64) -> ResourceUsage {
        let mut usage = ResourceUsage::default();
        for (node_id, load) in &self.nodes {
            if self.is_stale(node_id, now) {
                continue;
            }
            usage.node_count += 1;
            usage.nodes_used += load.utilization();
            for (name, amount) in load.used.iter() {
                *usage.used_by_resource.entry(name.to_string()).or_insert(0.0) += amount;
            }
            for (name, amount) in load.available.iter() {
                *usage
                    .available_by_resource
                    .entry(name.to_string())
                    .or_insert(0.0) += amount;
            }
        }
        if usage.node_count > 0 {
            usage.utilization_fraction = usage.nodes_used / usage.node_count as f64;
        }
        usage
    }

    /// Drop records for nodes the provider no longer reports.
    pub fn prune(&mut self, live: &HashSet<NodeId>) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|id, _| live.contains(id));
        let pruned = before - self.nodes.len();
        if pruned > 0 {
            debug!(pruned, "pruned load records of departed nodes");
        }
        pruned
    }

    pub fn remove(&mut self, node_id: &NodeId) {
        self.nodes.remove(node_id);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
