//! Status published by the control loop after every tick.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Local lifecycle bookkeeping for one node. Not external truth:
/// rebuilt from provider tags on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    Pending,
    RunningUnconfigured,
    Updating,
    Ready,
    Terminating,
    Removed,
}

impl NodeState {
    /// Whether `self → next` is a legal edge. Any live state may move
    /// straight to `Terminating`; `Removed` is absorbing.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        match (self, next) {
            (Removed, _) => false,
            (_, Terminating) => self != Terminating,
            (Terminating, Removed) => true,
            (Pending, RunningUnconfigured) => true,
            (Pending | RunningUnconfigured, Ready) => true,
            (RunningUnconfigured | Ready, Updating) => true,
            (Updating, Ready | RunningUnconfigured) => true,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::RunningUnconfigured => "running-unconfigured",
            NodeState::Updating => "updating",
            NodeState::Ready => "ready",
            NodeState::Terminating => "terminating",
            NodeState::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Per-node row of the status view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    pub node_id: NodeId,
    pub node_type: String,
    pub state: NodeState,
    /// Seconds since the last heartbeat, if any was received.
    pub heartbeat_age_s: Option<u64>,
}

/// Failure breaker state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    pub tripped: bool,
    pub failures_in_window: u32,
    pub max_num_failures: u32,
    pub window_ticks: u64,
    /// Lifetime count, never reset.
    pub total_failures: u64,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: u64,
    pub started_at: u64,
    pub nodes: usize,
    pub targets: BTreeMap<String, u32>,
    pub launched: u32,
    pub terminated: u32,
    pub updaters_dispatched: u32,
    pub updates_succeeded: u32,
    pub updates_failed: u32,
    pub provider_failures: u32,
    pub launches_blocked: bool,
}

/// Snapshot published on the status channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoscalerStatus {
    pub cluster_name: String,
    pub ticks: u64,
    pub nodes_by_type: BTreeMap<String, usize>,
    pub nodes: Vec<NodeView>,
    pub updaters_in_flight: usize,
    pub launched_total: u64,
    pub terminated_total: u64,
    pub update_failures_total: u64,
    pub breaker: BreakerState,
    pub last_tick: Option<TickSummary>,
    pub last_error: Option<String>,
}
