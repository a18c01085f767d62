//! In-flight updaters, at most one per node.
//!
//! Each updater runs as its own task. The owning control loop polls
//! `collect_finished` once per tick; results are only ever merged back
//! on that loop, so no state is shared with the tasks themselves.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fleet_core::NodeId;

use crate::error::{UpdateError, UpdateResult};
use crate::updater::NodeUpdater;

/// Default grace on top of an updater's own timeout before its task
/// is aborted outright.
pub const DEFAULT_ABANDON_GRACE: Duration = Duration::from_secs(30);

/// Result of one finished (or abandoned) updater.
#[derive(Debug)]
pub struct UpdateOutcome {
    pub node_id: NodeId,
    pub node_type: String,
    pub result: UpdateResult,
    pub elapsed: Duration,
}

struct UpdaterSlot {
    handle: JoinHandle<UpdateResult>,
    node_type: String,
    started: Instant,
    /// Abort the task if it is still running past this point.
    deadline: Duration,
}

pub struct UpdaterPool {
    slots: HashMap<NodeId, UpdaterSlot>,
    abandon_grace: Duration,
}

impl Default for UpdaterPool {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            abandon_grace: DEFAULT_ABANDON_GRACE,
        }
    }
}

impl UpdaterPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long past its own timeout an updater may run before
    /// `collect_finished` aborts it.
    pub fn with_abandon_grace(mut self, grace: Duration) -> Self {
        self.abandon_grace = grace;
        self
    }

    /// Spawn `updater` unless one is already running for its node.
    /// Returns whether it was dispatched.
    pub fn dispatch(&mut self, updater: NodeUpdater) -> bool {
        let node_id = updater.node_id().clone();
        if self.slots.contains_key(&node_id) {
            debug!(%node_id, "updater already in flight");
            return false;
        }
        let node_type = updater.node_type().to_string();
        let deadline = updater.timeout() + self.abandon_grace;
        let handle = tokio::spawn(updater.run());
        self.slots.insert(
            node_id,
            UpdaterSlot {
                handle,
                node_type,
                started: Instant::now(),
                deadline,
            },
        );
        true
    }

    pub fn is_updating(&self, node_id: &NodeId) -> bool {
        self.slots.contains_key(node_id)
    }

    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Drain updaters that have finished, plus any that overran their
    /// deadline (aborted and reported as timed out). Never blocks on a
    /// running updater.
    pub async fn collect_finished(&mut self) -> Vec<UpdateOutcome> {
        let ready: Vec<NodeId> = self
            .slots
            .iter()
            .filter(|(_, s)| s.handle.is_finished() || s.started.elapsed() > s.deadline)
            .map(|(id, _)| id.clone())
            .collect();

        let mut outcomes = Vec::with_capacity(ready.len());
        for node_id in ready {
            if let Some(slot) = self.slots.remove(&node_id) {
                outcomes.push(finish(node_id, slot).await);
            }
        }
        outcomes
    }

    /// Wait for every in-flight updater.
    pub async fn wait_all(&mut self) -> Vec<UpdateOutcome> {
        let mut outcomes = Vec::with_capacity(self.slots.len());
        for (node_id, slot) in self.slots.drain() {
            let elapsed_start = slot.started;
            let result = join(slot.handle).await;
            outcomes.push(UpdateOutcome {
                node_id,
                node_type: slot.node_type,
                result,
                elapsed: elapsed_start.elapsed(),
            });
        }
        outcomes
    }

    /// Abort every in-flight updater (shutdown).
    pub fn abort_all(&mut self) {
        for (node_id, slot) in self.slots.drain() {
            debug!(%node_id, "aborting updater");
            slot.handle.abort();
        }
    }
}

impl Drop for UpdaterPool {
    fn drop(&mut self) {
        self.abort_all();
    }
}

async fn finish(node_id: NodeId, slot: UpdaterSlot) -> UpdateOutcome {
    let elapsed = slot.started.elapsed();
    let result = if slot.handle.is_finished() {
        join(slot.handle).await
    } else {
        warn!(%node_id, elapsed_s = elapsed.as_secs(), "abandoning overdue updater");
        slot.handle.abort();
        Err(UpdateError::Timeout(elapsed))
    };
    UpdateOutcome {
        node_id,
        node_type: slot.node_type,
        result,
        elapsed,
    }
}

async fn join(handle: JoinHandle<UpdateResult>) -> UpdateResult {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(UpdateError::Aborted(e.to_string())),
    }
}
