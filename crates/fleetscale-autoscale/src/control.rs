//! Operator commands delivered to the running control loop.

use tokio::sync::mpsc;

use fleet_core::ClusterConfig;

/// Applied at the start of the next tick, in arrival order.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Un-trip the failure breaker and clear its window.
    ResetBreaker,
    /// Swap in a new cluster config. Hashes are recomputed, so nodes
    /// whose launch hash changed are replaced and nodes whose files
    /// hash changed are updated again.
    Reconfigure(Box<ClusterConfig>),
}

pub type ControlSender = mpsc::Sender<ControlCommand>;
pub type ControlReceiver = mpsc::Receiver<ControlCommand>;

/// Bounded channel; operators never queue more than a handful.
pub fn control_channel() -> (ControlSender, ControlReceiver) {
    mpsc::channel(16)
}
