//! fleetscale-autoscale: the cluster control loop.
//!
//! # Architecture
//!
//! ```text
//!   demand (watch) ─┐        heartbeats ─► SharedLoadMetrics ─┐
//!                   ▼                                         ▼
//!   ControlCommand ─► Autoscaler::tick_at ◄──────── snapshot per tick
//!     (mpsc)             │
//!                        ├── NodeProvider: list / tag / create / terminate
//!                        ├── FailureBreaker: halts launches, never terminations
//!                        └── UpdaterPool ─► NodeUpdater tasks (one per node)
//!                        ▼
//!               AutoscalerStatus (watch) ─► API, /metrics
//! ```
//!
//! One task owns the `Autoscaler`, so ticks never overlap. Local
//! state is a cache; every tick starts from `list_nodes`.

pub mod breaker;
pub mod control;
pub mod demand;
pub mod error;
pub mod scaler;

pub use breaker::FailureBreaker;
pub use control::{ControlCommand, ControlReceiver, ControlSender, control_channel};
pub use demand::{NodeCapacity, bin_pack, compute_targets, get_instances_for, utilization_score};
pub use error::{AutoscalerError, AutoscalerResult};
pub use scaler::Autoscaler;
