//! fleetscale-metrics: cluster load view built from node heartbeats.
//!
//! # Architecture
//!
//! ```text
//! heartbeat feed ──► SharedLoadMetrics ──clone──► tick snapshot
//!   (node_id, used, available, now)         │
//!                                           ├── stale_nodes(now)   → forced termination
//!                                           ├── idle_for(node,now) → scale-down candidates
//!                                           └── get_resource_usage → utilization target
//! ```
//!
//! A node silent for longer than `heartbeat_timeout_s` is excluded
//! from every aggregate and reported as stale.

pub mod load;
pub mod prometheus;

pub use load::{LoadMetrics, NodeLoad, ResourceUsage, SharedLoadMetrics};
pub use prometheus::render_prometheus;
