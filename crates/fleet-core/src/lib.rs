//! fleet-core: shared model for the fleetscale autoscaler.
//!
//! Node identifiers and tags, resource vectors, the `cluster.toml`
//! config, and the configuration fingerprints the control loop uses
//! to detect drift.
//!
//! # Drift detection
//!
//! ```text
//! launch-config-hash tag != launch_hash(type)   → terminate and replace
//! file-sync-hash tag     != files_hash(type)    → dispatch an updater
//! both match                                     → leave untouched
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod hasher;
pub mod status;
pub mod tags;
pub mod types;

pub use config::{AuthConfig, AutoscalerConfig, ClusterConfig, NodeTypeConfig, ProviderConfig};
pub use error::{ConfigError, ConfigResult, HashError, HashResult};
pub use hasher::{LaunchConfig, NodeTypeHashes, files_hash, hashes_for, launch_hash};
pub use status::{AutoscalerStatus, BreakerState, NodeState, NodeView, TickSummary};
pub use types::*;
