//! fleetscale-updater: bootstraps freshly launched nodes.
//!
//! A `NodeUpdater` waits for its node to run, copies the file mounts,
//! runs the init commands in order, and finally writes the files hash
//! tag. The `UpdaterPool` runs updaters as independent tasks with at
//! most one per node.

pub mod error;
pub mod pool;
pub mod updater;

pub use error::{UpdateError, UpdateResult};
pub use pool::{UpdateOutcome, UpdaterPool};
pub use updater::{NodeUpdater, UpdateRequest};
