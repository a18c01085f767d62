//! Tag keys and node-status values written onto provider nodes.
//!
//! Tags are the only state fleetscale persists; the control loop
//! re-derives everything else from them after a restart.

/// Cluster the node belongs to. Used as the `list_nodes` filter.
pub const TAG_CLUSTER_NAME: &str = "cluster-name";
/// Node type name from the cluster config.
pub const TAG_NODE_TYPE: &str = "node-type";
/// Human-readable name.
pub const TAG_NODE_NAME: &str = "node-name";
/// Bootstrap progress, one of the `STATUS_*` values.
pub const TAG_NODE_STATUS: &str = "node-status";
/// Launch hash the node was created with.
pub const TAG_LAUNCH_CONFIG: &str = "launch-config-hash";
/// Files hash of the last successful update.
pub const TAG_FILE_SYNC: &str = "file-sync-hash";

pub const STATUS_UNINITIALIZED: &str = "uninitialized";
pub const STATUS_WAITING_FOR_NODE: &str = "waiting-for-node";
pub const STATUS_SYNCING_FILES: &str = "syncing-files";
pub const STATUS_SETTING_UP: &str = "setting-up";
pub const STATUS_UP_TO_DATE: &str = "up-to-date";
pub const STATUS_UPDATE_FAILED: &str = "update-failed";
