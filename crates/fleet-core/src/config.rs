//! Cluster config (`cluster.toml`) parser.
//!
//! ```toml
//! cluster_name = "demo"
//! head_node_type = "head"
//! setup_commands = ["pip install -r /srv/app/requirements.txt"]
//!
//! [file_mounts]
//! "/srv/app" = "./app"
//!
//! [provider]
//! type = "static"
//! hosts = { head = ["10.0.0.1"], worker = ["10.0.0.2", "10.0.0.3"] }
//!
//! [autoscaler]
//! max_num_failures = 5
//!
//! [node_types.head]
//! min_workers = 1
//! max_workers = 1
//! resources = { CPU = 4 }
//!
//! [node_types.worker]
//! max_workers = 2
//! resources = { CPU = 2 }
//! node_config = { InstanceType = "m5.large" }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::types::Resources;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub head_node_type: String,
    #[serde(default)]
    pub autoscaler: AutoscalerConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub docker: Option<DockerConfig>,
    /// Remote destination → local source, applied to every node type.
    #[serde(default)]
    pub file_mounts: BTreeMap<String, PathBuf>,
    /// Commands run on every node type before its own setup commands.
    #[serde(default)]
    pub setup_commands: Vec<String>,
    pub node_types: BTreeMap<String, NodeTypeConfig>,
}

/// Control-loop tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    /// Most nodes requested by a single `create_node` call.
    pub max_launch_batch: u32,
    /// Most nodes pending or being requested cluster-wide.
    pub max_concurrent_launches: u32,
    pub update_interval_s: u64,
    pub heartbeat_timeout_s: u64,
    /// Provider failures within the window that trip the breaker.
    pub max_num_failures: u32,
    /// Length of the failure window, in ticks.
    pub failure_window_ticks: u64,
    pub idle_timeout_s: u64,
    /// Bound on one node update, from dispatch to final tag write.
    pub update_timeout_s: u64,
    pub target_utilization_fraction: f64,
    /// Attempts for a transient provider error before giving up.
    pub provider_max_retries: u32,
    /// Soft deadline for one tick.
    pub tick_deadline_s: u64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            max_launch_batch: 5,
            max_concurrent_launches: 10,
            update_interval_s: 5,
            heartbeat_timeout_s: 30,
            max_num_failures: 5,
            failure_window_ticks: 60,
            idle_timeout_s: 300,
            update_timeout_s: 300,
            target_utilization_fraction: 0.8,
            provider_max_retries: 5,
            tick_deadline_s: 60,
        }
    }
}

impl AutoscalerConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_s)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_s)
    }

    pub fn tick_deadline(&self) -> Duration {
        Duration::from_secs(self.tick_deadline_s)
    }

    /// Apply `FLEET_*` overrides. `lookup` is `std::env::var` in
    /// production; tests pass a map.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_u32(&lookup, "FLEET_MAX_NUM_FAILURES", &mut self.max_num_failures)?;
        override_u32(&lookup, "FLEET_MAX_LAUNCH_BATCH", &mut self.max_launch_batch)?;
        override_u32(
            &lookup,
            "FLEET_MAX_CONCURRENT_LAUNCHES",
            &mut self.max_concurrent_launches,
        )?;
        override_u64(&lookup, "FLEET_UPDATE_INTERVAL_S", &mut self.update_interval_s)?;
        override_u64(&lookup, "FLEET_HEARTBEAT_TIMEOUT_S", &mut self.heartbeat_timeout_s)?;
        Ok(())
    }
}

/// Backend selection. The variant set is closed and chosen at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Fixed pool of on-prem hosts, grouped by node type.
    Static {
        /// Where claimed/free host state is persisted.
        state_path: Option<PathBuf>,
        hosts: BTreeMap<String, Vec<String>>,
        /// Internal address → externally reachable address.
        #[serde(default)]
        external_ips: BTreeMap<String, String>,
    },
    /// In-memory backend for development.
    Fake {
        /// Start created nodes in the running state.
        #[serde(default = "default_true")]
        auto_run: bool,
    },
}

impl ProviderConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderConfig::Static { .. } => "static",
            ProviderConfig::Fake { .. } => "fake",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    pub ssh_private_key: Option<PathBuf>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            ssh_user: default_ssh_user(),
            ssh_private_key: None,
            ssh_port: default_ssh_port(),
        }
    }
}

/// Run init commands inside a container instead of on the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DockerConfig {
    pub image: String,
    pub container_name: String,
    #[serde(default)]
    pub run_options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTypeConfig {
    #[serde(default)]
    pub min_workers: u32,
    pub max_workers: u32,
    /// Static capacity of one node of this type.
    #[serde(default)]
    pub resources: Resources,
    /// Provider-specific instance/pod template, passed through opaquely.
    #[serde(default)]
    pub node_config: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub file_mounts: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub setup_commands: Vec<String>,
    #[serde(default)]
    pub start_commands: Vec<String>,
}

impl ClusterConfig {
    /// Load, apply environment overrides, resolve relative mount paths
    /// against the config's directory, and validate.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: ClusterConfig = toml::from_str(&content)?;
        config
            .autoscaler
            .apply_overrides(|var| std::env::var(var).ok())?;
        if let Some(base) = path.parent() {
            config.resolve_mounts(base);
        }
        config.validate()?;
        debug!(
            path = %path.display(),
            cluster = %config.cluster_name,
            node_types = config.node_types.len(),
            provider = config.provider.kind(),
            "cluster config loaded"
        );
        Ok(config)
    }

    /// Parse and validate without touching the environment.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: ClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(invalid("cluster_name must not be empty"));
        }
        if self.node_types.is_empty() {
            return Err(invalid("at least one node type is required"));
        }
        if !self.node_types.contains_key(&self.head_node_type) {
            return Err(invalid(format!(
                "head_node_type {:?} is not a configured node type",
                self.head_node_type
            )));
        }
        for (name, nt) in &self.node_types {
            if nt.min_workers > nt.max_workers {
                return Err(invalid(format!(
                    "node type {name}: min_workers ({}) exceeds max_workers ({})",
                    nt.min_workers, nt.max_workers
                )));
            }
            if nt.resources.iter().any(|(_, v)| v < 0.0) {
                return Err(invalid(format!("node type {name}: negative resource amount")));
            }
        }

        let a = &self.autoscaler;
        if a.max_launch_batch == 0 {
            return Err(invalid("max_launch_batch must be at least 1"));
        }
        if a.max_concurrent_launches == 0 {
            return Err(invalid("max_concurrent_launches must be at least 1"));
        }
        if !(a.target_utilization_fraction > 0.0 && a.target_utilization_fraction <= 1.0) {
            return Err(invalid("target_utilization_fraction must be in (0, 1]"));
        }
        if a.failure_window_ticks == 0 {
            return Err(invalid("failure_window_ticks must be at least 1"));
        }
        if a.update_interval_s == 0 || a.tick_deadline_s == 0 {
            return Err(invalid("update_interval_s and tick_deadline_s must be at least 1"));
        }

        if let ProviderConfig::Static { hosts, .. } = &self.provider {
            for node_type in hosts.keys() {
                if !self.node_types.contains_key(node_type) {
                    return Err(invalid(format!(
                        "static provider lists hosts for unknown node type {node_type:?}"
                    )));
                }
            }
            for (name, nt) in &self.node_types {
                let available = hosts.get(name).map_or(0, Vec::len);
                if (nt.max_workers as usize) > available {
                    return Err(invalid(format!(
                        "node type {name}: max_workers ({}) exceeds its {available} static hosts",
                        nt.max_workers
                    )));
                }
            }
        }

        for name in self.node_types.keys() {
            for (remote, local) in self.file_mounts_for(name) {
                if !local.exists() {
                    return Err(invalid(format!(
                        "file mount {remote:?}: source {} does not exist",
                        local.display()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn node_type(&self, name: &str) -> Option<&NodeTypeConfig> {
        self.node_types.get(name)
    }

    pub fn is_head(&self, node_type: &str) -> bool {
        self.head_node_type == node_type
    }

    /// Global mounts overlaid with the node type's own mounts.
    pub fn file_mounts_for(&self, node_type: &str) -> BTreeMap<String, PathBuf> {
        let mut mounts = self.file_mounts.clone();
        if let Some(nt) = self.node_types.get(node_type) {
            mounts.extend(nt.file_mounts.clone());
        }
        mounts
    }

    /// Node type names with the head type first.
    pub fn node_type_order(&self) -> Vec<String> {
        let mut names = vec![self.head_node_type.clone()];
        names.extend(
            self.node_types
                .keys()
                .filter(|n| **n != self.head_node_type)
                .cloned(),
        );
        names
    }

    fn resolve_mounts(&mut self, base: &Path) {
        let resolve = |mounts: &mut BTreeMap<String, PathBuf>| {
            for local in mounts.values_mut() {
                if local.is_relative() {
                    *local = base.join(&*local);
                }
            }
        };
        resolve(&mut self.file_mounts);
        for nt in self.node_types.values_mut() {
            resolve(&mut nt.file_mounts);
        }
    }
}

// ── Internal helpers ────────────────────────────────────────────

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn override_u32<F>(lookup: &F, var: &str, slot: &mut u32) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(var) {
        *slot = value.trim().parse().map_err(|_| ConfigError::Override {
            var: var.to_string(),
            value,
        })?;
        debug!(var, value = *slot, "autoscaler override applied");
    }
    Ok(())
}

fn override_u64<F>(lookup: &F, var: &str, slot: &mut u64) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(var) {
        *slot = value.trim().parse().map_err(|_| ConfigError::Override {
            var: var.to_string(),
            value,
        })?;
        debug!(var, value = *slot, "autoscaler override applied");
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}
