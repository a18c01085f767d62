//! Configuration fingerprints used as a drift oracle.
//!
//! `launch_hash` covers everything that decides how a node is created;
//! a mismatch means the node must be replaced. `files_hash` covers
//! what gets applied to a running node (mount contents and init
//! commands); a mismatch means the node must be updated.
//!
//! Both are SHA-256 over a canonical JSON encoding (object keys
//! sorted at every depth), so they are stable across processes and
//! machines. They are not a security primitive.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::bootstrap;
use crate::config::{AuthConfig, ClusterConfig};
use crate::error::{HashError, HashResult};
use crate::types::{ConfigHash, Resources};

/// Everything that determines how a node of one type is created.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchConfig {
    pub node_type: String,
    pub node_config: Map<String, Value>,
    pub resources: Resources,
    pub auth: AuthConfig,
}

impl LaunchConfig {
    pub fn for_node_type(config: &ClusterConfig, node_type: &str) -> Option<Self> {
        let nt = config.node_type(node_type)?;
        Some(Self {
            node_type: node_type.to_string(),
            node_config: nt.node_config.clone(),
            resources: nt.resources.clone(),
            auth: config.auth.clone(),
        })
    }
}

/// Both fingerprints for one node type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTypeHashes {
    pub launch: ConfigHash,
    pub files: ConfigHash,
}

pub fn launch_hash(launch: &LaunchConfig) -> HashResult<ConfigHash> {
    let value = canonicalize(serde_json::to_value(launch)?);
    let digest = Sha256::digest(serde_json::to_vec(&value)?);
    Ok(ConfigHash::from_hex(hex::encode(digest)))
}

/// Fingerprint of `file_mounts` (remote → local) and `init_commands`.
///
/// Sensitive to every byte of every mounted file. Directories are
/// walked in name order and each entry's relative path is hashed
/// alongside its contents; symlinks contribute their target. Local
/// paths are never hashed, only the remote destinations, so the same
/// content hashes the same wherever the config was loaded from.
pub fn files_hash(
    file_mounts: &BTreeMap<String, PathBuf>,
    init_commands: &[String],
) -> HashResult<ConfigHash> {
    let mut hasher = Sha256::new();

    let mut header = Map::new();
    let remotes: Vec<&String> = file_mounts.keys().collect();
    header.insert("file_mounts".into(), serde_json::to_value(remotes)?);
    header.insert("init_commands".into(), serde_json::to_value(init_commands)?);
    update_framed(
        &mut hasher,
        &serde_json::to_vec(&canonicalize(Value::Object(header)))?,
    );

    for (remote, local) in file_mounts {
        debug!(%remote, local = %local.display(), "hashing file mount");
        update_framed(&mut hasher, remote.as_bytes());
        hash_path(&mut hasher, local)?;
    }

    Ok(ConfigHash::from_hex(hex::encode(hasher.finalize())))
}

/// Launch and files hashes for every node type in `config`.
pub fn hashes_for(config: &ClusterConfig) -> HashResult<BTreeMap<String, NodeTypeHashes>> {
    let mut out = BTreeMap::new();
    for name in config.node_types.keys() {
        let Some(launch) = LaunchConfig::for_node_type(config, name) else {
            continue;
        };
        let hashes = NodeTypeHashes {
            launch: launch_hash(&launch)?,
            files: files_hash(
                &config.file_mounts_for(name),
                &bootstrap::recipe(config, name),
            )?,
        };
        out.insert(name.clone(), hashes);
    }
    Ok(out)
}

// ── Internal helpers ────────────────────────────────────────────

/// Rebuild every object with keys inserted in sorted order, so the
/// encoding is the same whether or not serde_json preserves order.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Length-prefix each chunk so adjacent fields cannot run together.
fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn hash_path(hasher: &mut Sha256, path: &Path) -> HashResult<()> {
    if path.is_dir() {
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|source| HashError::Walk {
                path: path.to_path_buf(),
                source,
            })?;
            let rel = entry.path().strip_prefix(path).unwrap_or(entry.path());
            let rel: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            update_framed(hasher, rel.join("/").as_bytes());
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                let target = std::fs::read_link(entry.path()).map_err(|source| HashError::Io {
                    path: entry.path().to_path_buf(),
                    source,
                })?;
                update_framed(hasher, b"->");
                update_framed(hasher, target.to_string_lossy().as_bytes());
            } else if file_type.is_file() {
                update_framed(hasher, &read(entry.path())?);
            }
        }
    } else {
        update_framed(hasher, &read(path)?);
    }
    Ok(())
}

fn read(path: &Path) -> HashResult<Vec<u8>> {
    std::fs::read(path).map_err(|source| HashError::Io {
        path: path.to_path_buf(),
        source,
    })
}
