//! On-prem backend over a fixed pool of hosts.
//!
//! Each configured address belongs to one node type. `create_node`
//! claims free hosts of the requested type and `terminate_node`
//! releases them. Claims are persisted to a JSON state file so a
//! restarted daemon sees the same cluster.
//!
//! Node ids are `address#generation`. The generation is bumped on
//! every claim, so a released and re-claimed host never answers to
//! an id that was handed out before.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fleet_core::{LaunchConfig, NodeId, NodeTags};

use crate::error::{ProviderError, ProviderResult};
use crate::provider::NodeProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum HostState {
    Free,
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HostRecord {
    node_type: String,
    state: HostState,
    generation: u64,
    #[serde(default)]
    tags: NodeTags,
}

impl HostRecord {
    fn node_id(&self, address: &str) -> NodeId {
        NodeId::new(format!("{address}#{}", self.generation))
    }
}

pub struct StaticProvider {
    /// address → record.
    hosts: Mutex<BTreeMap<String, HostRecord>>,
    external_ips: BTreeMap<String, String>,
    state_path: Option<PathBuf>,
}

impl StaticProvider {
    /// Build from `node_type → [address]`, merging any state saved at
    /// `state_path`. Saved hosts that are no longer configured, or
    /// whose node type changed, are dropped.
    pub fn open(
        hosts: &BTreeMap<String, Vec<String>>,
        external_ips: BTreeMap<String, String>,
        state_path: Option<PathBuf>,
    ) -> ProviderResult<Self> {
        let mut saved = match &state_path {
            Some(path) if path.exists() => load_state(path)?,
            _ => BTreeMap::new(),
        };

        let mut records = BTreeMap::new();
        for (node_type, addresses) in hosts {
            for address in addresses {
                let record = match saved.remove(address) {
                    Some(r) if r.node_type == *node_type => r,
                    _ => HostRecord {
                        node_type: node_type.clone(),
                        state: HostState::Free,
                        generation: 0,
                        tags: NodeTags::new(),
                    },
                };
                records.insert(address.clone(), record);
            }
        }
        for address in saved.keys() {
            info!(%address, "dropping host no longer in config");
        }

        let claimed = records
            .values()
            .filter(|r| r.state == HostState::Running)
            .count();
        info!(hosts = records.len(), claimed, "static provider loaded");

        if let Some(path) = &state_path {
            save_state(path, &records)?;
        }
        Ok(Self {
            hosts: Mutex::new(records),
            external_ips,
            state_path,
        })
    }

    async fn persist(&self, hosts: &BTreeMap<String, HostRecord>) -> ProviderResult<()> {
        match &self.state_path {
            Some(path) => save_state(path, hosts),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl NodeProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn list_nodes(&self, tag_filter: &NodeTags) -> ProviderResult<Vec<NodeId>> {
        let hosts = self.hosts.lock().await;
        Ok(hosts
            .iter()
            .filter(|(_, r)| r.state == HostState::Running)
            .filter(|(_, r)| tag_filter.iter().all(|(k, v)| r.tags.get(k) == Some(v)))
            .map(|(address, r)| r.node_id(address))
            .collect())
    }

    async fn is_running(&self, node_id: &NodeId) -> ProviderResult<bool> {
        let hosts = self.hosts.lock().await;
        let (_, record) = lookup(&hosts, node_id)?;
        Ok(is_live(record, node_id))
    }

    async fn is_terminated(&self, node_id: &NodeId) -> ProviderResult<bool> {
        let hosts = self.hosts.lock().await;
        let (_, record) = lookup(&hosts, node_id)?;
        Ok(!is_live(record, node_id))
    }

    async fn node_tags(&self, node_id: &NodeId) -> ProviderResult<NodeTags> {
        let hosts = self.hosts.lock().await;
        let (_, record) = live(&hosts, node_id)?;
        Ok(record.tags.clone())
    }

    async fn set_node_tags(&self, node_id: &NodeId, tags: &NodeTags) -> ProviderResult<()> {
        let mut hosts = self.hosts.lock().await;
        let (address, _) = live(&hosts, node_id)?;
        let address = address.to_string();
        if let Some(record) = hosts.get_mut(&address) {
            record
                .tags
                .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.persist(&hosts).await
    }

    async fn internal_ip(&self, node_id: &NodeId) -> ProviderResult<String> {
        let hosts = self.hosts.lock().await;
        let (address, _) = lookup(&hosts, node_id)?;
        Ok(address.to_string())
    }

    async fn external_ip(&self, node_id: &NodeId) -> ProviderResult<String> {
        let hosts = self.hosts.lock().await;
        let (address, _) = lookup(&hosts, node_id)?;
        self.external_ips
            .get(address)
            .cloned()
            .ok_or(ProviderError::NotSupported("external_ip"))
    }

    async fn create_node(
        &self,
        template: &LaunchConfig,
        tags: &NodeTags,
        count: u32,
    ) -> ProviderResult<()> {
        let mut hosts = self.hosts.lock().await;
        let free: Vec<String> = hosts
            .iter()
            .filter(|(_, r)| r.node_type == template.node_type && r.state == HostState::Free)
            .map(|(address, _)| address.clone())
            .take(count as usize)
            .collect();

        if free.len() < count as usize {
            warn!(
                node_type = %template.node_type,
                requested = count,
                available = free.len(),
                "host pool exhausted"
            );
            return Err(ProviderError::Permanent(format!(
                "{} free hosts for node type {}, {count} requested",
                free.len(),
                template.node_type
            )));
        }

        for address in &free {
            if let Some(record) = hosts.get_mut(address) {
                record.generation += 1;
                record.state = HostState::Running;
                record.tags = tags.clone();
                debug!(node_id = %record.node_id(address), "claimed host");
            }
        }
        self.persist(&hosts).await
    }

    async fn terminate_node(&self, node_id: &NodeId) -> ProviderResult<()> {
        let mut hosts = self.hosts.lock().await;
        let (address, record) = lookup(&hosts, node_id)?;
        if !is_live(record, node_id) {
            return Ok(());
        }
        let address = address.to_string();
        if let Some(record) = hosts.get_mut(&address) {
            record.state = HostState::Free;
            record.tags.clear();
        }
        debug!(%node_id, "released host");
        self.persist(&hosts).await
    }
}

// ── Internal helpers ────────────────────────────────────────────

fn split_id(node_id: &NodeId) -> Option<(&str, u64)> {
    let (address, generation) = node_id.as_str().rsplit_once('#')?;
    Some((address, generation.parse().ok()?))
}

fn lookup<'a>(
    hosts: &'a BTreeMap<String, HostRecord>,
    node_id: &NodeId,
) -> ProviderResult<(&'a str, &'a HostRecord)> {
    let (address, _) = split_id(node_id).ok_or_else(|| ProviderError::NotFound(node_id.clone()))?;
    hosts
        .get_key_value(address)
        .map(|(a, r)| (a.as_str(), r))
        .ok_or_else(|| ProviderError::NotFound(node_id.clone()))
}

fn live<'a>(
    hosts: &'a BTreeMap<String, HostRecord>,
    node_id: &NodeId,
) -> ProviderResult<(&'a str, &'a HostRecord)> {
    let (address, record) = lookup(hosts, node_id)?;
    if is_live(record, node_id) {
        Ok((address, record))
    } else {
        Err(ProviderError::NotFound(node_id.clone()))
    }
}

fn is_live(record: &HostRecord, node_id: &NodeId) -> bool {
    record.state == HostState::Running
        && split_id(node_id).is_some_and(|(_, generation)| generation == record.generation)
}

fn load_state(path: &Path) -> ProviderResult<BTreeMap<String, HostRecord>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ProviderError::Permanent(format!("failed to read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        ProviderError::Permanent(format!("corrupt state file {}: {e}", path.display()))
    })
}

/// Write to a sibling temp file, then rename over the old state.
fn save_state(path: &Path, hosts: &BTreeMap<String, HostRecord>) -> ProviderResult<()> {
    let json = serde_json::to_vec_pretty(hosts)
        .map_err(|e| ProviderError::Permanent(format!("failed to encode state: {e}")))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|e| ProviderError::Transient(format!("failed to write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{AuthConfig, Resources};
    use fleet_core::tags::TAG_NODE_TYPE;

    fn pool() -> BTreeMap<String, Vec<String>> {
        [
            ("head".to_string(), vec!["10.0.0.1".to_string()]),
            (
                "worker".to_string(),
                vec!["10.0.0.2".to_string(), "10.0.0.3".to_string()],
            ),
        ]
        .into_iter()
        .collect()
    }

    fn template(node_type: &str) -> LaunchConfig {
        LaunchConfig {
            node_type: node_type.to_string(),
            node_config: Default::default(),
            resources: Resources::new().with("CPU", 2.0),
            auth: AuthConfig::default(),
        }
    }

    fn tags(node_type: &str) -> NodeTags {
        [(TAG_NODE_TYPE.to_string(), node_type.to_string())]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn claims_hosts_of_requested_type() {
        let provider = StaticProvider::open(&pool(), BTreeMap::new(), None).unwrap();
        provider
            .create_node(&template("worker"), &tags("worker"), 2)
            .await
            .unwrap();

        let nodes = provider.list_nodes(&tags("worker")).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(provider.list_nodes(&tags("head")).await.unwrap().is_empty());
        for id in &nodes {
            assert!(provider.is_running(id).await.unwrap());
            assert!(!provider.is_terminated(id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn exhausted_pool_is_permanent_error() {
        let provider = StaticProvider::open(&pool(), BTreeMap::new(), None).unwrap();
        provider
            .create_node(&template("head"), &tags("head"), 1)
            .await
            .unwrap();
        let err = provider
            .create_node(&template("head"), &tags("head"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
    }

    #[tokio::test]
    async fn short_pool_claims_nothing() {
        let provider = StaticProvider::open(&pool(), BTreeMap::new(), None).unwrap();
        let err = provider
            .create_node(&template("worker"), &tags("worker"), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Permanent(_)));
        assert!(provider.list_nodes(&tags("worker")).await.unwrap().is_empty());

        // Both hosts are still free for a request that fits.
        provider
            .create_node(&template("worker"), &tags("worker"), 2)
            .await
            .unwrap();
        assert_eq!(provider.list_nodes(&tags("worker")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_ids_are_not_reused() {
        let provider = StaticProvider::open(&pool(), BTreeMap::new(), None).unwrap();
        provider
            .create_node(&template("head"), &tags("head"), 1)
            .await
            .unwrap();
        let old = provider.list_nodes(&tags("head")).await.unwrap().remove(0);

        provider.terminate_node(&old).await.unwrap();
        provider.terminate_node(&old).await.unwrap();
        assert!(provider.is_terminated(&old).await.unwrap());

        provider
            .create_node(&template("head"), &tags("head"), 1)
            .await
            .unwrap();
        let new = provider.list_nodes(&tags("head")).await.unwrap().remove(0);
        assert_ne!(old, new);
        assert!(provider.is_terminated(&old).await.unwrap());
        assert!(provider.is_running(&new).await.unwrap());
        assert_eq!(provider.internal_ip(&new).await.unwrap(), "10.0.0.1");
    }

    #[tokio::test]
    async fn tags_merge_and_external_ip_is_optional() {
        let external: BTreeMap<String, String> =
            [("10.0.0.1".to_string(), "203.0.113.9".to_string())].into_iter().collect();
        let provider = StaticProvider::open(&pool(), external, None).unwrap();
        provider
            .create_node(&template("head"), &tags("head"), 1)
            .await
            .unwrap();
        provider
            .create_node(&template("worker"), &tags("worker"), 1)
            .await
            .unwrap();
        let head = provider.list_nodes(&tags("head")).await.unwrap().remove(0);
        let worker = provider.list_nodes(&tags("worker")).await.unwrap().remove(0);

        let extra: NodeTags = [("k".to_string(), "v".to_string())].into_iter().collect();
        provider.set_node_tags(&head, &extra).await.unwrap();
        let got = provider.node_tags(&head).await.unwrap();
        assert_eq!(got["k"], "v");
        assert_eq!(got[TAG_NODE_TYPE], "head");

        assert_eq!(provider.external_ip(&head).await.unwrap(), "203.0.113.9");
        assert!(matches!(
            provider.external_ip(&worker).await,
            Err(ProviderError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.state.json");

        let provider = StaticProvider::open(&pool(), BTreeMap::new(), Some(path.clone())).unwrap();
        provider
            .create_node(&template("worker"), &tags("worker"), 1)
            .await
            .unwrap();
        let before = provider.list_nodes(&tags("worker")).await.unwrap();
        drop(provider);

        let reopened = StaticProvider::open(&pool(), BTreeMap::new(), Some(path)).unwrap();
        assert_eq!(reopened.list_nodes(&tags("worker")).await.unwrap(), before);
    }

    #[tokio::test]
    async fn unknown_address_is_not_found() {
        let provider = StaticProvider::open(&pool(), BTreeMap::new(), None).unwrap();
        let ghost = NodeId::from("192.168.9.9#1");
        assert!(matches!(
            provider.is_running(&ghost).await,
            Err(ProviderError::NotFound(_))
        ));
    }
}
