//! Core domain types shared by every fleetscale crate.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Slack used when comparing fractional resource amounts.
const EPSILON: f64 = 1e-9;

/// Opaque, backend-specific node identifier.
///
/// Unique per live node. Backends must not hand out an id again while
/// any stale reference to the old node can still exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Ordered key/value tags attached to a node by its provider.
pub type NodeTags = BTreeMap<String, String>;

/// A resource vector, e.g. `{CPU: 4, GPU: 1}`.
///
/// Missing keys read as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(BTreeMap<String, f64>);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, amount: f64) -> Self {
        self.0.insert(name.to_string(), amount);
        self
    }

    pub fn get(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, name: &str, amount: f64) {
        self.0.insert(name.to_string(), amount);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every amount is zero (or the vector is empty).
    pub fn is_zero(&self) -> bool {
        self.0.values().all(|v| v.abs() < EPSILON)
    }

    /// True when `demand` fits inside `self` for every resource it names.
    pub fn fits(&self, demand: &Resources) -> bool {
        demand
            .iter()
            .all(|(name, amount)| amount <= self.get(name) + EPSILON)
    }

    /// Subtract `other` in place. Callers check `fits` first.
    pub fn subtract(&mut self, other: &Resources) {
        for (name, amount) in other.iter() {
            let entry = self.0.entry(name.to_string()).or_insert(0.0);
            *entry -= amount;
        }
    }

    /// Add `other` in place.
    pub fn add(&mut self, other: &Resources) {
        for (name, amount) in other.iter() {
            *self.0.entry(name.to_string()).or_insert(0.0) += amount;
        }
    }

    /// Sum of `a` and `b`.
    pub fn sum(a: &Resources, b: &Resources) -> Resources {
        let mut out = a.clone();
        out.add(b);
        out
    }

    /// Largest used/total fraction across resources with a non-zero total.
    ///
    /// `self` is the used vector.
    pub fn max_fraction_of(&self, total: &Resources) -> f64 {
        total
            .iter()
            .filter(|(_, t)| *t > EPSILON)
            .map(|(name, t)| (self.get(name) / t).clamp(0.0, 1.0))
            .fold(0.0, f64::max)
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Resources {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Unsatisfied work supplied by the external scheduler: a multiset of
/// resource bundles. Consumed read-only.
pub type ResourceDemand = Vec<Resources>;

/// Hex-encoded configuration fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigHash(String);

impl ConfigHash {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_and_subtract() {
        let mut node = Resources::new().with("CPU", 4.0).with("GPU", 1.0);
        let bundle = Resources::new().with("CPU", 3.0);

        assert!(node.fits(&bundle));
        node.subtract(&bundle);
        assert_eq!(node.get("CPU"), 1.0);
        assert!(!node.fits(&bundle));
        assert!(node.fits(&Resources::new().with("GPU", 1.0)));
    }

    #[test]
    fn missing_resource_never_fits() {
        let node = Resources::new().with("CPU", 8.0);
        assert!(!node.fits(&Resources::new().with("GPU", 0.5)));
    }

    #[test]
    fn max_fraction_ignores_zero_totals() {
        let total = Resources::new().with("CPU", 4.0).with("GPU", 0.0);
        let used = Resources::new().with("CPU", 1.0).with("GPU", 1.0);
        assert!((used.max_fraction_of(&total) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn resources_serialize_as_plain_map() {
        let r = Resources::new().with("CPU", 2.0);
        assert_eq!(serde_json::to_string(&r).unwrap(), r#"{"CPU":2.0}"#);
        let back: Resources = serde_json::from_str(r#"{"CPU":2}"#).unwrap();
        assert_eq!(back.get("CPU"), 2.0);
    }
}
