//! Demand → per-node-type target counts.
//!
//! Demand bundles are first packed onto the capacity the cluster
//! already has (live nodes, plus nodes `min_workers` will bring up).
//! Whatever does not fit is covered by adding the node type that would
//! be best utilized by the remaining bundles, one node at a time,
//! within each type's `max_workers`.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use fleet_core::{NodeTypeConfig, Resources};

/// One live node as seen by the planner.
#[derive(Debug, Clone)]
pub struct NodeCapacity {
    pub node_type: String,
    /// Capacity demand can still be packed onto.
    pub available: Resources,
    /// Largest used/total fraction, if the node has reported load.
    pub utilization: Option<f64>,
    /// Reported no usage for longer than the idle timeout.
    pub idle: bool,
}

/// First-fit packing of `demands` onto `capacities`.
///
/// Returns the bundles that did not fit and, per capacity, whether it
/// absorbed at least one bundle.
pub fn bin_pack(capacities: &[Resources], demands: &[Resources]) -> (Vec<Resources>, Vec<bool>) {
    let mut remaining = capacities.to_vec();
    let mut used = vec![false; capacities.len()];
    let mut residual = Vec::new();

    for bundle in demands {
        match remaining.iter().position(|node| node.fits(bundle)) {
            Some(i) => {
                remaining[i].subtract(bundle);
                used[i] = true;
            }
            None => residual.push(bundle.clone()),
        }
    }
    (residual, used)
}

/// How well a fresh node of capacity `node` would be used by `demands`.
///
/// `(min, mean)` over resources of `amount · util³`, so a type that
/// fills every resource beats one that fills a single resource, and
/// a snug fit beats a huge node. `None` if no bundle fits at all.
pub fn utilization_score(node: &Resources, demands: &[Resources]) -> Option<(f64, f64)> {
    let mut remaining = node.clone();
    let mut fitted = 0usize;
    for bundle in demands {
        if remaining.fits(bundle) {
            remaining.subtract(bundle);
            fitted += 1;
        }
    }
    if fitted == 0 {
        return None;
    }

    let scores: Vec<f64> = node
        .iter()
        .filter(|(_, amount)| *amount > 0.0)
        .map(|(name, amount)| {
            let util = (amount - remaining.get(name)) / amount;
            amount * util.powi(3)
        })
        .collect();
    if scores.is_empty() {
        return Some((0.0, 0.0));
    }
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    Some((min, mean))
}

/// Nodes to add, per type, so that `demands` fits. `existing` counts
/// nodes already live or planned; no type is pushed past its
/// `max_workers`.
pub fn get_instances_for(
    node_types: &BTreeMap<String, NodeTypeConfig>,
    existing: &BTreeMap<String, u32>,
    demands: &[Resources],
) -> BTreeMap<String, u32> {
    let mut added: BTreeMap<String, u32> = BTreeMap::new();

    let mut residual: Vec<Resources> = Vec::with_capacity(demands.len());
    for bundle in demands {
        if node_types.values().any(|nt| nt.resources.fits(bundle)) {
            residual.push(bundle.clone());
        } else {
            warn!(?bundle, "demand bundle fits no node type, skipping");
        }
    }

    while !residual.is_empty() {
        let mut best: Option<((f64, f64), &str)> = None;
        for (name, nt) in node_types {
            let count = existing.get(name).copied().unwrap_or(0)
                + added.get(name).copied().unwrap_or(0);
            if count >= nt.max_workers {
                continue;
            }
            let Some(score) = utilization_score(&nt.resources, &residual) else {
                continue;
            };
            if best.is_none_or(|(top, _)| score > top) {
                best = Some((score, name));
            }
        }

        let Some((_, name)) = best else {
            debug!(
                unfulfilled = residual.len(),
                "demand exceeds max_workers of every fitting node type"
            );
            break;
        };
        *added.entry(name.to_string()).or_insert(0) += 1;

        let capacity = std::slice::from_ref(&node_types[name].resources);
        let (rest, _) = bin_pack(capacity, &residual);
        if rest.len() == residual.len() {
            break;
        }
        residual = rest;
    }
    added
}

/// Target node count for every configured type.
///
/// A node counts toward its type's target if it is not idle, or if it
/// absorbed demand in this round of packing. The target is at least
/// `ceil(nodes_used / target_fraction)` over the type's reporting
/// nodes, and always within `[min_workers, max_workers]`.
pub fn compute_targets(
    node_types: &BTreeMap<String, NodeTypeConfig>,
    nodes: &[NodeCapacity],
    demand: &[Resources],
    target_fraction: f64,
) -> BTreeMap<String, u32> {
    let mut counts: BTreeMap<String, u32> = BTreeMap::new();
    for node in nodes {
        if node_types.contains_key(&node.node_type) {
            *counts.entry(node.node_type.clone()).or_insert(0) += 1;
        }
    }

    // Busy nodes first, so demand lands on them and idle ones can go.
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by_key(|&i| nodes[i].idle);
    let mut capacities: Vec<Resources> = order.iter().map(|&i| nodes[i].available.clone()).collect();

    let mut planned: BTreeMap<String, u32> = BTreeMap::new();
    for (name, nt) in node_types {
        let missing = nt.min_workers.saturating_sub(counts.get(name).copied().unwrap_or(0));
        if missing > 0 {
            planned.insert(name.clone(), missing);
            capacities.extend(std::iter::repeat_n(nt.resources.clone(), missing as usize));
        }
    }

    let bundles: Vec<Resources> = demand.iter().filter(|b| !b.is_zero()).cloned().collect();
    let (residual, packed) = bin_pack(&capacities, &bundles);
    let mut absorbed = vec![false; nodes.len()];
    for (slot, &i) in order.iter().enumerate() {
        absorbed[i] = packed[slot];
    }

    let mut known = counts.clone();
    for (name, n) in &planned {
        *known.entry(name.clone()).or_insert(0) += n;
    }
    let additions = get_instances_for(node_types, &known, &residual);

    let mut targets = BTreeMap::new();
    for (name, nt) in node_types {
        let mut needed = 0u32;
        let mut nodes_used = 0.0;
        for (i, node) in nodes.iter().enumerate() {
            if node.node_type != *name {
                continue;
            }
            if !node.idle || absorbed[i] {
                needed += 1;
            }
            nodes_used += node.utilization.unwrap_or(0.0);
        }
        let ideal = (nodes_used / target_fraction).ceil() as u32;
        let wanted = needed
            + planned.get(name).copied().unwrap_or(0)
            + additions.get(name).copied().unwrap_or(0);

        let target = wanted.max(ideal).max(nt.min_workers).min(nt.max_workers);
        targets.insert(name.clone(), target);
    }
    targets
}
