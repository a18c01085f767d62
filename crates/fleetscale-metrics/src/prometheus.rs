//! Prometheus text exposition of autoscaler state.

use std::fmt::Write;

use fleet_core::AutoscalerStatus;

use crate::load::ResourceUsage;

/// Render the latest status and load aggregate as Prometheus text.
///
/// Node counts and targets carry a `node_type` label; resource
/// gauges carry a `resource` label.
pub fn render_prometheus(status: &AutoscalerStatus, usage: &ResourceUsage) -> String {
    let mut out = String::new();
    let cluster = escape(&status.cluster_name);

    header(&mut out, "fleetscale_nodes", "Live nodes by node type.", "gauge");
    for (node_type, count) in &status.nodes_by_type {
        let _ = writeln!(
            out,
            "fleetscale_nodes{{cluster=\"{cluster}\",node_type=\"{}\"}} {count}",
            escape(node_type)
        );
    }

    header(
        &mut out,
        "fleetscale_target_nodes",
        "Target node count computed by the last tick.",
        "gauge",
    );
    if let Some(tick) = &status.last_tick {
        for (node_type, target) in &tick.targets {
            let _ = writeln!(
                out,
                "fleetscale_target_nodes{{cluster=\"{cluster}\",node_type=\"{}\"}} {target}",
                escape(node_type)
            );
        }
    }

    counter(&mut out, &cluster, "fleetscale_ticks_total", "Control loop ticks run.", status.ticks);
    counter(
        &mut out,
        &cluster,
        "fleetscale_nodes_launched_total",
        "Nodes requested from the provider.",
        status.launched_total,
    );
    counter(
        &mut out,
        &cluster,
        "fleetscale_nodes_terminated_total",
        "Nodes terminated by the autoscaler.",
        status.terminated_total,
    );
    counter(
        &mut out,
        &cluster,
        "fleetscale_update_failures_total",
        "Node updates that failed or timed out.",
        status.update_failures_total,
    );
    counter(
        &mut out,
        &cluster,
        "fleetscale_provider_failures_total",
        "Launch and terminate failures counted by the breaker.",
        status.breaker.total_failures,
    );

    gauge(
        &mut out,
        &cluster,
        "fleetscale_updaters_in_flight",
        "Node updaters currently running.",
        status.updaters_in_flight as f64,
    );
    gauge(
        &mut out,
        &cluster,
        "fleetscale_breaker_tripped",
        "1 when launches are halted by the failure breaker.",
        if status.breaker.tripped { 1.0 } else { 0.0 },
    );
    gauge(
        &mut out,
        &cluster,
        "fleetscale_breaker_failures_in_window",
        "Provider failures inside the breaker window.",
        f64::from(status.breaker.failures_in_window),
    );
    gauge(
        &mut out,
        &cluster,
        "fleetscale_utilization_fraction",
        "Mean node utilization over nodes with a fresh heartbeat.",
        usage.utilization_fraction,
    );

    header(&mut out, "fleetscale_resource_used", "Resources in use.", "gauge");
    for (resource, amount) in &usage.used_by_resource {
        let _ = writeln!(
            out,
            "fleetscale_resource_used{{cluster=\"{cluster}\",resource=\"{}\"}} {amount:.2}",
            escape(resource)
        );
    }
    header(
        &mut out,
        "fleetscale_resource_available",
        "Resources free on live nodes.",
        "gauge",
    );
    for (resource, amount) in &usage.available_by_resource {
        let _ = writeln!(
            out,
            "fleetscale_resource_available{{cluster=\"{cluster}\",resource=\"{}\"}} {amount:.2}",
            escape(resource)
        );
    }

    out
}

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn counter(out: &mut String, cluster: &str, name: &str, help: &str, value: u64) {
    header(out, name, help, "counter");
    let _ = writeln!(out, "{name}{{cluster=\"{cluster}\"}} {value}");
}

fn gauge(out: &mut String, cluster: &str, name: &str, help: &str, value: f64) {
    header(out, name, help, "gauge");
    let _ = writeln!(out, "{name}{{cluster=\"{cluster}\"}} {value:.4}");
}

/// Escape a label value.
fn escape(s: &str) -> String {
    s.replace('\\', r"\\").replace('"', "\\\"").replace('\n', r"\n")
}
