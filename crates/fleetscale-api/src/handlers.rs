//! REST API handlers.
//!
//! Feeds write into the load store and the demand channel; reads come
//! from the status the control loop publishes after every tick.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::{debug, info, warn};

use fleet_core::{ClusterConfig, NodeId, Resources, epoch_secs};
use fleetscale_autoscale::ControlCommand;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Amounts must be finite and non-negative.
fn check_resources(what: &str, resources: &Resources) -> Result<(), String> {
    match resources
        .iter()
        .find(|(_, amount)| !amount.is_finite() || *amount < 0.0)
    {
        Some((name, amount)) => Err(format!("{what}: invalid amount {amount} for {name}")),
        None => Ok(()),
    }
}

// ── Feeds ──────────────────────────────────────────────────────

/// Heartbeat request body.
#[derive(Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: NodeId,
    #[serde(default)]
    pub used: Resources,
    #[serde(default)]
    pub available: Resources,
}

/// POST /api/v1/heartbeats
pub async fn record_heartbeat(
    State(state): State<ApiState>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    if req.node_id.as_str().is_empty() {
        return error_response("node_id must not be empty", StatusCode::BAD_REQUEST).into_response();
    }
    let checked = check_resources("used", &req.used)
        .and_then(|()| check_resources("available", &req.available));
    if let Err(msg) = checked {
        return error_response(&msg, StatusCode::BAD_REQUEST).into_response();
    }

    let now = epoch_secs();
    let accepted = state
        .load_metrics
        .write()
        .await
        .record_heartbeat(&req.node_id, req.used, req.available, now);
    if !accepted {
        return error_response("heartbeat older than the last one", StatusCode::CONFLICT)
            .into_response();
    }
    debug!(node_id = %req.node_id, "heartbeat recorded");
    ApiResponse::ok(serde_json::json!({ "node_id": req.node_id, "at": now })).into_response()
}

/// Demand request body.
#[derive(Deserialize)]
pub struct DemandRequest {
    pub bundles: Vec<Resources>,
}

/// POST /api/v1/demand
///
/// Latest wins: the body replaces whatever demand was pending.
pub async fn set_demand(
    State(state): State<ApiState>,
    Json(req): Json<DemandRequest>,
) -> impl IntoResponse {
    for (i, bundle) in req.bundles.iter().enumerate() {
        if let Err(msg) = check_resources(&format!("bundle {i}"), bundle) {
            return error_response(&msg, StatusCode::BAD_REQUEST).into_response();
        }
    }
    let count = req.bundles.len();
    state.demand.send_replace(req.bundles);
    debug!(bundles = count, "demand replaced");
    ApiResponse::ok(serde_json::json!({ "bundles": count })).into_response()
}

/// GET /api/v1/demand
pub async fn get_demand(State(state): State<ApiState>) -> impl IntoResponse {
    let demand = state.demand.borrow().clone();
    ApiResponse::ok(demand)
}

// ── Status ─────────────────────────────────────────────────────

/// GET /api/v1/status
pub async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    ApiResponse::ok(status)
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    let nodes = state.status.borrow().nodes.clone();
    ApiResponse::ok(nodes)
}

/// GET /api/v1/load
pub async fn get_load(State(state): State<ApiState>) -> impl IntoResponse {
    let usage = state.load_metrics.read().await.get_resource_usage(epoch_secs());
    ApiResponse::ok(usage)
}

// ── Operator controls ──────────────────────────────────────────

/// POST /api/v1/breaker/reset
pub async fn reset_breaker(State(state): State<ApiState>) -> impl IntoResponse {
    match state.control.send(ControlCommand::ResetBreaker).await {
        Ok(()) => {
            info!("breaker reset requested");
            (
                StatusCode::ACCEPTED,
                ApiResponse::ok(serde_json::json!({ "status": "queued" })),
            )
                .into_response()
        }
        Err(_) => error_response("control loop is not running", StatusCode::SERVICE_UNAVAILABLE)
            .into_response(),
    }
}

/// POST /api/v1/reload
pub async fn reload_config(State(state): State<ApiState>) -> impl IntoResponse {
    let Some(path) = state.config_path.clone() else {
        return error_response("daemon was started without a config file", StatusCode::BAD_REQUEST)
            .into_response();
    };

    let config = match ClusterConfig::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "reload rejected");
            return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response();
        }
    };

    let current = state.status.borrow().cluster_name.clone();
    if !current.is_empty() && current != config.cluster_name {
        return error_response(
            &format!(
                "cluster_name cannot change on reload ({current} -> {})",
                config.cluster_name
            ),
            StatusCode::CONFLICT,
        )
        .into_response();
    }

    let cluster = config.cluster_name.clone();
    match state
        .control
        .send(ControlCommand::Reconfigure(Box::new(config)))
        .await
    {
        Ok(()) => {
            info!(path = %path.display(), %cluster, "config reload requested");
            (
                StatusCode::ACCEPTED,
                ApiResponse::ok(serde_json::json!({ "cluster_name": cluster, "status": "queued" })),
            )
                .into_response()
        }
        Err(_) => error_response("control loop is not running", StatusCode::SERVICE_UNAVAILABLE)
            .into_response(),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let usage = state.load_metrics.read().await.get_resource_usage(epoch_secs());
    let status = state.status.borrow().clone();
    let body = fleetscale_metrics::render_prometheus(&status, &usage);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
