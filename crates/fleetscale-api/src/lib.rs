//! fleetscale-api: REST surface of the autoscaler daemon.
//!
//! Nodes push heartbeats, schedulers push demand, operators read status
//! and steer the loop. Handlers never touch the provider; everything
//! flows through the channels the control loop owns.
//!
//! ```text
//!   POST /heartbeats ──► SharedLoadMetrics ──┐
//!   POST /demand     ──► watch<demand> ──────┤
//!   POST /breaker/reset, /reload ──► mpsc ───┼──► Autoscaler tick
//!   GET  /status, /nodes, /metrics ◄── watch<AutoscalerStatus>
//! ```
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/heartbeats` | Record a node heartbeat |
//! | POST | `/api/v1/demand` | Replace the pending resource demand |
//! | GET | `/api/v1/demand` | Current pending demand |
//! | GET | `/api/v1/status` | Latest autoscaler status |
//! | GET | `/api/v1/nodes` | Per-node lifecycle view |
//! | GET | `/api/v1/load` | Aggregate resource usage |
//! | POST | `/api/v1/breaker/reset` | Reset the failure breaker |
//! | POST | `/api/v1/reload` | Reload the cluster config file |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::sync::watch;

use fleet_core::{AutoscalerStatus, ResourceDemand};
use fleetscale_autoscale::ControlSender;
use fleetscale_metrics::SharedLoadMetrics;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub load_metrics: SharedLoadMetrics,
    pub demand: Arc<watch::Sender<ResourceDemand>>,
    pub status: watch::Receiver<AutoscalerStatus>,
    pub control: ControlSender,
    /// Re-read on `POST /reload`. `None` disables reloading.
    pub config_path: Option<PathBuf>,
}

/// Build the complete router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/heartbeats", post(handlers::record_heartbeat))
        .route("/demand", post(handlers::set_demand).get(handlers::get_demand))
        .route("/status", get(handlers::get_status))
        .route("/nodes", get(handlers::list_nodes))
        .route("/load", get(handlers::get_load))
        .route("/breaker/reset", post(handlers::reset_breaker))
        .route("/reload", post(handlers::reload_config))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
