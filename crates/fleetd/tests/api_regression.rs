//! API regression tests.
//!
//! Wires the router to a real control loop over the in-memory
//! provider, the same way `fleetd run` does, and drives it through
//! HTTP requests.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use tokio::sync::watch;
use tower::ServiceExt;

use fleet_core::{ClusterConfig, epoch_secs};
use fleetscale_api::{ApiState, build_router};
use fleetscale_autoscale::{Autoscaler, control_channel};
use fleetscale_metrics::LoadMetrics;
use fleetscale_provider::build_provider;

const CLUSTER: &str = r#"
cluster_name = "regression"
head_node_type = "head"

[autoscaler]
max_num_failures = 2

[provider]
type = "fake"
auto_run = true

[node_types.head]
max_workers = 1
resources = { CPU = 4 }

[node_types.worker]
max_workers = 3
resources = { CPU = 2 }
"#;

fn daemon() -> (Autoscaler, Router) {
    let config = ClusterConfig::from_toml_str(CLUSTER).unwrap();
    let provider = build_provider(&config).unwrap();
    let load_metrics = LoadMetrics::shared(config.autoscaler.heartbeat_timeout_s);
    let (demand_tx, demand_rx) = watch::channel(Vec::new());
    let (control_tx, control_rx) = control_channel();
    let autoscaler = Autoscaler::new(config, provider, load_metrics.clone(), demand_rx)
        .unwrap()
        .with_control(control_rx);
    let router = build_router(ApiState {
        load_metrics,
        demand: Arc::new(demand_tx),
        status: autoscaler.status(),
        control: control_tx,
        config_path: None,
    });
    (autoscaler, router)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn status_before_first_tick() {
    let (_autoscaler, router) = daemon();

    let resp = router.oneshot(get("/api/v1/status")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["cluster_name"], "regression");
    assert_eq!(body["data"]["ticks"], 0);
}

#[tokio::test]
async fn demand_posted_over_http_drives_launches() {
    let (mut autoscaler, router) = daemon();

    let demand = serde_json::json!({ "bundles": [{ "CPU": 4 }, { "CPU": 2 }] });
    let resp = router.clone().oneshot(post_json("/api/v1/demand", demand)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let summary = autoscaler.tick_at(epoch_secs()).await.unwrap();
    assert_eq!(summary.targets["head"], 1);
    assert_eq!(summary.targets["worker"], 1);

    // Created nodes show up on the next reconcile.
    autoscaler.tick_at(epoch_secs()).await.unwrap();
    let resp = router.clone().oneshot(get("/api/v1/status")).await.unwrap();
    let body = json_body(resp).await;
    assert_eq!(body["data"]["launched_total"], 2);
    assert_eq!(body["data"]["nodes_by_type"]["head"], 1);
    assert_eq!(body["data"]["nodes_by_type"]["worker"], 1);

    let resp = router.oneshot(get("/api/v1/nodes")).await.unwrap();
    let body = json_body(resp).await;
    assert_eq!(body["data"].as_array().map(Vec::len), Some(2));
    autoscaler.wait_for_updaters().await;
}

#[tokio::test]
async fn heartbeats_feed_load_and_metrics() {
    let (_autoscaler, router) = daemon();

    let beat = serde_json::json!({
        "node_id": "fake-1",
        "used": { "CPU": 3 },
        "available": { "CPU": 1 }
    });
    let resp = router.clone().oneshot(post_json("/api/v1/heartbeats", beat)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = router.clone().oneshot(get("/api/v1/load")).await.unwrap();
    let body = json_body(resp).await;
    assert_eq!(body["data"]["node_count"], 1);
    assert_eq!(body["data"]["utilization_fraction"], 0.75);

    let resp = router.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("fleetscale_utilization_fraction{cluster=\"regression\"} 0.7500"));
}

#[tokio::test]
async fn malformed_heartbeat_is_rejected() {
    let (_autoscaler, router) = daemon();

    let resp = router
        .oneshot(post_json("/api/v1/heartbeats", serde_json::json!({ "used": {} })))
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
}

#[tokio::test]
async fn breaker_reset_reaches_the_loop() {
    let (mut autoscaler, router) = daemon();

    let resp = router.clone().oneshot(post_json("/api/v1/breaker/reset", serde_json::json!({}))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    autoscaler.tick_at(epoch_secs()).await.unwrap();
    let resp = router.oneshot(get("/api/v1/status")).await.unwrap();
    let body = json_body(resp).await;
    assert_eq!(body["data"]["breaker"]["tripped"], false);
    assert_eq!(body["data"]["ticks"], 1);
}

#[tokio::test]
async fn reload_without_config_file_is_rejected() {
    let (_autoscaler, router) = daemon();

    let resp = router.oneshot(post_json("/api/v1/reload", serde_json::json!({}))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = json_body(resp).await;
    assert_eq!(body["success"], false);
}
