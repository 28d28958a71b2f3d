//! API integration tests for trellis-control.
//!
//! These tests exercise the REST API through axum's tower service
//! interface (no TCP). The store is in-memory and labs use the
//! in-process backend, so no cluster or external service is required.

use axum::body::Body;
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use trellis_control::bus::EventBus;
use trellis_control::labs::{LabBackend, LabOrchestrator};
use trellis_control::state::AppState;
use trellis_control::store::TopologyStore;

/// Build a test app with fresh in-memory state.
fn test_app() -> Router {
    let bus = EventBus::default();
    let store = TopologyStore::new(bus.clone());
    let labs = LabOrchestrator::new(LabBackend::in_process(), store.clone());
    let state = AppState::new(store, bus, labs);

    Router::new()
        .nest("/api", trellis_control::api::router())
        .merge(trellis_control::api::root_router())
        .with_state(state)
}

/// Helper: parse JSON response body.
async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or_else(|_| {
        let text = String::from_utf8_lossy(&bytes);
        panic!("not valid JSON: {text}");
    })
}

/// Helper: build a JSON request.
fn json_request(method: &str, uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .method(method)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .method("GET")
        .body(Body::empty())
        .unwrap()
}

fn delete(uri: &str) -> axum::http::Request<Body> {
    axum::http::Request::builder()
        .uri(uri)
        .method("DELETE")
        .body(Body::empty())
        .unwrap()
}

const SPINE_LEAF: &str = r#"
topology:
  nodes:
    spine1:
      kind: nokia_srlinux
      image: ghcr.io/nokia/srlinux:23.10.1
    leaf1:
      kind: linux
  links:
    - endpoints: ["spine1:e1-1", "leaf1:eth1"]
"#;

fn deploy_body(name: &str) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "containerlab_yaml": SPINE_LEAF,
    })
}

// ── Health ──────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_link_count() {
    let app = test_app();
    let resp = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["monitored_links"], 0);
    assert_eq!(body["connected_agents"], 0);
}

// ── Topology ────────────────────────────────────────────────────────

#[tokio::test]
async fn topology_starts_empty() {
    let app = test_app();
    let resp = app.oneshot(get("/api/topology")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["nodes"], serde_json::json!([]));
    assert_eq!(body["edges"], serde_json::json!([]));
}

#[tokio::test]
async fn node_and_link_crud() {
    let app = test_app();

    let node = serde_json::json!({
        "id": "dc1/r1", "lab": "dc1", "label": "r1",
        "type": "router", "status": "up"
    });
    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/topology/nodes", node))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let link = serde_json::json!({
        "id": "dc1/r1-r2", "lab": "dc1",
        "source": "dc1/r1", "target": "dc1/r2",
        "source_interface": "e1", "target_interface": "e2",
        "state": "unknown"
    });
    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/topology/links", link))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body = json_body(app.clone().oneshot(get("/api/topology")).await.unwrap()).await;
    assert_eq!(body["nodes"].as_array().unwrap().len(), 1);
    assert_eq!(body["edges"].as_array().unwrap().len(), 1);

    // Remove them again (ids are URL-encoded)
    let resp = app
        .clone()
        .oneshot(delete("/api/topology/links/dc1%2Fr1-r2"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = app
        .clone()
        .oneshot(delete("/api/topology/nodes/dc1%2Fr1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = app
        .oneshot(delete("/api/topology/nodes/dc1%2Fr1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

// ── Links ───────────────────────────────────────────────────────────

async fn app_with_link() -> Router {
    let app = test_app();
    let link = serde_json::json!({
        "id": "dc1/a-b", "lab": "dc1",
        "source": "dc1/a", "target": "dc1/b",
        "source_interface": "e1-1", "target_interface": "eth1",
        "state": "unknown"
    });
    app.clone()
        .oneshot(json_request("POST", "/api/topology/links", link))
        .await
        .unwrap();
    app
}

#[tokio::test]
async fn link_lookup_and_state_filter() {
    let app = app_with_link().await;

    let body = json_body(app.clone().oneshot(get("/api/links")).await.unwrap()).await;
    assert_eq!(body["count"], 1);

    let resp = app.clone().oneshot(get("/api/links/dc1%2Fa-b")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["source_interface"], "e1-1");

    // No active links yet
    let body = json_body(
        app.clone()
            .oneshot(get("/api/links?state=active"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["count"], 0);

    let resp = app.oneshot(get("/api/links/nope")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn link_state_update_emits_once() {
    let app = app_with_link().await;

    let resp = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/api/links/dc1%2Fa-b/state",
            serde_json::json!({"state": "down"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["new_state"], "down");
    assert_eq!(body["old_state"], "unknown");

    // Same state again: no event
    let resp = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/api/links/dc1%2Fa-b/state",
            serde_json::json!({"state": "down"}),
        ))
        .await
        .unwrap();
    let body = json_body(resp).await;
    assert!(body.is_null());

    // Exactly one link_state_change in history
    let body = json_body(
        app.oneshot(get("/api/events/history?event_type=link_state_change"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn link_metrics_update_and_read() {
    let app = app_with_link().await;

    let metrics = serde_json::json!({
        "rx_bps": 1250000.0, "tx_bps": 980000.0,
        "rx_pps": 1000.0, "tx_pps": 800.0,
        "rx_bytes_total": 123, "tx_bytes_total": 456,
        "utilization": 0.45
    });
    let resp = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/api/links/dc1%2Fa-b/metrics",
            metrics,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body = json_body(
        app.clone()
            .oneshot(get("/api/links/dc1%2Fa-b/metrics"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["rx_bps"], 1250000.0);
    assert_eq!(body["utilization"], 0.45);

    // Metrics-only update produced no state event
    let body = json_body(
        app.oneshot(get("/api/events/history?event_type=link_state_change"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn link_by_interface() {
    let app = app_with_link().await;

    let resp = app
        .clone()
        .oneshot(get("/api/links/by-interface/e1-1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["id"], "dc1/a-b");

    let resp = app.oneshot(get("/api/links/by-interface/ghost0")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

// ── Events ──────────────────────────────────────────────────────────

#[tokio::test]
async fn agent_event_resolves_link_and_is_idempotent() {
    let app = app_with_link().await;

    let event = serde_json::json!({
        "interface": "e1-1",
        "old_state": "up_active",
        "new_state": "down",
        "operstate": "down",
        "source": "link"
    });

    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/events", event.clone()))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["link_id"], "dc1/a-b");
    assert_eq!(body["new_state"], "down");

    // Identical second post: no event
    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/events", event))
        .await
        .unwrap();
    let body = json_body(resp).await;
    assert!(body.is_null());

    let body = json_body(
        app.oneshot(get("/api/events/history?event_type=link_state_change"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn unknown_interface_event_is_accepted_and_ignored() {
    let app = test_app();
    let event = serde_json::json!({
        "interface": "ghost0",
        "old_state": "unknown",
        "new_state": "down"
    });
    let resp = app
        .oneshot(json_request("POST", "/api/events", event))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(json_body(resp).await.is_null());
}

#[tokio::test]
async fn batch_events_report_per_event_outcome() {
    let app = app_with_link().await;

    let batch = serde_json::json!([
        {"interface": "e1-1", "old_state": "unknown", "new_state": "up_active"},
        {"interface": "ghost0", "old_state": "unknown", "new_state": "down"}
    ]);
    let resp = app
        .oneshot(json_request("POST", "/api/events/batch", batch))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["processed"], 2);
    assert_eq!(body["results"][0]["state_changed"], true);
    assert_eq!(body["results"][1]["state_changed"], false);
}

#[tokio::test]
async fn endpoint_event_lands_on_the_bus() {
    let app = test_app();
    let event = serde_json::json!({
        "type": "ADDED",
        "endpoint": {
            "name": "web-0", "namespace": "prod", "identity": 1,
            "node_name": "n1", "pod_name": "web-0",
            "ipv4_address": "10.0.0.1", "ipv6_address": "",
            "state": "ready", "labels": [],
            "last_updated": "2026-01-01T00:00:00Z"
        },
        "timestamp": "2026-01-01T00:00:00Z"
    });
    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/events", event))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["type"], "endpoint_ADDED");

    let body = json_body(
        app.oneshot(get("/api/events/history?event_type=endpoint_ADDED"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["count"], 1);
}

// ── Labs ────────────────────────────────────────────────────────────

#[tokio::test]
async fn lab_deploy_round_trip() {
    let app = test_app();

    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/labs", deploy_body("dc1")))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["lab"], "dc1");
    assert_eq!(body["nodes_discovered"], 2);
    assert_eq!(body["links_discovered"], 1);

    let body = json_body(
        app.clone()
            .oneshot(get("/api/labs/dc1/topology"))
            .await
            .unwrap(),
    )
    .await;
    let ids: Vec<&str> = body["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"dc1/spine1"));
    assert!(ids.contains(&"dc1/leaf1"));
    assert_eq!(body["edges"][0]["id"], "dc1/spine1-leaf1");

    let body = json_body(app.oneshot(get("/api/labs/dc1/status")).await.unwrap()).await;
    assert_eq!(body["lab"], "dc1");
}

#[tokio::test]
async fn labs_with_same_node_names_stay_distinct() {
    let app = test_app();
    for lab in ["dc1", "dc2"] {
        let resp = app
            .clone()
            .oneshot(json_request("POST", "/api/labs", deploy_body(lab)))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let body = json_body(app.clone().oneshot(get("/api/links")).await.unwrap()).await;
    let ids: Vec<&str> = body["links"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["dc1/spine1-leaf1", "dc2/spine1-leaf1"]);

    let body = json_body(
        app.clone()
            .oneshot(get("/api/labs/dc1/topology"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["edges"].as_array().unwrap().len(), 1);
    assert_eq!(body["edges"][0]["id"], "dc1/spine1-leaf1");

    // Deleting dc1 leaves only dc2 entities
    let resp = app
        .clone()
        .oneshot(delete("/api/labs/dc1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body = json_body(app.oneshot(get("/api/topology")).await.unwrap()).await;
    let labs: Vec<&str> = body["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["lab"].as_str().unwrap())
        .collect();
    assert!(!labs.is_empty());
    assert!(labs.iter().all(|l| *l == "dc2"));
}

#[tokio::test]
async fn duplicate_lab_deploy_conflicts() {
    let app = test_app();
    app.clone()
        .oneshot(json_request("POST", "/api/labs", deploy_body("dc1")))
        .await
        .unwrap();
    let resp = app
        .oneshot(json_request("POST", "/api/labs", deploy_body("dc1")))
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn invalid_lab_yaml_is_rejected() {
    let app = test_app();
    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/labs",
            serde_json::json!({"name": "bad", "containerlab_yaml": "no_topology: true"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Nothing was ingested
    let body = json_body(app.oneshot(get("/api/topology")).await.unwrap()).await;
    assert_eq!(body["nodes"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn missing_yaml_is_rejected() {
    let app = test_app();
    let resp = app
        .oneshot(json_request(
            "POST",
            "/api/labs",
            serde_json::json!({"name": "empty"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn lab_list_and_unknown_lab_404s() {
    let app = test_app();
    app.clone()
        .oneshot(json_request("POST", "/api/labs", deploy_body("dc1")))
        .await
        .unwrap();

    let body = json_body(app.clone().oneshot(get("/api/labs")).await.unwrap()).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["labs"][0]["name"], "dc1");

    let resp = app.clone().oneshot(get("/api/labs/ghost")).await.unwrap();
    assert_eq!(resp.status(), 404);
    let resp = app.oneshot(delete("/api/labs/ghost")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn deploy_lab_from_wrapper_yaml() {
    let app = test_app();
    let wrapper = format!(
        "apiVersion: clabernetes.containerlab.dev/v1alpha1\nkind: Topology\nmetadata:\n  name: wrapped\n  namespace: labs\nspec:\n  definition:\n    containerlab: |\n{}",
        SPINE_LEAF
            .lines()
            .map(|l| format!("      {l}"))
            .collect::<Vec<_>>()
            .join("\n")
    );

    let resp = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/labs",
            serde_json::json!({"clabernetes_yaml": wrapper}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body = json_body(resp).await;
    assert_eq!(body["lab"], "wrapped");

    let body = json_body(app.oneshot(get("/api/labs/wrapped")).await.unwrap()).await;
    assert_eq!(body["namespace"], "labs");
}

// ── End to end: deploy, agent event, state change ───────────────────

#[tokio::test]
async fn agent_event_drives_deployed_link_state() {
    let app = test_app();
    app.clone()
        .oneshot(json_request("POST", "/api/labs", deploy_body("dc1")))
        .await
        .unwrap();

    let event = serde_json::json!({
        "interface": "e1-1",
        "old_state": "up_active",
        "new_state": "down"
    });
    let resp = app
        .clone()
        .oneshot(json_request("POST", "/api/events", event))
        .await
        .unwrap();
    let body = json_body(resp).await;
    assert_eq!(body["link_id"], "dc1/spine1-leaf1");
    assert_eq!(body["new_state"], "down");

    let body = json_body(
        app.oneshot(get("/api/links?state=down"))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["links"][0]["id"], "dc1/spine1-leaf1");
}
