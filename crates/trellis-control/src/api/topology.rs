//! Topology endpoints.
//!
//! GET    /api/topology             — full network graph
//! POST   /api/topology/nodes       — add a node
//! POST   /api/topology/links       — add a link
//! DELETE /api/topology/nodes/{id}  — remove a node
//! DELETE /api/topology/links/{id}  — remove a link
//!
//! Entity ids contain `/` (lab prefix); URL-encode them in paths.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use trellis_common::models::{Link, Node, TopologyView};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_topology))
        .route("/nodes", post(add_node))
        .route("/links", post(add_link))
        .route("/nodes/{node_id}", axum::routing::delete(remove_node))
        .route("/links/{link_id}", axum::routing::delete(remove_link))
}

async fn get_topology(State(state): State<AppState>) -> Json<TopologyView> {
    Json(state.store().get_topology())
}

async fn add_node(State(state): State<AppState>, Json(node): Json<Node>) -> Json<Node> {
    state.store().add_node(node.clone());
    Json(node)
}

async fn add_link(State(state): State<AppState>, Json(link): Json<Link>) -> Json<Link> {
    state.store().add_link(link.clone());
    Json(link)
}

async fn remove_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if state.store().remove_node(&node_id) {
        Ok(Json(
            serde_json::json!({"status": "removed", "node_id": node_id}),
        ))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn remove_link(
    State(state): State<AppState>,
    Path(link_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if state.store().remove_link(&link_id) {
        Ok(Json(
            serde_json::json!({"status": "removed", "link_id": link_id}),
        ))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
