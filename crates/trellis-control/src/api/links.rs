//! Link state and metrics endpoints.
//!
//! GET /api/links[?state=…]              — all links, optionally filtered
//! GET /api/links/by-interface/{iface}   — resolve a link by interface name
//! GET /api/links/{id}                   — one link
//! GET /api/links/{id}/metrics           — its metrics
//! PUT /api/links/{id}/state             — set state (body: {"state": …})
//! PUT /api/links/{id}/metrics           — set metrics
//!
//! Link ids contain `/` (lab prefix); URL-encode them in paths.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trellis_common::models::{Link, LinkMetrics, LinkState};
use trellis_common::protocol::LinkStateEvent;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_links))
        .route("/by-interface/{interface}", get(get_link_by_interface))
        .route("/{link_id}", get(get_link))
        .route("/{link_id}/metrics", get(get_link_metrics).put(update_link_metrics))
        .route("/{link_id}/state", put(update_link_state))
}

#[derive(Debug, Deserialize)]
struct LinksQuery {
    state: Option<LinkState>,
}

#[derive(Debug, Serialize)]
struct LinksResponse {
    links: Vec<Link>,
    count: usize,
    timestamp: DateTime<Utc>,
}

async fn get_links(
    State(state): State<AppState>,
    Query(query): Query<LinksQuery>,
) -> Json<LinksResponse> {
    let mut links = state.store().get_all_links();
    if let Some(filter) = query.state {
        links.retain(|l| l.state == filter);
    }
    links.sort_by(|a, b| a.id.cmp(&b.id));
    Json(LinksResponse {
        count: links.len(),
        links,
        timestamp: Utc::now(),
    })
}

async fn get_link(
    State(state): State<AppState>,
    Path(link_id): Path<String>,
) -> Result<Json<Link>, StatusCode> {
    state
        .store()
        .get_link(&link_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_link_metrics(
    State(state): State<AppState>,
    Path(link_id): Path<String>,
) -> Result<Json<LinkMetrics>, StatusCode> {
    state
        .store()
        .get_link(&link_id)
        .map(|link| Json(link.metrics))
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct StateUpdate {
    state: LinkState,
    #[serde(default = "default_source")]
    source: String,
}

fn default_source() -> String {
    "api".into()
}

async fn update_link_state(
    State(state): State<AppState>,
    Path(link_id): Path<String>,
    Json(update): Json<StateUpdate>,
) -> Result<Json<Option<LinkStateEvent>>, StatusCode> {
    if state.store().get_link(&link_id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let event = state
        .store()
        .update_link_state(&link_id, update.state, None, &update.source);
    Ok(Json(event))
}

async fn update_link_metrics(
    State(state): State<AppState>,
    Path(link_id): Path<String>,
    Json(metrics): Json<LinkMetrics>,
) -> Result<Json<Link>, StatusCode> {
    if !state.store().update_link_metrics(&link_id, metrics) {
        return Err(StatusCode::NOT_FOUND);
    }
    state
        .store()
        .get_link(&link_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_link_by_interface(
    State(state): State<AppState>,
    Path(interface): Path<String>,
) -> Result<Json<Link>, StatusCode> {
    state
        .store()
        .get_link_by_interface(&interface)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
