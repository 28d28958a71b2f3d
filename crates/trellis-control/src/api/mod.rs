//! REST API route tree.

pub mod events;
pub mod labs;
pub mod links;
pub mod topology;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;

use crate::state::AppState;

/// Build the `/api` router.
pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/topology", topology::router())
        .nest("/links", links::router())
        .nest("/events", events::router())
        .nest("/labs", labs::router())
}

/// Routes mounted at the server root: health check and WebSockets.
pub fn root_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/ws/events", get(crate::ws::events_handler))
        .route("/ws/agent", get(crate::ws::agent_handler))
}

/// Health check endpoint.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.store().stats();
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.uptime_seconds(),
        "connected_agents": state.agent_connections(),
        "monitored_links": stats.link_count,
        "timestamp": Utc::now(),
    }))
}
