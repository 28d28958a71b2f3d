//! Event ingestion and history endpoints.
//!
//! POST /api/events          — single event from a monitoring agent
//! POST /api/events/batch    — batch of interface events
//! GET  /api/events/history  — recent events from the bus ring
//!
//! Agents normally post [`InterfaceEvent`]s; endpoint registry changes
//! (carrying an `endpoint` object) are accepted on the same route and
//! republished on the bus as `endpoint_ADDED` / `endpoint_MODIFIED` /
//! `endpoint_DELETED`.

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use trellis_common::endpoint::EndpointEvent;
use trellis_common::protocol::InterfaceEvent;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(submit_event))
        .route("/batch", post(submit_batch))
        .route("/history", get(get_history))
}

/// Either ingest shape; endpoint changes are recognizable by their
/// `endpoint` object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IngestEvent {
    Endpoint(EndpointEvent),
    Interface(InterfaceEvent),
}

async fn submit_event(
    State(state): State<AppState>,
    Json(event): Json<IngestEvent>,
) -> Json<serde_json::Value> {
    match event {
        IngestEvent::Interface(event) => {
            tracing::debug!(interface = %event.interface, new_state = %event.new_state, "agent event");
            let result = state.store().handle_agent_event(&event);
            Json(serde_json::to_value(result).unwrap_or(serde_json::Value::Null))
        }
        IngestEvent::Endpoint(event) => {
            let event_type = format!("endpoint_{}", event.kind);
            let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
            state.bus().publish(&event_type, payload, "agent");
            Json(serde_json::json!({"status": "ok", "type": event_type}))
        }
    }
}

async fn submit_batch(
    State(state): State<AppState>,
    Json(events): Json<Vec<InterfaceEvent>>,
) -> Json<serde_json::Value> {
    let mut results = Vec::with_capacity(events.len());
    for event in &events {
        let outcome = state.store().handle_agent_event(event);
        results.push(serde_json::json!({
            "interface": event.interface,
            "processed": true,
            "state_changed": outcome.is_some(),
        }));
    }

    Json(serde_json::json!({
        "processed": results.len(),
        "failed": 0,
        "results": results,
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    event_type: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<serde_json::Value> {
    let events = state
        .bus()
        .history(query.event_type.as_deref(), query.limit);
    Json(serde_json::json!({
        "count": events.len(),
        "events": events,
    }))
}
