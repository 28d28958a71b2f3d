//! WebSocket endpoints.
//!
//! `GET /ws/events[?event_types=csv]` — subscriber stream. The server
//! sends an `initial_state` frame (the full topology), then every bus
//! event matching the filter. Clients may send `{"type":"ping"}` and
//! receive `{"type":"pong"}`.
//!
//! `GET /ws/agent` — agents push events (the same shapes `POST
//! /api/events` accepts) and receive a per-event acknowledgement.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures::stream::StreamExt;
use futures::SinkExt;
use serde::Deserialize;

use trellis_common::endpoint::EndpointEvent;
use trellis_common::protocol::InterfaceEvent;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Comma-separated event types; absent = all.
    event_types: Option<String>,
}

/// Axum handler — upgrades HTTP to WebSocket for event subscribers.
pub async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let filter = query.event_types.map(|csv| {
        csv.split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
    });
    ws.on_upgrade(move |socket| handle_events_socket(state, socket, filter))
}

async fn handle_events_socket(state: AppState, socket: WebSocket, filter: Option<Vec<String>>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut subscriber = state.bus().subscribe(filter);

    tracing::debug!("event subscriber connected");

    // Initial state first, so the client can render before any event
    let initial = serde_json::json!({
        "type": "initial_state",
        "data": state.store().get_topology(),
        "timestamp": Utc::now(),
    });
    if ws_tx
        .send(Message::Text(initial.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = subscriber.recv() => {
                match event {
                    Some(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(j) => j,
                            Err(_) => continue,
                        };
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let is_ping = serde_json::from_str::<serde_json::Value>(&text)
                            .ok()
                            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
                            .unwrap_or(false);
                        if is_ping {
                            let pong = serde_json::json!({"type": "pong"});
                            if ws_tx.send(Message::Text(pong.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {} // Ping/Pong frames handled by axum
                }
            }
        }
    }

    subscriber.close();
    tracing::debug!("event subscriber disconnected");
}

/// Axum handler — upgrades HTTP to WebSocket for agent event ingest.
pub async fn agent_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(state, socket))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AgentPush {
    Endpoint(EndpointEvent),
    Interface(InterfaceEvent),
}

async fn handle_agent_socket(state: AppState, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    state.agent_connected();
    tracing::info!("agent connected");

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };

        let ack = match serde_json::from_str::<AgentPush>(&text) {
            Ok(AgentPush::Interface(event)) => {
                state.store().handle_agent_event(&event);
                serde_json::json!({
                    "status": "ok",
                    "message": format!("processed event for {}", event.interface),
                })
            }
            Ok(AgentPush::Endpoint(event)) => {
                let event_type = format!("endpoint_{}", event.kind);
                let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
                state.bus().publish(&event_type, payload, "agent");
                serde_json::json!({"status": "ok", "message": event_type})
            }
            Err(e) => {
                tracing::warn!(error = %e, "invalid agent event");
                serde_json::json!({"status": "error", "message": e.to_string()})
            }
        };

        if ws_tx
            .send(Message::Text(ack.to_string().into()))
            .await
            .is_err()
        {
            break;
        }
    }

    state.agent_disconnected();
    tracing::info!("agent disconnected");
}
