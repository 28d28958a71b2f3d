//! Wire protocol between the agent and the control plane.
//!
//! All messages are JSON. Events published by the agent are bare payloads
//! (the HTTP and WebSocket ingest endpoints accept [`InterfaceEvent`]
//! directly); events fanned out by the control plane are wrapped in an
//! [`Event`] envelope carrying a UUIDv7 id, type, timestamp, and source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::endpoint::EndpointEvent;
use crate::flow::{FlowEndpoint, FlowState};
use crate::models::{IfaceState, InterfaceInfo, LinkMetrics, LinkState};

// ── Event envelope ──────────────────────────────────────────────────

/// The envelope for events distributed by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id (UUIDv7, time-ordered).
    pub id: Uuid,
    /// Event type (e.g. "link_state_change").
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl Event {
    /// Create a new event with a fresh UUIDv7 and current timestamp.
    pub fn new(
        event_type: impl Into<String>,
        data: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    /// Parse the data into a concrete type.
    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

// ── Agent → Control Plane ───────────────────────────────────────────

/// Interface state change reported by a host agent.
///
/// `new_state` is a token rather than a typed enum so that both the fused
/// (`up_active`/`up_idle`/`down`) and the flow (`active`/`idle`/`down`)
/// vocabularies are accepted; the store translates via
/// [`LinkState::from_agent_token`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceEvent {
    pub interface: String,
    #[serde(default)]
    pub ifindex: u32,
    pub old_state: String,
    pub new_state: String,
    #[serde(default = "default_operstate")]
    pub operstate: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<LinkMetrics>,
}

fn default_operstate() -> String {
    "unknown".into()
}

fn default_source() -> String {
    "agent".into()
}

/// Fused state transition emitted by the interface monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub interface: String,
    pub old_state: IfaceState,
    pub new_state: IfaceState,
    pub interface_info: InterfaceInfo,
    pub timestamp: DateTime<Utc>,
    /// Which input triggered the transition: "link" or "traffic".
    pub source: String,
}

impl StateChangeEvent {
    /// Convert to the wire event the control plane ingests.
    pub fn to_interface_event(&self) -> InterfaceEvent {
        InterfaceEvent {
            interface: self.interface.clone(),
            ifindex: self.interface_info.ifindex,
            old_state: self.old_state.to_string(),
            new_state: self.new_state.to_string(),
            operstate: self.interface_info.operstate.clone(),
            timestamp: self.timestamp,
            source: self.source.clone(),
            metrics: Some(LinkMetrics {
                rx_bps: self.interface_info.rx_bps,
                tx_bps: self.interface_info.tx_bps,
                rx_bytes_total: self.interface_info.rx_bytes_total,
                tx_bytes_total: self.interface_info.tx_bytes_total,
                utilization: self.interface_info.utilization,
                ..Default::default()
            }),
        }
    }
}

/// Per-flow state transition emitted by the flow observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStateEvent {
    pub flow_key: String,
    pub source: FlowEndpoint,
    pub destination: FlowEndpoint,
    pub old_state: FlowState,
    pub new_state: FlowState,
    pub timestamp: DateTime<Utc>,
}

/// Everything a host agent can publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    Interface(InterfaceEvent),
    Flow(FlowStateEvent),
    Endpoint(EndpointEvent),
}

// ── Control plane → subscribers ─────────────────────────────────────

/// Link state change fanned out on the event bus after an agent report
/// or a manual update resolved to a topology link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkStateEvent {
    pub link_id: String,
    pub interface: String,
    pub old_state: LinkState,
    pub new_state: LinkState,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<LinkMetrics>,
}
