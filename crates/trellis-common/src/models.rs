//! Data models for the Trellis platform.
//!
//! These types represent the topology entities held by the control plane
//! and the per-host interface state tracked by the agent. They are shared
//! so that events published by the agent deserialize directly into the
//! shapes the control plane stores and re-broadcasts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Link state ──────────────────────────────────────────────────────

/// State of a topology link as held by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Link up, traffic flowing.
    Active,
    /// Link up, no recent traffic.
    Idle,
    /// Link down.
    Down,
    /// State not yet determined.
    Unknown,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Active => write!(f, "active"),
            LinkState::Idle => write!(f, "idle"),
            LinkState::Down => write!(f, "down"),
            LinkState::Unknown => write!(f, "unknown"),
        }
    }
}

impl LinkState {
    /// Translate an agent state token into a link state.
    ///
    /// Agents report either the traffic vocabulary (`active`/`idle`/`down`)
    /// or the fused vocabulary (`up_active`/`up_idle`/`down`). Anything
    /// else maps to `Unknown`.
    pub fn from_agent_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "active" | "up_active" => LinkState::Active,
            "idle" | "up_idle" => LinkState::Idle,
            "down" => LinkState::Down,
            _ => LinkState::Unknown,
        }
    }
}

/// Fused per-interface state computed by the agent.
///
/// Distinct from [`LinkState`]: the agent separates "up with traffic"
/// from "up without traffic" under an explicit `up_` prefix so that the
/// operstate dimension stays visible in event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfaceState {
    UpActive,
    UpIdle,
    Down,
    Unknown,
}

impl std::fmt::Display for IfaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IfaceState::UpActive => write!(f, "up_active"),
            IfaceState::UpIdle => write!(f, "up_idle"),
            IfaceState::Down => write!(f, "down"),
            IfaceState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Traffic dimension of an interface, derived from counter deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficState {
    Active,
    Idle,
    Unknown,
}

/// Node status as reported by orchestration or administration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Up,
    Down,
    Degraded,
    Unknown,
}

// ── Topology entities ───────────────────────────────────────────────

/// Traffic metrics for a link or interface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkMetrics {
    /// Receive bytes per second.
    pub rx_bps: f64,
    /// Transmit bytes per second.
    pub tx_bps: f64,
    /// Receive packets per second.
    pub rx_pps: f64,
    /// Transmit packets per second.
    pub tx_pps: f64,
    /// Total bytes received.
    pub rx_bytes_total: u64,
    /// Total bytes transmitted.
    pub tx_bytes_total: u64,
    /// Link utilization in [0, 1]; 0 when speed is unknown.
    pub utilization: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_loss: Option<f64>,
}

/// A network node (router, switch, or host) in the topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Globally unique, lab-prefixed identifier (e.g. `dc1/spine1`).
    pub id: String,
    /// Lab this node belongs to.
    pub lab: String,
    /// Display label (original, unprefixed name).
    pub label: String,
    /// Node type: "router", "switch", or "host".
    #[serde(rename = "type")]
    pub node_type: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    /// Platform/OS tag (e.g. "srlinux", "ceos").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A network link between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    /// Globally unique, lab-prefixed identifier (e.g. `dc1/spine1-leaf1`).
    pub id: String,
    /// Lab this link belongs to.
    pub lab: String,
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    /// Interface name on the source node.
    pub source_interface: String,
    /// Interface name on the target node.
    pub target_interface: String,
    pub state: LinkState,
    #[serde(default)]
    pub metrics: LinkMetrics,
    #[serde(default)]
    pub speed_mbps: u32,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_mtu() -> u32 {
    1500
}

/// Complete network graph snapshot served to visualization clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyView {
    pub nodes: Vec<Node>,
    pub edges: Vec<Link>,
    pub timestamp: DateTime<Utc>,
}

// ── Host interface state ────────────────────────────────────────────

/// One raw counter sample read from the kernel counter tree.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

/// Computed traffic metrics for one interface over one sample window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficMetrics {
    pub interface: String,
    pub rx_bps: f64,
    pub tx_bps: f64,
    pub rx_pps: f64,
    pub tx_pps: f64,
    pub rx_bytes_total: u64,
    pub tx_bytes_total: u64,
    pub state: TrafficState,
    pub utilization: f64,
    pub timestamp: DateTime<Utc>,
}

impl TrafficMetrics {
    pub fn unknown(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            rx_bps: 0.0,
            tx_bps: 0.0,
            rx_pps: 0.0,
            tx_pps: 0.0,
            rx_bytes_total: 0,
            tx_bytes_total: 0,
            state: TrafficState::Unknown,
            utilization: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// Complete fused view of one monitored interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub ifindex: u32,
    pub mac_address: String,
    pub mtu: u32,
    /// Link speed in Mbps; 0 when the kernel reports unknown (-1).
    pub speed_mbps: u32,
    pub operstate: String,
    pub link_state: IfaceState,
    pub rx_bps: f64,
    pub tx_bps: f64,
    pub rx_bytes_total: u64,
    pub tx_bytes_total: u64,
    pub utilization: f64,
    pub last_updated: DateTime<Utc>,
}

impl InterfaceInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ifindex: 0,
            mac_address: String::new(),
            mtu: 1500,
            speed_mbps: 0,
            operstate: "unknown".into(),
            link_state: IfaceState::Unknown,
            rx_bps: 0.0,
            tx_bps: 0.0,
            rx_bytes_total: 0,
            tx_bytes_total: 0,
            utilization: 0.0,
            last_updated: Utc::now(),
        }
    }
}
