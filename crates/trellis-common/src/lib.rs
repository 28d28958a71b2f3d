//! Shared types for the Trellis platform.
//!
//! This crate contains:
//! - **Data models** — Node, Link, LinkState, metrics, and host interface types
//! - **Protocol messages** — payloads the agent publishes to the control plane
//! - **Flow types** — observer flow records and per-flow state machine states
//! - **Endpoint types** — cluster endpoint metadata and change events

pub mod endpoint;
pub mod flow;
pub mod models;
pub mod protocol;
