//! Trellis host agent library.
//!
//! The building blocks of the monitoring daemon:
//! - [`link_watch`] — kernel link-event stream (instant up/down)
//! - [`sampler`] — periodic counter sampling (active/idle with hysteresis)
//! - [`fusion`] — per-interface three-state machine combining both
//! - [`flow_watch`] — flow-observer based state detection for clusters
//! - [`endpoints`] — cluster endpoint registry
//! - [`publisher`] — buffered event publishing to the control plane

pub mod endpoints;
pub mod filter;
pub mod flow_watch;
pub mod fusion;
pub mod link_watch;
pub mod publisher;
pub mod sampler;
