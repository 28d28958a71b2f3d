//! Shared application state.
//!
//! The wiring root: store, bus, and orchestrator are constructed once in
//! `main` (or a test harness) and handed to every handler through this
//! state — no process-wide singletons.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::bus::EventBus;
use crate::labs::LabOrchestrator;
use crate::store::TopologyStore;

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    store: TopologyStore,
    bus: EventBus,
    labs: LabOrchestrator,
    started_at: DateTime<Utc>,
    /// Currently connected agent WebSockets.
    agent_connections: AtomicUsize,
}

impl AppState {
    pub fn new(store: TopologyStore, bus: EventBus, labs: LabOrchestrator) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                labs,
                started_at: Utc::now(),
                agent_connections: AtomicUsize::new(0),
            }),
        }
    }

    pub fn store(&self) -> &TopologyStore {
        &self.inner.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn labs(&self) -> &LabOrchestrator {
        &self.inner.labs
    }

    pub fn uptime_seconds(&self) -> f64 {
        (Utc::now() - self.inner.started_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0
    }

    pub fn agent_connected(&self) {
        self.inner.agent_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn agent_disconnected(&self) {
        self.inner.agent_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn agent_connections(&self) -> usize {
        self.inner.agent_connections.load(Ordering::Relaxed)
    }
}
