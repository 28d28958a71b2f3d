//! Flow-based link-state detection.
//!
//! Consumes newline-delimited JSON flow records from the cluster observer
//! over a long-lived TCP stream and derives a three-state machine per
//! directed endpoint pair:
//!
//! - FORWARDED refreshes liveness and asserts active
//! - DROPPED forces down immediately, bypassing timers
//! - any other verdict refreshes liveness without changing state
//!
//! A background sweep (1 s cadence) transitions active flows to idle once
//! no record has been seen for `idle_timeout`. Per-flow state survives
//! observer reconnects so a resumed stream does not replay transitions.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

use trellis_common::flow::{wire, FlowEndpoint, FlowRecord, FlowState, FlowVerdict};
use trellis_common::protocol::FlowStateEvent;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Tracking state for one flow key.
struct FlowEntry {
    last_seen: Instant,
    state: FlowState,
    source: FlowEndpoint,
    destination: FlowEndpoint,
}

/// Per-flow state table shared between the stream reader and the sweeper.
#[derive(Default)]
pub struct FlowTable {
    flows: HashMap<String, FlowEntry>,
}

impl FlowTable {
    /// Apply one flow record; returns a transition event if state changed.
    pub fn apply(&mut self, record: &FlowRecord, now: Instant) -> Option<FlowStateEvent> {
        let key = record.flow_key();
        let entry = self.flows.entry(key.clone()).or_insert_with(|| FlowEntry {
            last_seen: now,
            state: FlowState::Unknown,
            source: record.source.clone(),
            destination: record.destination.clone(),
        });

        entry.source = record.source.clone();
        entry.destination = record.destination.clone();

        let old_state = entry.state;
        let new_state = match record.verdict {
            FlowVerdict::Forwarded => {
                entry.last_seen = now;
                FlowState::Active
            }
            // Down overrides everything; last_seen untouched so a later
            // FORWARDED re-enters active cleanly
            FlowVerdict::Dropped => FlowState::Down,
            _ => {
                entry.last_seen = now;
                old_state
            }
        };

        if old_state == new_state {
            return None;
        }
        entry.state = new_state;

        Some(FlowStateEvent {
            flow_key: key,
            source: record.source.clone(),
            destination: record.destination.clone(),
            old_state,
            new_state,
            timestamp: Utc::now(),
        })
    }

    /// Transition active flows with stale liveness to idle.
    pub fn sweep(&mut self, now: Instant, idle_timeout: Duration) -> Vec<FlowStateEvent> {
        let mut events = Vec::new();
        for (key, entry) in &mut self.flows {
            if entry.state == FlowState::Active && now.duration_since(entry.last_seen) > idle_timeout
            {
                entry.state = FlowState::Idle;
                events.push(FlowStateEvent {
                    flow_key: key.clone(),
                    source: entry.source.clone(),
                    destination: entry.destination.clone(),
                    old_state: FlowState::Active,
                    new_state: FlowState::Idle,
                    timestamp: Utc::now(),
                });
            }
        }
        events
    }

    /// Current state of every tracked flow.
    pub fn states(&self) -> HashMap<String, FlowState> {
        self.flows
            .iter()
            .map(|(k, e)| (k.clone(), e.state))
            .collect()
    }
}

/// Streams flow records from the observer and emits state transitions.
pub struct FlowWatcher {
    observer_addr: String,
    idle_timeout: Duration,
    table: std::sync::Arc<Mutex<FlowTable>>,
    tx: mpsc::Sender<FlowStateEvent>,
}

impl FlowWatcher {
    pub fn new(
        observer_addr: impl Into<String>,
        idle_timeout: Duration,
        tx: mpsc::Sender<FlowStateEvent>,
    ) -> Self {
        Self {
            observer_addr: observer_addr.into(),
            idle_timeout,
            table: std::sync::Arc::new(Mutex::new(FlowTable::default())),
            tx,
        }
    }

    pub fn table(&self) -> std::sync::Arc<Mutex<FlowTable>> {
        self.table.clone()
    }

    /// Run the observer stream and the idle sweeper until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let sweeper = {
            let table = self.table.clone();
            let tx = self.tx.clone();
            let idle_timeout = self.idle_timeout;
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let events = table.lock().await.sweep(Instant::now(), idle_timeout);
                            for event in events {
                                tracing::info!(flow = %event.flow_key, "flow went idle");
                                if tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            })
        };

        self.stream_loop(shutdown).await;
        sweeper.abort();
    }

    /// Connect-and-read loop with capped reconnect backoff.
    async fn stream_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Duration::from_millis(500);

        loop {
            if *shutdown.borrow() {
                return;
            }

            tracing::info!(addr = %self.observer_addr, "connecting to flow observer");
            match TcpStream::connect(&self.observer_addr).await {
                Ok(stream) => {
                    backoff = Duration::from_millis(500);
                    if self.read_stream(stream, &mut shutdown).await {
                        return; // shutdown requested
                    }
                    tracing::warn!("observer stream ended");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "observer connection failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Read NDJSON lines until the stream ends. Returns true on shutdown.
    async fn read_stream(&self, stream: TcpStream, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut lines = BufReader::new(stream).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<wire::FlowLine>(&line) {
                                Ok(parsed) => {
                                    let record: FlowRecord = parsed.flow.into();
                                    let event = self
                                        .table
                                        .lock()
                                        .await
                                        .apply(&record, Instant::now());
                                    if let Some(event) = event {
                                        tracing::info!(
                                            flow = %event.flow_key,
                                            old = %event.old_state,
                                            new = %event.new_state,
                                            "flow state change"
                                        );
                                        if self.tx.send(event).await.is_err() {
                                            return true;
                                        }
                                    }
                                }
                                Err(e) => {
                                    tracing::debug!(error = %e, "skipping unparseable flow line");
                                }
                            }
                        }
                        Ok(None) => return false,
                        Err(e) => {
                            tracing::warn!(error = %e, "observer read error");
                            return false;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(src: &str, dst: &str, verdict: FlowVerdict) -> FlowRecord {
        let endpoint = |name: &str| FlowEndpoint {
            namespace: "ns".into(),
            pod_name: name.into(),
            ..Default::default()
        };
        FlowRecord {
            source: endpoint(src),
            destination: endpoint(dst),
            verdict,
            direction: trellis_common::flow::FlowDirection::Egress,
            l4_protocol: "TCP".into(),
            source_port: 40000,
            destination_port: 80,
            bytes: 0,
            timestamp: Utc::now(),
            drop_reason: String::new(),
            is_reply: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forwarded_activates_and_idles_after_timeout() {
        let mut table = FlowTable::default();
        let timeout = Duration::from_secs(5);

        let event = table
            .apply(&record("a", "b", FlowVerdict::Forwarded), Instant::now())
            .unwrap();
        assert_eq!(event.old_state, FlowState::Unknown);
        assert_eq!(event.new_state, FlowState::Active);
        assert_eq!(event.flow_key, "ns/a->ns/b");

        // Just inside the window: nothing
        tokio::time::advance(Duration::from_millis(4900)).await;
        assert!(table.sweep(Instant::now(), timeout).is_empty());

        // Past the window: exactly one idle transition
        tokio::time::advance(Duration::from_millis(200)).await;
        let events = table.sweep(Instant::now(), timeout);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_state, FlowState::Idle);

        // Sweep again: already idle, no repeat
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(table.sweep(Instant::now(), timeout).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_overrides_pending_idle() {
        let mut table = FlowTable::default();
        let timeout = Duration::from_secs(5);

        table.apply(&record("a", "b", FlowVerdict::Forwarded), Instant::now());

        // DROPPED forces down immediately
        let event = table
            .apply(&record("a", "b", FlowVerdict::Dropped), Instant::now())
            .unwrap();
        assert_eq!(event.old_state, FlowState::Active);
        assert_eq!(event.new_state, FlowState::Down);

        // No idle transition fires later for this flow
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(table.sweep(Instant::now(), timeout).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn other_verdicts_refresh_liveness_without_state_change() {
        let mut table = FlowTable::default();
        let timeout = Duration::from_secs(5);

        table.apply(&record("a", "b", FlowVerdict::Forwarded), Instant::now());

        // TRACED at t+4s refreshes last_seen but keeps active
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(table
            .apply(&record("a", "b", FlowVerdict::Traced), Instant::now())
            .is_none());

        // t+8s: only 4s since the TRACED refresh, still active
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(table.sweep(Instant::now(), timeout).is_empty());

        // t+10s: 6s since refresh, idle fires
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(table.sweep(Instant::now(), timeout).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forwarded_after_idle_reactivates() {
        let mut table = FlowTable::default();
        let timeout = Duration::from_secs(5);

        table.apply(&record("a", "b", FlowVerdict::Forwarded), Instant::now());
        tokio::time::advance(Duration::from_secs(6)).await;
        table.sweep(Instant::now(), timeout);

        let event = table
            .apply(&record("a", "b", FlowVerdict::Forwarded), Instant::now())
            .unwrap();
        assert_eq!(event.old_state, FlowState::Idle);
        assert_eq!(event.new_state, FlowState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn flows_are_tracked_per_directed_key() {
        let mut table = FlowTable::default();

        table.apply(&record("a", "b", FlowVerdict::Forwarded), Instant::now());
        table.apply(&record("b", "a", FlowVerdict::Dropped), Instant::now());

        let states = table.states();
        assert_eq!(states["ns/a->ns/b"], FlowState::Active);
        assert_eq!(states["ns/b->ns/a"], FlowState::Down);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_verdict_does_not_activate_new_flow() {
        let mut table = FlowTable::default();
        assert!(table
            .apply(&record("a", "b", FlowVerdict::Audit), Instant::now())
            .is_none());
        assert_eq!(table.states()["ns/a->ns/b"], FlowState::Unknown);
    }
}
