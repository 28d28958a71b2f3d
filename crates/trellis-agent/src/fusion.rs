//! Interface state fusion.
//!
//! Combines the instantaneous link-event stream with the sampled traffic
//! stream into one three-state machine per interface:
//!
//! ```text
//! operstate != up                       -> down
//! operstate == up, traffic active       -> up_active
//! operstate == up, traffic idle/unknown -> up_idle
//! ```
//!
//! The fused state is a pure function of the latest operstate and the
//! latest traffic state. Both inputs are applied on a single task, so
//! emitted transitions are totally ordered per interface, and repeated
//! identical states never produce an event.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::{mpsc, watch};

use trellis_common::models::{IfaceState, InterfaceInfo, TrafficState};
use trellis_common::protocol::StateChangeEvent;

use crate::link_watch::{LinkEvent, LinkEventKind};
use crate::sampler::{self, TrafficStateChange};

/// Fusion rule: operstate takes precedence over traffic.
pub fn compute_fused(operstate: &str, traffic: TrafficState) -> IfaceState {
    if operstate != "up" {
        return IfaceState::Down;
    }
    match traffic {
        TrafficState::Active => IfaceState::UpActive,
        TrafficState::Idle | TrafficState::Unknown => IfaceState::UpIdle,
    }
}

/// Shared read view of the fused interface table.
pub type InterfaceTable = Arc<RwLock<HashMap<String, InterfaceInfo>>>;

/// State owned by the fusion task; split out so the transition logic is
/// directly testable without channels.
struct FusionCore {
    sysfs_root: PathBuf,
    interfaces: InterfaceTable,
    traffic_states: HashMap<String, TrafficState>,
}

impl FusionCore {
    fn new(sysfs_root: PathBuf) -> Self {
        Self {
            sysfs_root,
            interfaces: Arc::new(RwLock::new(HashMap::new())),
            traffic_states: HashMap::new(),
        }
    }

    fn apply_link(&mut self, event: &LinkEvent) -> Option<StateChangeEvent> {
        if event.kind == LinkEventKind::Removed {
            self.interfaces
                .write()
                .expect("interface table poisoned")
                .remove(&event.interface);
            self.traffic_states.remove(&event.interface);
            tracing::debug!(interface = %event.interface, "interface removed");
            return None;
        }

        let mut table = self.interfaces.write().expect("interface table poisoned");
        let info = table
            .entry(event.interface.clone())
            .or_insert_with(|| sampler::read_interface_info(&self.sysfs_root, &event.interface));

        let old_state = info.link_state;
        info.operstate = event.operstate.clone();
        if event.ifindex != 0 {
            info.ifindex = event.ifindex;
        }

        let traffic = *self
            .traffic_states
            .get(&event.interface)
            .unwrap_or(&TrafficState::Unknown);
        let new_state = compute_fused(&event.operstate, traffic);

        if old_state == new_state {
            return None;
        }
        info.link_state = new_state;
        info.last_updated = Utc::now();

        Some(StateChangeEvent {
            interface: event.interface.clone(),
            old_state,
            new_state,
            interface_info: info.clone(),
            timestamp: info.last_updated,
            source: "link".into(),
        })
    }

    fn apply_traffic(&mut self, event: &TrafficStateChange) -> Option<StateChangeEvent> {
        let mut table = self.interfaces.write().expect("interface table poisoned");
        let info = table
            .entry(event.interface.clone())
            .or_insert_with(|| sampler::read_interface_info(&self.sysfs_root, &event.interface));

        let old_state = info.link_state;

        info.rx_bps = event.metrics.rx_bps;
        info.tx_bps = event.metrics.tx_bps;
        info.rx_bytes_total = event.metrics.rx_bytes_total;
        info.tx_bytes_total = event.metrics.tx_bytes_total;
        info.utilization = event.metrics.utilization;

        self.traffic_states
            .insert(event.interface.clone(), event.new_state);
        let new_state = compute_fused(&info.operstate, event.new_state);

        if old_state == new_state {
            return None;
        }
        info.link_state = new_state;
        info.last_updated = Utc::now();

        Some(StateChangeEvent {
            interface: event.interface.clone(),
            old_state,
            new_state,
            interface_info: info.clone(),
            timestamp: info.last_updated,
            source: "traffic".into(),
        })
    }
}

/// Fusion task: serializes both input streams and emits fused transitions.
pub struct InterfaceMonitor {
    core: FusionCore,
    link_rx: mpsc::Receiver<LinkEvent>,
    traffic_rx: mpsc::Receiver<TrafficStateChange>,
    events_tx: mpsc::Sender<StateChangeEvent>,
}

impl InterfaceMonitor {
    pub fn new(
        sysfs_root: PathBuf,
        link_rx: mpsc::Receiver<LinkEvent>,
        traffic_rx: mpsc::Receiver<TrafficStateChange>,
        events_tx: mpsc::Sender<StateChangeEvent>,
    ) -> Self {
        Self {
            core: FusionCore::new(sysfs_root),
            link_rx,
            traffic_rx,
            events_tx,
        }
    }

    /// Handle to the fused interface table, for status queries.
    pub fn interface_table(&self) -> InterfaceTable {
        self.core.interfaces.clone()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("interface monitor started");
        loop {
            let emitted = tokio::select! {
                Some(event) = self.link_rx.recv() => self.core.apply_link(&event),
                Some(event) = self.traffic_rx.recv() => self.core.apply_traffic(&event),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("interface monitor stopping");
                        return;
                    }
                    None
                }
                else => {
                    tracing::warn!("fusion inputs closed");
                    return;
                }
            };

            if let Some(event) = emitted {
                tracing::info!(
                    interface = %event.interface,
                    old = %event.old_state,
                    new = %event.new_state,
                    source = %event.source,
                    "state change"
                );
                if self.events_tx.send(event).await.is_err() {
                    tracing::warn!("fused event channel closed");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trellis_common::models::TrafficMetrics;

    fn link_event(iface: &str, kind: LinkEventKind, operstate: &str) -> LinkEvent {
        LinkEvent {
            interface: iface.into(),
            ifindex: 2,
            kind,
            operstate: operstate.into(),
            flags: 0,
            timestamp: Utc::now(),
        }
    }

    fn traffic_event(iface: &str, state: TrafficState, rx_bps: f64) -> TrafficStateChange {
        let mut metrics = TrafficMetrics::unknown(iface);
        metrics.state = state;
        metrics.rx_bps = rx_bps;
        TrafficStateChange {
            interface: iface.into(),
            old_state: TrafficState::Unknown,
            new_state: state,
            metrics,
            timestamp: Utc::now(),
        }
    }

    fn core() -> FusionCore {
        // Nonexistent root: static info reads fall back to defaults
        FusionCore::new(PathBuf::from("/nonexistent/net"))
    }

    #[test]
    fn fusion_rule() {
        assert_eq!(compute_fused("down", TrafficState::Active), IfaceState::Down);
        assert_eq!(
            compute_fused("lowerlayerdown", TrafficState::Idle),
            IfaceState::Down
        );
        assert_eq!(
            compute_fused("up", TrafficState::Active),
            IfaceState::UpActive
        );
        assert_eq!(compute_fused("up", TrafficState::Idle), IfaceState::UpIdle);
        assert_eq!(
            compute_fused("up", TrafficState::Unknown),
            IfaceState::UpIdle
        );
    }

    #[test]
    fn operstate_precedence_over_traffic() {
        let mut core = core();
        core.apply_link(&link_event("eth0", LinkEventKind::Added, "up"));
        core.apply_traffic(&traffic_event("eth0", TrafficState::Active, 1000.0));

        // Link down wins regardless of the last traffic sample
        let event = core
            .apply_link(&link_event("eth0", LinkEventKind::Down, "down"))
            .unwrap();
        assert_eq!(event.old_state, IfaceState::UpActive);
        assert_eq!(event.new_state, IfaceState::Down);

        // A traffic sample arriving while down changes nothing
        assert!(core
            .apply_traffic(&traffic_event("eth0", TrafficState::Active, 900.0))
            .is_none());
    }

    #[test]
    fn transition_minimality() {
        let mut core = core();
        let mut emitted = 0;

        // up (unknown traffic) -> up_idle
        if core
            .apply_link(&link_event("eth0", LinkEventKind::Added, "up"))
            .is_some()
        {
            emitted += 1;
        }
        // repeated identical inputs are silent
        for _ in 0..3 {
            if core
                .apply_traffic(&traffic_event("eth0", TrafficState::Idle, 0.0))
                .is_some()
            {
                emitted += 1;
            }
        }
        // active flips once
        if core
            .apply_traffic(&traffic_event("eth0", TrafficState::Active, 10.0))
            .is_some()
        {
            emitted += 1;
        }

        assert_eq!(emitted, 2, "one event per actual fused-state change");
    }

    #[test]
    fn idle_sequence_emits_single_up_idle() {
        // Interface up, five zero-delta samples collapse into one IDLE
        // traffic transition; fused output is a single up_idle event.
        let mut core = core();
        let first = core
            .apply_link(&link_event("eth0", LinkEventKind::Added, "up"))
            .unwrap();
        assert_eq!(first.new_state, IfaceState::UpIdle);

        assert!(core
            .apply_traffic(&traffic_event("eth0", TrafficState::Idle, 0.0))
            .is_none());
    }

    #[test]
    fn activity_then_idle_then_recovery() {
        let mut core = core();
        core.apply_link(&link_event("eth0", LinkEventKind::Added, "up"));

        let active = core
            .apply_traffic(&traffic_event("eth0", TrafficState::Active, 800.0))
            .unwrap();
        assert_eq!(active.new_state, IfaceState::UpActive);
        assert_eq!(active.source, "traffic");

        let idle = core
            .apply_traffic(&traffic_event("eth0", TrafficState::Idle, 0.0))
            .unwrap();
        assert_eq!(idle.new_state, IfaceState::UpIdle);

        // Down, then up with activity restores up_active
        core.apply_link(&link_event("eth0", LinkEventKind::Down, "down"));
        let up = core
            .apply_link(&link_event("eth0", LinkEventKind::Up, "up"))
            .unwrap();
        assert_eq!(up.new_state, IfaceState::UpIdle, "traffic idle after up");
        let active = core
            .apply_traffic(&traffic_event("eth0", TrafficState::Active, 500.0))
            .unwrap();
        assert_eq!(active.new_state, IfaceState::UpActive);
    }

    #[test]
    fn metrics_flow_into_interface_info() {
        let mut core = core();
        core.apply_link(&link_event("eth0", LinkEventKind::Added, "up"));
        let event = core
            .apply_traffic(&traffic_event("eth0", TrafficState::Active, 1234.5))
            .unwrap();
        assert_eq!(event.interface_info.rx_bps, 1234.5);
        assert_eq!(event.interface_info.operstate, "up");
    }

    #[test]
    fn removed_interface_is_dropped_silently() {
        let mut core = core();
        core.apply_link(&link_event("eth0", LinkEventKind::Added, "up"));
        assert!(core
            .apply_link(&link_event("eth0", LinkEventKind::Removed, "notpresent"))
            .is_none());
        assert!(core.interfaces.read().unwrap().is_empty());
    }
}
