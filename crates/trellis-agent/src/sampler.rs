//! Periodic counter sampling from the kernel counter tree.
//!
//! Every tick the sampler reads the byte/packet/error counters for each
//! monitored interface from `<root>/<iface>/statistics/`, derives rates
//! and utilization from consecutive samples, and classifies traffic as
//! active or idle. Declaring idle requires `idle_threshold_samples`
//! consecutive zero-delta samples; a single non-zero sample resets the
//! countdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use trellis_common::models::{InterfaceCounters, InterfaceInfo, TrafficMetrics, TrafficState};

use crate::filter::InterfaceFilter;

/// Traffic state transition for one interface.
#[derive(Debug, Clone)]
pub struct TrafficStateChange {
    pub interface: String,
    pub old_state: TrafficState,
    pub new_state: TrafficState,
    pub metrics: TrafficMetrics,
    pub timestamp: DateTime<Utc>,
}

/// Shared, pullable view of the latest metrics per interface.
pub type MetricsTable = Arc<RwLock<HashMap<String, TrafficMetrics>>>;

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub poll_interval: Duration,
    pub idle_threshold_samples: u32,
    /// Root of the kernel counter tree (normally `/sys/class/net`).
    pub sysfs_root: PathBuf,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            idle_threshold_samples: 5,
            sysfs_root: PathBuf::from("/sys/class/net"),
        }
    }
}

/// Polls interface counters and emits [`TrafficStateChange`]s.
pub struct CounterSampler {
    cfg: SamplerConfig,
    filter: InterfaceFilter,
    tx: mpsc::Sender<TrafficStateChange>,
    metrics: MetricsTable,
    previous: HashMap<String, (InterfaceCounters, DateTime<Utc>)>,
    states: HashMap<String, TrafficState>,
    zero_counters: HashMap<String, u32>,
}

impl CounterSampler {
    pub fn new(
        cfg: SamplerConfig,
        filter: InterfaceFilter,
        tx: mpsc::Sender<TrafficStateChange>,
    ) -> Self {
        Self {
            cfg,
            filter,
            tx,
            metrics: Arc::new(RwLock::new(HashMap::new())),
            previous: HashMap::new(),
            states: HashMap::new(),
            zero_counters: HashMap::new(),
        }
    }

    /// Handle to the shared metrics snapshot.
    pub fn metrics_table(&self) -> MetricsTable {
        self.metrics.clone()
    }

    /// Run the poll loop until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.cfg.poll_interval.as_millis() as u64,
            idle_threshold = self.cfg.idle_threshold_samples,
            "counter sampler started"
        );
        let mut interval = tokio::time::interval(self.cfg.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.poll_once().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("counter sampler stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One poll cycle over every monitored interface.
    pub async fn poll_once(&mut self) {
        for iface in self.list_interfaces() {
            let now = Utc::now();
            let Some(counters) = read_counters(&self.cfg.sysfs_root, &iface) else {
                // Interface vanished between listing and reading
                continue;
            };

            if let Some((prev, prev_at)) = self.previous.get(&iface).copied() {
                let metrics = self.compute_metrics(&iface, prev, prev_at, counters, now);
                let old_state = *self.states.get(&iface).unwrap_or(&TrafficState::Unknown);
                let new_state = metrics.state;

                self.metrics
                    .write()
                    .expect("metrics table poisoned")
                    .insert(iface.clone(), metrics.clone());

                if old_state != new_state {
                    self.states.insert(iface.clone(), new_state);
                    tracing::info!(
                        interface = %iface,
                        old = ?old_state,
                        new = ?new_state,
                        "traffic state change"
                    );
                    let change = TrafficStateChange {
                        interface: iface.clone(),
                        old_state,
                        new_state,
                        metrics,
                        timestamp: now,
                    };
                    if self.tx.send(change).await.is_err() {
                        tracing::warn!("traffic event channel closed");
                    }
                }
            }

            self.previous.insert(iface, (counters, now));
        }
    }

    fn list_interfaces(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.cfg.sysfs_root) {
            Ok(e) => e,
            Err(e) => {
                tracing::error!(error = %e, "cannot list counter tree");
                return Vec::new();
            }
        };
        entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| self.filter.matches(name))
            .collect()
    }

    fn compute_metrics(
        &mut self,
        iface: &str,
        prev: InterfaceCounters,
        prev_at: DateTime<Utc>,
        curr: InterfaceCounters,
        now: DateTime<Utc>,
    ) -> TrafficMetrics {
        let mut dt = (now - prev_at).num_microseconds().unwrap_or(0) as f64 / 1e6;
        if dt <= 0.0 {
            // Clock skew; fall back to the nominal interval
            dt = self.cfg.poll_interval.as_secs_f64();
        }

        // Counter wraparound reads as "no delta this tick"
        let delta = |c: u64, p: u64| c.checked_sub(p).unwrap_or(0);
        let rx_bytes_delta = delta(curr.rx_bytes, prev.rx_bytes);
        let tx_bytes_delta = delta(curr.tx_bytes, prev.tx_bytes);
        let rx_packets_delta = delta(curr.rx_packets, prev.rx_packets);
        let tx_packets_delta = delta(curr.tx_packets, prev.tx_packets);

        let rx_bps = rx_bytes_delta as f64 / dt;
        let tx_bps = tx_bytes_delta as f64 / dt;

        let speed_mbps = read_speed(&self.cfg.sysfs_root, iface);
        let utilization = if speed_mbps > 0 {
            let speed_bps = speed_mbps as f64 * 1_000_000.0 / 8.0;
            (rx_bps.max(tx_bps) / speed_bps).min(1.0)
        } else {
            0.0
        };

        let state = if rx_bytes_delta > 0 || tx_bytes_delta > 0 {
            self.zero_counters.insert(iface.to_string(), 0);
            TrafficState::Active
        } else {
            let count = self.zero_counters.entry(iface.to_string()).or_insert(0);
            *count += 1;
            if *count >= self.cfg.idle_threshold_samples {
                TrafficState::Idle
            } else {
                *self.states.get(iface).unwrap_or(&TrafficState::Unknown)
            }
        };

        TrafficMetrics {
            interface: iface.to_string(),
            rx_bps,
            tx_bps,
            rx_pps: rx_packets_delta as f64 / dt,
            tx_pps: tx_packets_delta as f64 / dt,
            rx_bytes_total: curr.rx_bytes,
            tx_bytes_total: curr.tx_bytes,
            state,
            utilization,
            timestamp: now,
        }
    }
}

// ── sysfs readers ───────────────────────────────────────────────────

fn read_value(path: &Path) -> Option<u64> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

/// Read the full counter record, or None if the interface is gone.
fn read_counters(root: &Path, iface: &str) -> Option<InterfaceCounters> {
    let stats = root.join(iface).join("statistics");
    if !stats.is_dir() {
        return None;
    }
    let read = |name: &str| read_value(&stats.join(name)).unwrap_or(0);
    Some(InterfaceCounters {
        rx_bytes: read("rx_bytes"),
        tx_bytes: read("tx_bytes"),
        rx_packets: read("rx_packets"),
        tx_packets: read("tx_packets"),
        rx_errors: read("rx_errors"),
        tx_errors: read("tx_errors"),
        rx_dropped: read("rx_dropped"),
        tx_dropped: read("tx_dropped"),
    })
}

/// Interface speed in Mbps; 0 when unknown (the kernel reports -1).
fn read_speed(root: &Path, iface: &str) -> u32 {
    std::fs::read_to_string(root.join(iface).join("speed"))
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .map(|v| v.max(0) as u32)
        .unwrap_or(0)
}

/// Read static interface information (index, MAC, MTU, speed, operstate).
pub fn read_interface_info(root: &Path, iface: &str) -> InterfaceInfo {
    let base = root.join(iface);
    let mut info = InterfaceInfo::new(iface);

    if let Some(ifindex) = read_value(&base.join("ifindex")) {
        info.ifindex = ifindex as u32;
    }
    if let Ok(mac) = std::fs::read_to_string(base.join("address")) {
        info.mac_address = mac.trim().to_string();
    }
    if let Some(mtu) = read_value(&base.join("mtu")) {
        info.mtu = mtu as u32;
    }
    info.speed_mbps = read_speed(root, iface);
    if let Ok(operstate) = std::fs::read_to_string(base.join("operstate")) {
        info.operstate = operstate.trim().to_string();
    }

    info
}
