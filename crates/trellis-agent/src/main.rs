//! Trellis Host Agent
//!
//! Lightweight daemon running on each monitored host.
//!
//! - Fuses kernel link events with counter sampling into per-interface
//!   active/idle/down state (`--mode sysfs`, the default)
//! - Or derives the same states from cluster flow records (`--mode flow`),
//!   optionally enriched by the endpoint registry (`--kube-endpoints`)
//! - Publishes every state transition to the control plane over HTTP or
//!   a persistent WebSocket, buffering across outages

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use trellis_agent::filter::InterfaceFilter;
use trellis_agent::publisher::{self, EventPublisher, EventSink, HttpSink, WsSink};
use trellis_agent::{endpoints, flow_watch, fusion, link_watch, sampler};

/// Discovery backend for interface/endpoint detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Kernel link events + counter sampling (standalone hosts).
    Sysfs,
    /// Cluster flow observer (Kubernetes deployments).
    Flow,
}

/// Trellis host monitoring agent.
#[derive(Parser, Debug)]
#[command(name = "trellis-agent", about = "Trellis host monitoring agent")]
struct Cli {
    /// Discovery mode.
    #[arg(long, value_enum, default_value_t = Mode::Sysfs, env = "DISCOVERY_MODE")]
    mode: Mode,

    /// HTTP endpoint for publishing events.
    #[arg(long, env = "API_URL")]
    api_url: Option<String>,

    /// WebSocket endpoint for publishing events (takes precedence).
    #[arg(long, env = "WS_URL")]
    ws_url: Option<String>,

    /// Counter polling interval in milliseconds (sysfs mode).
    #[arg(long, default_value_t = 100, env = "POLL_INTERVAL_MS")]
    poll_interval_ms: u64,

    /// Consecutive zero-delta samples before an interface is idle.
    #[arg(long, default_value_t = 5)]
    idle_threshold_samples: u32,

    /// Comma-separated interface allow-list (sysfs mode).
    #[arg(long, env = "INTERFACES")]
    interfaces: Option<String>,

    /// Flow observer address (flow mode).
    #[arg(long, default_value = "hubble-relay:4245", env = "OBSERVER_ADDR")]
    observer_addr: String,

    /// Seconds without a forwarded record before a flow is idle.
    #[arg(long, default_value_t = 5.0, env = "IDLE_TIMEOUT_SECONDS")]
    idle_timeout_secs: f64,

    /// Namespace filter for the endpoint registry (flow mode).
    #[arg(long, env = "NAMESPACE_FILTER")]
    namespace: Option<String>,

    /// Watch cluster endpoints and publish their changes (flow mode).
    #[arg(long, default_value_t = false)]
    kube_endpoints: bool,

    /// Events buffered across publish outages before dropping oldest.
    #[arg(long, default_value_t = 1000)]
    buffer_size: usize,

    /// Events per publish batch (1 = no batching).
    #[arg(long, default_value_t = 1)]
    batch_size: usize,
}

fn build_sink(cli: &Cli) -> EventSink {
    if let Some(ws_url) = &cli.ws_url {
        tracing::info!(url = %ws_url, "publishing over WebSocket");
        EventSink::WebSocket(WsSink::new(ws_url))
    } else if let Some(api_url) = &cli.api_url {
        tracing::info!(url = %api_url, "publishing over HTTP");
        EventSink::Http(HttpSink::new(
            api_url,
            Duration::from_secs(5),
            3,
            Duration::from_secs(1),
        ))
    } else {
        tracing::info!("no API configured, events go to an in-process queue");
        let (tx, mut rx) = mpsc::channel(1024);
        // Drain and discard so the queue never jams
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        EventSink::Memory(tx)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(mode = ?cli.mode, "trellis-agent starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Publisher pipeline: everything funnels through one channel
    let (publish_tx, publish_rx) = mpsc::channel::<serde_json::Value>(256);
    let sink = build_sink(&cli);
    let event_publisher = EventPublisher::new(sink, cli.buffer_size, cli.batch_size);
    let publisher_handle = tokio::spawn(publisher::run(
        event_publisher,
        publish_rx,
        Duration::from_secs(5),
        shutdown_rx.clone(),
    ));

    match cli.mode {
        Mode::Sysfs => run_sysfs_mode(&cli, publish_tx, shutdown_rx.clone()).await?,
        Mode::Flow => run_flow_mode(&cli, publish_tx, shutdown_rx.clone()).await?,
    }

    // ── Shutdown handling ───────────────────────────────────────
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            true
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
            false
        }
    };

    let _ = shutdown_tx.send(true);
    // Give the publisher a moment for its final buffer flush
    let _ = tokio::time::timeout(Duration::from_secs(5), publisher_handle).await;

    tracing::info!("trellis-agent stopped");
    if interrupted {
        std::process::exit(130);
    }
    Ok(())
}

/// Wire up link watcher + counter sampler + fusion.
async fn run_sysfs_mode(
    cli: &Cli,
    publish_tx: mpsc::Sender<serde_json::Value>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let filter = match &cli.interfaces {
        Some(list) => InterfaceFilter::allow_list(
            list.split(',').map(|s| s.trim().to_string()).collect(),
        ),
        None => InterfaceFilter::default(),
    };

    let (link_tx, link_rx) = mpsc::channel(64);
    let (traffic_tx, traffic_rx) = mpsc::channel(256);
    let (fused_tx, mut fused_rx) = mpsc::channel(256);

    let watcher = link_watch::LinkWatcher::new(filter.clone(), link_tx, shutdown.clone());
    tokio::spawn(async move {
        if let Err(e) = watcher.run().await {
            tracing::error!(error = %e, "link watcher failed");
        }
    });

    let sampler_cfg = sampler::SamplerConfig {
        poll_interval: Duration::from_millis(cli.poll_interval_ms),
        idle_threshold_samples: cli.idle_threshold_samples,
        ..Default::default()
    };
    let counter_sampler = sampler::CounterSampler::new(sampler_cfg, filter, traffic_tx);
    let metrics_table = counter_sampler.metrics_table();
    tokio::spawn(counter_sampler.run(shutdown.clone()));

    let monitor = fusion::InterfaceMonitor::new(
        PathBuf::from("/sys/class/net"),
        link_rx,
        traffic_rx,
        fused_tx,
    );
    let interface_table = monitor.interface_table();
    tokio::spawn(monitor.run(shutdown.clone()));

    // Periodic status line from the pullable snapshots
    let mut status_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let interfaces = interface_table.read().expect("interface table poisoned");
                    let active = interfaces
                        .values()
                        .filter(|i| i.link_state == trellis_common::models::IfaceState::UpActive)
                        .count();
                    let sampled = metrics_table.read().expect("metrics table poisoned").len();
                    tracing::info!(
                        interfaces = interfaces.len(),
                        active,
                        sampled,
                        "interface status"
                    );
                }
                _ = status_shutdown.changed() => {
                    if *status_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    // Fused transitions -> wire events -> publisher
    tokio::spawn(async move {
        while let Some(event) = fused_rx.recv().await {
            let wire = event.to_interface_event();
            match serde_json::to_value(&wire) {
                Ok(value) => {
                    if publish_tx.send(value).await.is_err() {
                        return;
                    }
                }
                Err(e) => tracing::error!(error = %e, "event serialization failed"),
            }
        }
    });

    Ok(())
}

/// Wire up the flow observer and, optionally, the endpoint registry.
async fn run_flow_mode(
    cli: &Cli,
    publish_tx: mpsc::Sender<serde_json::Value>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (flow_tx, mut flow_rx) = mpsc::channel(256);
    let watcher = flow_watch::FlowWatcher::new(
        &cli.observer_addr,
        Duration::from_secs_f64(cli.idle_timeout_secs),
        flow_tx,
    );
    let flow_table = watcher.table();
    tokio::spawn(watcher.run(shutdown.clone()));

    // Periodic status line from the flow table
    let mut status_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let states = flow_table.lock().await.states();
                    let active = states
                        .values()
                        .filter(|s| **s == trellis_common::flow::FlowState::Active)
                        .count();
                    tracing::info!(flows = states.len(), active, "flow status");
                }
                _ = status_shutdown.changed() => {
                    if *status_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    // Flow transitions are published as interface events keyed by the
    // flow key, so links registered under that name resolve in the store;
    // unmatched keys are ignored server-side.
    let flow_publish = publish_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = flow_rx.recv().await {
            let wire = trellis_common::protocol::InterfaceEvent {
                interface: event.flow_key.clone(),
                ifindex: 0,
                old_state: event.old_state.to_string(),
                new_state: event.new_state.to_string(),
                operstate: "unknown".into(),
                timestamp: event.timestamp,
                source: "flow".into(),
                metrics: None,
            };
            match serde_json::to_value(&wire) {
                Ok(value) => {
                    if flow_publish.send(value).await.is_err() {
                        return;
                    }
                }
                Err(e) => tracing::error!(error = %e, "event serialization failed"),
            }
        }
    });

    if cli.kube_endpoints {
        let client = kube::Client::try_default().await?;
        let (endpoint_tx, mut endpoint_rx) = mpsc::channel(256);
        let registry = endpoints::EndpointRegistry::new(cli.namespace.clone(), endpoint_tx);
        tokio::spawn(registry.run(client, shutdown.clone()));

        tokio::spawn(async move {
            while let Some(event) = endpoint_rx.recv().await {
                match serde_json::to_value(&event) {
                    Ok(value) => {
                        if publish_tx.send(value).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "event serialization failed"),
                }
            }
        });
    }

    Ok(())
}
