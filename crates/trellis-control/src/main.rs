//! Trellis Control Plane
//!
//! Single binary that runs:
//! - REST API for topology, links, events, and labs
//! - WebSocket endpoint for event subscribers (visualization front-ends)
//! - WebSocket endpoint for monitoring agents
//! - Lab orchestration against the clabernetes Topology CRD

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use trellis_control::labs::{LabBackend, LabOrchestrator};
use trellis_control::state::AppState;
use trellis_control::{api, bus, k8s, store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Lab backend ─────────────────────────────────────────────
    let backend = match kube::Client::try_default().await {
        Ok(client) => {
            tracing::info!("kubernetes client ready, labs deploy to the cluster");
            LabBackend::Kube(k8s::TopologyCrdClient::new(client))
        }
        Err(e) => {
            tracing::warn!(error = %e, "no kubernetes cluster, labs stay in-process");
            LabBackend::in_process()
        }
    };

    // ── Shared state ────────────────────────────────────────────
    let bus = bus::EventBus::default();
    let store = store::TopologyStore::new(bus.clone());
    let labs = LabOrchestrator::new(backend, store.clone());
    let state = AppState::new(store, bus, labs);

    // ── Router ──────────────────────────────────────────────────
    let app = Router::new()
        .nest("/api", api::router())
        .merge(api::root_router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // ── Listen ──────────────────────────────────────────────────
    let addr: SocketAddr = std::env::var("LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8000".into())
        .parse()?;

    tracing::info!("trellis-control listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(flag).await;
        })
        .await?;

    tracing::info!("trellis-control stopped");
    if interrupted.load(Ordering::Relaxed) {
        std::process::exit(130);
    }
    Ok(())
}

async fn shutdown_signal(interrupted: Arc<AtomicBool>) {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("sigterm handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            interrupted.store(true, Ordering::Relaxed);
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
