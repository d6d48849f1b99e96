//! Optional read-only health/stats endpoint. Off by default; only bound
//! when `--status-addr` is supplied. Not part of the core's failure domain:
//! a panic or bind failure here is logged and does not bring the bridge
//! down.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::connection::ConnectionManager;
use crate::node_cache::NodeCache;
use crate::shutdown::Shutdown;
use crate::traceroute::TracerouteManager;

#[derive(Clone)]
struct AppState {
    connection: Arc<ConnectionManager>,
    node_cache: Arc<NodeCache>,
    traceroute: Arc<TracerouteManager>,
}

#[derive(Debug, Serialize)]
struct HealthBody {
    connected: bool,
    connected_node_id: Option<String>,
    error_count: u32,
    known_nodes: usize,
    traceroute_queue_len: usize,
}

pub fn spawn(
    addr: SocketAddr,
    connection: Arc<ConnectionManager>,
    node_cache: Arc<NodeCache>,
    traceroute: Arc<TracerouteManager>,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    let state = AppState {
        connection,
        node_cache,
        traceroute,
    };
    let app = Router::new().route("/healthz", get(healthz)).with_state(state);

    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, %addr, "failed to bind status endpoint, disabling it");
                return;
            }
        };
        info!(%addr, "status endpoint listening");
        let shutdown_signal = async move { shutdown.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
        {
            error!(error = %e, "status endpoint exited with error");
        }
    })
}

async fn healthz(State(state): State<AppState>) -> Json<HealthBody> {
    let info = state.connection.connection_info().await;
    Json(HealthBody {
        connected: matches!(info.state, crate::connection::ConnectionState::Connected),
        connected_node_id: info.connected_node_id,
        error_count: info.error_count,
        known_nodes: state.node_cache.len().await,
        traceroute_queue_len: state.traceroute.queue_len(),
    })
}
