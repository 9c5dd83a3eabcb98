//! Client-facing WebSocket server.
//!
//! A single `/agent` route (§6): the pool gates admission, then hands the
//! upgraded socket to the session supervisor (`crate::session`). Grounded
//! on this codebase's prior `Router`/`TraceLayer`/`ServerState` wiring,
//! trimmed to the one route this service exposes — no auth/device/HTTP
//! admin routers, which are explicitly out of scope (§1).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::pool::{ConnectionPool, PoolConfig, PoolSignal};

#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub pool: ConnectionPool,
}

/// Build the router and bind/serve it until a shutdown signal fires.
pub async fn start(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let pool = ConnectionPool::new(PoolConfig {
        max_connections: config.max_ws_connections,
        heartbeat_interval: std::time::Duration::from_secs(config.ws_heartbeat_interval_secs),
        connection_timeout: std::time::Duration::from_secs(config.ws_connection_timeout_secs),
        resource_cleanup_interval: std::time::Duration::from_secs(60),
    });
    let maintenance = pool.spawn_maintenance();

    let state = ServerState {
        config: config.clone(),
        http_client: reqwest::Client::new(),
        pool: pool.clone(),
    };

    let app = Router::new()
        .route("/agent", get(agent_ws_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = config.bind_addr.parse().context("invalid BIND_ADDR")?;
    info!(%addr, "binding client-facing websocket server");
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind listen socket")?;

    let serve = axum::serve(listener, app.into_make_service());
    tokio::select! {
        result = serve => { result.context("server loop exited with an error")?; }
        _ = shutdown_signal() => {
            info!("shutdown signal received, closing all connections");
            pool.shutdown().await;
        }
    }

    maintenance.abort();
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn agent_ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state))
}

async fn handle_agent_socket(socket: axum::extract::ws::WebSocket, state: ServerState) {
    let conn_id = Uuid::new_v4().to_string();
    let (signal_tx, signal_rx) = tokio::sync::mpsc::unbounded_channel::<PoolSignal>();

    if state.pool.admit(conn_id.clone(), signal_tx).await.is_err() {
        // Overload (§7): refuse by dropping the upgraded socket immediately.
        return;
    }

    let session_id = conn_id.clone();
    crate::session::run(
        socket,
        conn_id,
        session_id,
        state.config,
        state.http_client,
        state.pool,
        signal_rx,
    )
    .await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
