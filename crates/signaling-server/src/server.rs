//! HTTP server: the signaling WebSocket, a health probe and the static client

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use rvoip_infra_common::{Error, ErrorExt, Result};
use rvoip_signaling_core::{CallOrchestrator, MediaBackend};

use crate::config::ServerConfig;
use crate::transport::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<CallOrchestrator>,
}

pub fn build_router(orchestrator: Arc<CallOrchestrator>, static_dir: Option<&Path>) -> Router {
    let router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(AppState { orchestrator });

    let router = match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };
    router.layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let stats = state.orchestrator.stats().await;
    Json(json!({
        "status": "ok",
        "activeCalls": stats.active_calls,
        "ringingCalls": stats.ringing_calls,
        "sessions": stats.sessions.active_sessions,
        "sessionsInCall": stats.sessions.sessions_in_call,
    }))
}

/// Signaling server bound to one media backend
pub struct SignalingServer {
    config: ServerConfig,
    orchestrator: Arc<CallOrchestrator>,
}

impl SignalingServer {
    pub fn new(config: ServerConfig, backend: Arc<dyn MediaBackend>) -> Self {
        let orchestrator = CallOrchestrator::new(backend, config.broker.clone());
        Self { config, orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<CallOrchestrator> {
        &self.orchestrator
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(Error::from)
            .with_context("signaling-server", format!("bind {}", self.config.listen_addr))
    }

    /// Serve until `shutdown` resolves, then end every call
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = listener.local_addr()?;
        let router = build_router(self.orchestrator.clone(), self.config.static_dir.as_deref());
        info!("Signaling server listening on {}", addr);

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(Error::from);

        self.orchestrator.shutdown().await;
        info!("Signaling server stopped");
        served
    }
}
