//! Hub Server - WebSocket front end for the group messaging hub
//!
//! Wires a [`group_hub::GroupRegistry`] and [`group_hub::MessageDispatcher`]
//! behind an axum router: `/ws` for clients, a small admin API, and health
//! and metrics probes.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use group_hub::{ConnectionConfig, GroupRegistry, HubMetrics, MessageDispatcher};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use uuid::Uuid;

pub mod config;
pub mod handlers;
pub mod ws_transport;

use crate::config::HubConfig;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<GroupRegistry>,
    pub dispatcher: Arc<MessageDispatcher>,
    /// Applied to every accepted WebSocket
    pub connection_config: ConnectionConfig,
    pub metrics: Arc<HubMetrics>,
    /// Cancelled once the listener stops; closes connections outside any group.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: &HubConfig) -> Self {
        let metrics = HubMetrics::new();
        let registry = GroupRegistry::new(config.registry.clone(), metrics.clone());
        let dispatcher = MessageDispatcher::new(registry.clone(), config.default_group.clone())
            .with_authenticator(config.authenticator());
        Self {
            registry,
            dispatcher: Arc::new(dispatcher),
            connection_config: config.connection.clone(),
            metrics,
            shutdown: CancellationToken::new(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handlers::websocket_handler))
        .route("/api/groups", get(handlers::list_groups_handler))
        .route("/api/groups/{group_id}/push", post(handlers::push_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then close every live connection.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = state.registry.clone();
    let connections_shutdown = state.shutdown.clone();

    let server_result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error");

    info!("Closing live connections...");
    let closed = registry.close_all().await;
    connections_shutdown.cancel();
    info!("Closed {} group members", closed);

    info!("Shutdown complete");
    server_result
}
