use axum::{
    Json,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use group_hub::{Connection, OutboundMessage, run_session};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::AppState;
use crate::ws_transport::WsTransport;

/// WebSocket endpoint - one connection actor and session per client
pub async fn websocket_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let conn = Connection::spawn(
            WsTransport::new(socket),
            state.registry.clone(),
            state.connection_config.clone(),
        );
        let watcher = conn.clone();
        let shutdown = state.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    watcher.close().await;
                }
                _ = watcher.wait_closed() => {}
            }
        });
        run_session(conn, state.dispatcher.clone()).await;
    })
}

/// List groups with their member counts
pub async fn list_groups_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.snapshot().await)
}

/// Admin push - broadcast an arbitrary JSON body to a group
pub async fn push_handler(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    match state
        .registry
        .broadcast_to_group(&group_id, &OutboundMessage::message(body))
        .await
    {
        Ok(report) => {
            info!(
                group = %group_id,
                delivered = report.delivered,
                "Admin push"
            );
            Json(report).into_response()
        }
        Err(e) => {
            warn!(group = %group_id, "Admin push failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    pub groups: usize,
    pub default_group: String,
    pub broadcast_timeout_ms: u64,
    pub uptime_secs: u64,
}

/// Health check endpoint - returns hub status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.metrics.snapshot();
    Json(HealthStatus {
        status: "healthy".to_string(),
        connections: metrics.connections.active,
        groups: state.registry.group_ids().await.len(),
        default_group: state.dispatcher.default_group().to_string(),
        broadcast_timeout_ms: state.registry.config().send_timeout.as_millis() as u64,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Metrics endpoint - returns detailed hub metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
