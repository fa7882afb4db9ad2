//! Per-connection serve loop.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::dispatch::MessageDispatcher;

/// Receive and dispatch messages from `conn` until it closes or a dispatch
/// fails, then close it. Returns once the connection is closed.
pub async fn run_session(conn: Arc<Connection>, dispatcher: Arc<MessageDispatcher>) {
    while let Ok(msg) = conn.receive().await {
        let service = msg.service.clone();
        match dispatcher.dispatch(&conn, msg).await {
            Ok(outcome) => {
                debug!(conn_id = %conn.id(), service = %service, ?outcome, "Dispatched")
            }
            Err(e) if e.is_closed() => break,
            Err(e) => {
                warn!(conn_id = %conn.id(), service = %service, "Dispatch failed: {}", e);
                break;
            }
        }
    }

    conn.close().await;
}
