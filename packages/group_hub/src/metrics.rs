//! Hub metrics for observability
//!
//! Counters are updated by connections, the registry and the dispatcher, and
//! exposed as a serializable snapshot.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct HubMetrics {
    // Connection metrics
    pub active_connections: AtomicU64,
    pub total_connections: AtomicU64,

    // Message metrics
    /// Inbound messages decoded and queued for dispatch
    pub messages_received: AtomicU64,
    /// Frames that failed to decode
    pub decode_errors: AtomicU64,
    /// Messages rejected by the authenticator
    pub auth_rejections: AtomicU64,

    // Fan-out metrics
    pub broadcasts: AtomicU64,
    /// Per-member deliveries that reached the member's outbound queue
    pub broadcast_deliveries: AtomicU64,
    /// Per-member deliveries discarded after the send timeout
    pub broadcast_drops: AtomicU64,
    /// Members closed because a broadcast found them closed
    pub broadcast_evictions: AtomicU64,

    start_time: Option<Instant>,
}

impl HubMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_rejected(&self) {
        self.auth_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast_finished(&self, delivered: u64, dropped: u64, evicted: u64) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.broadcast_deliveries
            .fetch_add(delivered, Ordering::Relaxed);
        self.broadcast_drops.fetch_add(dropped, Ordering::Relaxed);
        self.broadcast_evictions
            .fetch_add(evicted, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                decode_errors: self.decode_errors.load(Ordering::Relaxed),
                auth_rejections: self.auth_rejections.load(Ordering::Relaxed),
            },
            broadcasts: BroadcastMetrics {
                total: self.broadcasts.load(Ordering::Relaxed),
                delivered: self.broadcast_deliveries.load(Ordering::Relaxed),
                dropped: self.broadcast_drops.load(Ordering::Relaxed),
                evicted: self.broadcast_evictions.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub broadcasts: BroadcastMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub decode_errors: u64,
    pub auth_rejections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMetrics {
    pub total: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub evicted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_counters() {
        let metrics = HubMetrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections.active, 1);
        assert_eq!(snap.connections.total, 2);
    }

    #[test]
    fn broadcast_counters_accumulate() {
        let metrics = HubMetrics::new();
        metrics.broadcast_finished(3, 1, 0);
        metrics.broadcast_finished(2, 0, 1);

        let snap = metrics.snapshot();
        assert_eq!(snap.broadcasts.total, 2);
        assert_eq!(snap.broadcasts.delivered, 5);
        assert_eq!(snap.broadcasts.dropped, 1);
        assert_eq!(snap.broadcasts.evicted, 1);
    }
}
