//! Group Registry
//!
//! Authoritative group membership for fan-out. One instance is built at
//! startup and shared by `Arc`; connections hold a handle for cleanup on close.
//!
//! All structural changes and member snapshots happen under one lock. Message
//! delivery happens after the lock is released, concurrently per member, with
//! each member's enqueue bounded by a timeout.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionId, Outgoing};
use crate::error::HubError;
use crate::message::{MemberId, OutboundMessage};
use crate::metrics::HubMetrics;

/// Default bound on a single member's enqueue during a broadcast.
pub const DEFAULT_BROADCAST_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Per-member send bound during fan-out
    pub send_timeout: Duration,
    /// Remove a group when its last member leaves. Off by default: groups
    /// otherwise persist once created.
    pub prune_empty_groups: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_BROADCAST_TIMEOUT,
            prune_empty_groups: false,
        }
    }
}

/// Registry entry. Non-owning: the registry never keeps a connection alive.
#[derive(Clone)]
struct Member {
    conn_id: ConnectionId,
    handle: Weak<Connection>,
}

#[derive(Default)]
struct Group {
    members: HashMap<MemberId, Member>,
}

/// Outcome of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Members whose outbound queue accepted the message
    pub delivered: usize,
    /// Members skipped because their queue stayed full past the timeout
    pub dropped: usize,
    /// Members found closed and shut down
    pub evicted: usize,
}

/// Member count of one group, for admin listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub group_id: String,
    pub members: usize,
}

pub struct GroupRegistry {
    groups: RwLock<HashMap<String, Group>>,
    config: RegistryConfig,
    metrics: Arc<HubMetrics>,
}

impl GroupRegistry {
    pub fn new(config: RegistryConfig, metrics: Arc<HubMetrics>) -> Arc<Self> {
        Arc::new(Self {
            groups: RwLock::new(HashMap::new()),
            config,
            metrics,
        })
    }

    pub fn metrics(&self) -> Arc<HubMetrics> {
        self.metrics.clone()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register `conn` as `member_id` in `group_id`, creating the group if
    /// needed. An existing entry for `member_id` is replaced; the connection
    /// it referred to is left open. A connection holds one id per group, so
    /// rejoining under a new id drops its previous entry.
    pub async fn join(
        &self,
        group_id: &str,
        member_id: MemberId,
        conn: &Arc<Connection>,
    ) -> Result<(), HubError> {
        if !conn.is_open() {
            return Err(HubError::ConnectionClosed);
        }

        let previous_id = conn.member_in(group_id).await;

        let replaced = {
            let mut groups = self.groups.write().await;
            let group = groups.entry(group_id.to_string()).or_default();
            if let Some(old_id) = previous_id.filter(|old| *old != member_id) {
                let owned_by_conn = group
                    .members
                    .get(&old_id)
                    .is_some_and(|m| m.conn_id == conn.id());
                if owned_by_conn {
                    group.members.remove(&old_id);
                }
            }
            group.members.insert(
                member_id,
                Member {
                    conn_id: conn.id(),
                    handle: Arc::downgrade(conn),
                },
            )
        };

        if let Some(prev) = replaced.filter(|m| m.conn_id != conn.id()) {
            warn!(
                group = group_id,
                member_id,
                replaced = %prev.conn_id,
                by = %conn.id(),
                "Member id rejoined from another connection; previous connection left open"
            );
            if let Some(prev_conn) = prev.handle.upgrade() {
                prev_conn.forget_membership(group_id, member_id).await;
            }
        }

        conn.record_membership(group_id, member_id).await;

        // Lost a race with close(): its cleanup may have missed this entry.
        if !conn.is_open() {
            self.remove_connection(group_id, member_id, conn.id()).await;
            return Err(HubError::ConnectionClosed);
        }

        debug!(group = group_id, member_id, conn_id = %conn.id(), "Joined group");
        Ok(())
    }

    /// Remove `member_id` from `group_id`. No-op when absent.
    pub async fn leave(&self, group_id: &str, member_id: MemberId) {
        let removed = {
            let mut groups = self.groups.write().await;
            let removed = groups
                .get_mut(group_id)
                .and_then(|group| group.members.remove(&member_id));
            self.prune(&mut groups, group_id);
            removed
        };

        if let Some(member) = removed {
            debug!(group = group_id, member_id, conn_id = %member.conn_id, "Left group");
            if let Some(conn) = member.handle.upgrade() {
                conn.forget_membership(group_id, member_id).await;
            }
        }
    }

    /// Remove the entry only if it still belongs to `conn_id`. Used by
    /// connection cleanup so a newer connection holding the same member id
    /// keeps its place.
    pub(crate) async fn remove_connection(
        &self,
        group_id: &str,
        member_id: MemberId,
        conn_id: ConnectionId,
    ) {
        let mut groups = self.groups.write().await;
        if let Some(group) = groups.get_mut(group_id) {
            let owned = group
                .members
                .get(&member_id)
                .is_some_and(|m| m.conn_id == conn_id);
            if owned {
                group.members.remove(&member_id);
            }
        }
        self.prune(&mut groups, group_id);
    }

    fn prune(&self, groups: &mut HashMap<String, Group>, group_id: &str) {
        if !self.config.prune_empty_groups {
            return;
        }
        if groups.get(group_id).is_some_and(|g| g.members.is_empty()) {
            groups.remove(group_id);
            debug!(group = group_id, "Pruned empty group");
        }
    }

    /// Deliver `message` to every current member of `group_id`.
    ///
    /// Encodes once, snapshots members under the lock, then enqueues to each
    /// member concurrently outside it. A member whose queue stays full past
    /// the send timeout misses this message; a member found closed is closed.
    pub async fn broadcast_to_group(
        &self,
        group_id: &str,
        message: &OutboundMessage,
    ) -> Result<BroadcastReport, HubError> {
        let encoded: Arc<str> = message.encode()?.into();

        let snapshot: Vec<(MemberId, Member)> = {
            let groups = self.groups.read().await;
            match groups.get(group_id) {
                Some(group) => group
                    .members
                    .iter()
                    .map(|(id, member)| (*id, member.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        let timeout = self.config.send_timeout;
        let sends = snapshot
            .into_iter()
            .filter_map(|(member_id, member)| member.handle.upgrade().map(|c| (member_id, c)))
            .map(|(member_id, conn)| {
                let frame = Outgoing::Encoded(encoded.clone());
                async move {
                    let result = conn.enqueue_timeout(frame, timeout).await;
                    (member_id, conn, result)
                }
            });
        let results = futures::future::join_all(sends).await;

        let mut report = BroadcastReport::default();
        for (member_id, conn, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(HubError::SendTimeout(after)) => {
                    report.dropped += 1;
                    warn!(
                        group = group_id,
                        member_id,
                        conn_id = %conn.id(),
                        "Dropped broadcast for slow member after {:?}",
                        after
                    );
                }
                Err(e) => {
                    report.evicted += 1;
                    debug!(group = group_id, member_id, conn_id = %conn.id(), "Closing member: {}", e);
                    conn.close().await;
                }
            }
        }

        self.metrics.broadcast_finished(
            report.delivered as u64,
            report.dropped as u64,
            report.evicted as u64,
        );
        debug!(
            group = group_id,
            delivered = report.delivered,
            dropped = report.dropped,
            evicted = report.evicted,
            "Broadcast complete"
        );
        Ok(report)
    }

    pub async fn contains(&self, group_id: &str, member_id: MemberId) -> bool {
        self.groups
            .read()
            .await
            .get(group_id)
            .is_some_and(|g| g.members.contains_key(&member_id))
    }

    /// Connection currently registered as `member_id`, if it is still alive.
    pub async fn member(&self, group_id: &str, member_id: MemberId) -> Option<Arc<Connection>> {
        self.groups
            .read()
            .await
            .get(group_id)
            .and_then(|g| g.members.get(&member_id))
            .and_then(|m| m.handle.upgrade())
    }

    /// Sorted member ids of `group_id`.
    pub async fn members(&self, group_id: &str) -> Vec<MemberId> {
        let mut ids: Vec<MemberId> = self
            .groups
            .read()
            .await
            .get(group_id)
            .map(|g| g.members.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub async fn member_count(&self, group_id: &str) -> usize {
        self.groups
            .read()
            .await
            .get(group_id)
            .map(|g| g.members.len())
            .unwrap_or(0)
    }

    pub async fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.groups.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn snapshot(&self) -> Vec<GroupSummary> {
        let mut summaries: Vec<GroupSummary> = self
            .groups
            .read()
            .await
            .iter()
            .map(|(group_id, group)| GroupSummary {
                group_id: group_id.clone(),
                members: group.members.len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        summaries
    }

    /// Close every live connection that is a member of any group. Returns how
    /// many connections this call shut down.
    pub async fn close_all(&self) -> usize {
        let connections: HashMap<ConnectionId, Weak<Connection>> = {
            let groups = self.groups.read().await;
            groups
                .values()
                .flat_map(|g| g.members.values())
                .map(|m| (m.conn_id, m.handle.clone()))
                .collect()
        };

        let mut closed = 0;
        for conn in connections.values().filter_map(Weak::upgrade) {
            if conn.close().await {
                closed += 1;
            }
        }
        closed
    }
}
