//! Connection actor
//!
//! One [`Connection`] per client. Construction spawns three tasks:
//!
//! - read: transport → decode → inbound queue (decode errors get a direct reply)
//! - write: outbound queue → encode → transport (the only writer)
//! - heartbeat: enqueues a ping every interval until the connection closes
//!
//! Any pipeline failure, an explicit [`Connection::close`], or the transport
//! ending moves the connection `Open → Closing → Closed`. The transition runs
//! once: the winner tears down the transport, removes registry memberships,
//! then fires the close signal every blocked `send`/`receive` observes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::HubError;
use crate::message::{InboundMessage, MemberId, OutboundMessage, codes};
use crate::metrics::HubMetrics;
use crate::registry::GroupRegistry;
use crate::transport::{Frame, Transport};

/// Capacity of the inbound and outbound queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// How long the write pipeline waits for the transport to close cleanly.
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Reply text for frames that are not valid message envelopes.
pub const MALFORMED_MESSAGE: &str = "malformed message";

/// Unique identifier for a connection
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-connection tunables.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub heartbeat_interval: Duration,
    pub close_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: DEFAULT_QUEUE_CAPACITY,
            outbound_capacity: DEFAULT_QUEUE_CAPACITY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Item on the outbound queue.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Message(OutboundMessage),
    /// Already-serialized frame shared across a broadcast.
    Encoded(Arc<str>),
}

impl Outgoing {
    fn into_frame(self) -> Result<Frame, HubError> {
        match self {
            Outgoing::Message(msg) => Ok(Frame::Text(msg.encode()?)),
            Outgoing::Encoded(text) => Ok(Frame::Text(text.to_string())),
        }
    }
}

#[derive(Default)]
struct Membership {
    /// Id from the most recent join
    member_id: Option<MemberId>,
    /// group id → member id used in that group
    groups: HashMap<String, MemberId>,
}

pub struct Connection {
    id: ConnectionId,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<Outgoing>,
    /// Fired first on close; read and write pipelines release the transport.
    teardown: CancellationToken,
    /// The close signal. Fired once, after registry cleanup.
    closed: CancellationToken,
    state: AtomicU8,
    membership: Mutex<Membership>,
    registry: Arc<GroupRegistry>,
    metrics: Arc<HubMetrics>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Take ownership of `transport` and start the read, write and heartbeat
    /// pipelines. Must be called within a tokio runtime.
    pub fn spawn<T, E>(
        transport: T,
        registry: Arc<GroupRegistry>,
        config: ConnectionConfig,
    ) -> Arc<Connection>
    where
        T: Transport<E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let metrics = registry.metrics();

        let conn = Arc::new(Connection {
            id: ConnectionId::new(),
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            teardown: CancellationToken::new(),
            closed: CancellationToken::new(),
            state: AtomicU8::new(STATE_OPEN),
            membership: Mutex::new(Membership::default()),
            registry,
            metrics,
        });
        conn.metrics.connection_opened();
        info!(conn_id = %conn.id, "Connection opened");

        let (sink, stream) = transport.split();
        tokio::spawn(conn.clone().read_loop(stream, inbound_tx));
        tokio::spawn(
            conn.clone()
                .write_loop(sink, outbound_rx, config.close_timeout),
        );
        tokio::spawn(conn.clone().heartbeat_loop(config.heartbeat_interval));

        conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => ConnectionState::Open,
            STATE_CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// True once the close signal has fired.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the close signal fires.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await
    }

    /// Member id assigned by the most recent group join.
    pub async fn member_id(&self) -> Option<MemberId> {
        self.membership.lock().await.member_id
    }

    /// Member id this connection uses in `group_id`, if it is a member.
    pub async fn member_in(&self, group_id: &str) -> Option<MemberId> {
        self.membership.lock().await.groups.get(group_id).copied()
    }

    pub async fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.membership.lock().await.groups.keys().cloned().collect();
        groups.sort();
        groups
    }

    /// Wait for the next inbound message. Returns `ConnectionClosed` once the
    /// close signal has fired, even if messages are still queued.
    pub async fn receive(&self) -> Result<InboundMessage, HubError> {
        let mut inbound = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(HubError::ConnectionClosed),
            guard = self.inbound_rx.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(HubError::ConnectionClosed),
            msg = inbound.recv() => msg.ok_or(HubError::ConnectionClosed),
        }
    }

    /// Queue `msg` for the write pipeline. Blocks while the outbound queue is
    /// full; returns `ConnectionClosed` if the close signal fires first.
    pub async fn send(&self, msg: OutboundMessage) -> Result<(), HubError> {
        self.enqueue(Outgoing::Message(msg)).await
    }

    /// Like [`send`](Self::send) but gives up after `timeout`, discarding the
    /// message. The connection stays open.
    pub async fn send_timeout(
        &self,
        msg: OutboundMessage,
        timeout: Duration,
    ) -> Result<(), HubError> {
        self.enqueue_timeout(Outgoing::Message(msg), timeout).await
    }

    pub(crate) async fn enqueue(&self, item: Outgoing) -> Result<(), HubError> {
        if self.closed.is_cancelled() {
            return Err(HubError::ConnectionClosed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(HubError::ConnectionClosed),
            sent = self.outbound_tx.send(item) => sent.map_err(|_| HubError::ConnectionClosed),
        }
    }

    pub(crate) async fn enqueue_timeout(
        &self,
        item: Outgoing,
        timeout: Duration,
    ) -> Result<(), HubError> {
        match tokio::time::timeout(timeout, self.enqueue(item)).await {
            Ok(result) => result,
            Err(_) => Err(HubError::SendTimeout(timeout)),
        }
    }

    /// Shut the connection down. Safe to call any number of times from any
    /// task; returns `true` only for the call that performed the shutdown.
    pub async fn close(&self) -> bool {
        if self
            .state
            .compare_exchange(
                STATE_OPEN,
                STATE_CLOSING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        self.teardown.cancel();

        let groups = std::mem::take(&mut self.membership.lock().await.groups);
        for (group_id, member_id) in groups {
            self.registry
                .remove_connection(&group_id, member_id, self.id)
                .await;
        }

        self.state.store(STATE_CLOSED, Ordering::Release);
        self.closed.cancel();
        self.metrics.connection_closed();
        info!(conn_id = %self.id, "Connection closed");
        true
    }

    pub(crate) async fn record_membership(&self, group_id: &str, member_id: MemberId) {
        let mut membership = self.membership.lock().await;
        membership.member_id = Some(member_id);
        membership.groups.insert(group_id.to_string(), member_id);
    }

    pub(crate) async fn forget_membership(&self, group_id: &str, member_id: MemberId) {
        let mut membership = self.membership.lock().await;
        if membership.groups.get(group_id) == Some(&member_id) {
            membership.groups.remove(group_id);
        }
    }

    async fn read_loop<S, E>(self: Arc<Self>, mut stream: S, inbound_tx: mpsc::Sender<InboundMessage>)
    where
        S: Stream<Item = Result<Frame, E>> + Unpin,
        E: fmt::Display,
    {
        loop {
            let next = tokio::select! {
                _ = self.teardown.cancelled() => break,
                next = stream.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!(conn_id = %self.id, "Transport read failed: {}", e);
                    break;
                }
                None => {
                    debug!(conn_id = %self.id, "Transport stream ended");
                    break;
                }
            };

            let Some(payload) = frame.payload() else {
                if frame == Frame::Close {
                    debug!(conn_id = %self.id, "Peer sent close frame");
                    break;
                }
                continue;
            };

            match InboundMessage::decode(payload) {
                Ok(msg) => {
                    self.metrics.message_received();
                    tokio::select! {
                        biased;
                        _ = self.closed.cancelled() => break,
                        queued = inbound_tx.send(msg) => {
                            if queued.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.metrics.decode_error();
                    warn!(conn_id = %self.id, "Failed to decode inbound frame: {}", e);
                    let reply = OutboundMessage::error(codes::MALFORMED, MALFORMED_MESSAGE);
                    if self.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.close().await;
    }

    async fn write_loop<K, E>(
        self: Arc<Self>,
        mut sink: K,
        mut outbound_rx: mpsc::Receiver<Outgoing>,
        close_timeout: Duration,
    ) where
        K: Sink<Frame, Error = E> + Unpin,
        E: fmt::Display,
    {
        loop {
            let item = tokio::select! {
                _ = self.teardown.cancelled() => break,
                item = outbound_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let frame = match item.into_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(conn_id = %self.id, "{}", e);
                    break;
                }
            };

            let written = tokio::select! {
                _ = self.teardown.cancelled() => break,
                written = sink.send(frame) => written,
            };
            if let Err(e) = written {
                warn!(conn_id = %self.id, "Transport write failed: {}", e);
                break;
            }
        }

        self.close().await;
        if tokio::time::timeout(close_timeout, sink.close())
            .await
            .is_err()
        {
            debug!(conn_id = %self.id, "Transport did not close within {:?}", close_timeout);
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.send(OutboundMessage::ping()).await.is_err() {
                break;
            }
        }
        debug!(conn_id = %self.id, "Heartbeat stopped");
    }
}
