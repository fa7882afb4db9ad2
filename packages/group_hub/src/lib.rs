//! Group Hub - connection lifecycle and group broadcast engine
//!
//! This crate owns everything between a framed transport and a chat-style
//! group: per-client connection actors with bounded queues and heartbeats, a
//! registry of named groups, and a dispatcher that routes JSON messages by
//! service name. It has no HTTP dependencies; the server crate adapts
//! WebSockets into a [`Transport`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use group_hub::{
//!     Connection, ConnectionConfig, GroupRegistry, HubMetrics, MessageDispatcher,
//!     RegistryConfig, memory, run_session,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = GroupRegistry::new(RegistryConfig::default(), HubMetrics::new());
//!     let dispatcher = Arc::new(MessageDispatcher::new(registry.clone(), "lobby"));
//!
//!     let (transport, mut client) = memory::pair(64);
//!     let conn = Connection::spawn(transport, registry, ConnectionConfig::default());
//!     tokio::spawn(run_session(conn, dispatcher));
//!
//!     client.send_text(r#"{"service":"in_group","data":{"id":7,"username":"alice"}}"#);
//!     if let Some(notice) = client.next_application_message().await {
//!         println!("{:?}", notice.data);
//!     }
//! }
//! ```

pub mod auth;
mod connection;
mod dispatch;
mod error;
pub mod message;
mod metrics;
mod registry;
mod session;
pub mod transport;

pub use auth::{AllowAll, Authenticator, Identity, StaticTokens};
pub use connection::{
    Connection, ConnectionConfig, ConnectionId, ConnectionState, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_QUEUE_CAPACITY,
};
pub use dispatch::{DispatchOutcome, MessageDispatcher};
pub use error::{AuthError, HubError};
pub use message::{
    GroupNotice, InboundMessage, MemberId, MessageType, OutboundMessage, ServiceRequest,
};
pub use metrics::{HubMetrics, MetricsSnapshot};
pub use registry::{
    BroadcastReport, DEFAULT_BROADCAST_TIMEOUT, GroupRegistry, GroupSummary, RegistryConfig,
};
pub use session::run_session;
pub use transport::{Frame, Transport, memory};
