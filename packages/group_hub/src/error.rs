//! Error types for connection, registry and dispatch operations.

/// Errors surfaced by the hub's public operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The connection has shut down; the operation was not performed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// A bounded send did not find queue capacity in time. The message was
    /// discarded for this connection, which stays open.
    #[error("send timed out after {0:?}")]
    SendTimeout(std::time::Duration),

    /// An inbound frame was not a valid message envelope.
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    /// The envelope decoded but its `data` does not fit the service contract.
    #[error("invalid payload for {service}: {reason}")]
    InvalidPayload { service: String, reason: String },

    /// An outbound message could not be serialized.
    #[error("failed to encode outbound message: {0}")]
    Encode(String),
}

impl HubError {
    pub fn is_closed(&self) -> bool {
        matches!(self, HubError::ConnectionClosed)
    }
}

/// Rejection produced by an [`Authenticator`](crate::auth::Authenticator).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("invalid token")]
    InvalidToken,

    #[error("access denied: {0}")]
    Denied(String),
}
