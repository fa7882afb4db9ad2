//! Message dispatcher
//!
//! Authenticates an inbound message, narrows its payload to a typed
//! [`ServiceRequest`], and runs the matching action against the sending
//! connection and the group registry.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::auth::{AllowAll, Authenticator};
use crate::connection::Connection;
use crate::error::HubError;
use crate::message::{
    ECHO_TEXT_ACK, EchoPayload, GroupNotice, InboundMessage, MemberId, OutboundMessage,
    ServiceRequest, codes,
};
use crate::registry::{BroadcastReport, GroupRegistry};

/// What a dispatched message ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A direct reply went to the sender (echo or payload error).
    Replied,
    Joined {
        member_id: MemberId,
        report: BroadcastReport,
    },
    Left {
        member_id: MemberId,
        report: BroadcastReport,
    },
    Broadcast(BroadcastReport),
    /// Unknown service, non-positive join id, or exit without membership.
    Ignored,
    /// The authenticator refused the token; an auth-failure reply was sent.
    Rejected,
}

pub struct MessageDispatcher {
    registry: Arc<GroupRegistry>,
    authenticator: Arc<dyn Authenticator>,
    default_group: String,
}

impl MessageDispatcher {
    pub fn new(registry: Arc<GroupRegistry>, default_group: impl Into<String>) -> Self {
        Self {
            registry,
            authenticator: Arc::new(AllowAll),
            default_group: default_group.into(),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn default_group(&self) -> &str {
        &self.default_group
    }

    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    /// Route one message. Errors mean a reply or join could not be carried
    /// out because the connection closed; callers should stop serving it.
    pub async fn dispatch(
        &self,
        conn: &Arc<Connection>,
        msg: InboundMessage,
    ) -> Result<DispatchOutcome, HubError> {
        let InboundMessage {
            service,
            data,
            token,
        } = msg;

        let identity = match self.authenticator.authenticate(&token) {
            Ok(identity) => identity,
            Err(e) => {
                self.registry.metrics().auth_rejected();
                warn!(conn_id = %conn.id(), service = %service, "Rejected message: {}", e);
                conn.send(OutboundMessage::error(codes::UNAUTHORIZED, e.to_string()))
                    .await?;
                return Ok(DispatchOutcome::Rejected);
            }
        };

        let request = match ServiceRequest::parse(&service, data) {
            Ok(request) => request,
            Err(e) => {
                debug!(conn_id = %conn.id(), "{}", e);
                let reply = format!("invalid {} payload", service);
                conn.send(OutboundMessage::error(codes::BAD_REQUEST, reply))
                    .await?;
                return Ok(DispatchOutcome::Replied);
            }
        };

        match request {
            ServiceRequest::Echo(EchoPayload::Text(_)) => {
                conn.send(OutboundMessage::message(ECHO_TEXT_ACK)).await?;
                Ok(DispatchOutcome::Replied)
            }
            ServiceRequest::Echo(EchoPayload::Record(record)) => {
                let data =
                    serde_json::to_value(&record).map_err(|e| HubError::Encode(e.to_string()))?;
                conn.send(OutboundMessage::message(data)).await?;
                Ok(DispatchOutcome::Replied)
            }
            ServiceRequest::JoinGroup(request) => {
                let member_id = identity.member_id().unwrap_or(request.id);
                if member_id <= 0 {
                    debug!(conn_id = %conn.id(), member_id, "Ignoring join without a positive id");
                    return Ok(DispatchOutcome::Ignored);
                }

                self.registry
                    .join(&self.default_group, member_id, conn)
                    .await?;
                let notice = GroupNotice::Joined {
                    id: member_id,
                    username: request.username,
                };
                let report = self
                    .registry
                    .broadcast_to_group(&self.default_group, &notice.into_message())
                    .await?;
                Ok(DispatchOutcome::Joined { member_id, report })
            }
            ServiceRequest::ExitGroup => {
                // Non-members get no leave and no notice.
                let Some(member_id) = conn.member_in(&self.default_group).await else {
                    return Ok(DispatchOutcome::Ignored);
                };

                self.registry.leave(&self.default_group, member_id).await;
                let notice = GroupNotice::Left { id: member_id };
                let report = self
                    .registry
                    .broadcast_to_group(&self.default_group, &notice.into_message())
                    .await?;
                Ok(DispatchOutcome::Left { member_id, report })
            }
            ServiceRequest::Broadcast(data) => {
                let report = self
                    .registry
                    .broadcast_to_group(&self.default_group, &OutboundMessage::message(data))
                    .await?;
                Ok(DispatchOutcome::Broadcast(report))
            }
            ServiceRequest::Unknown(service) => {
                debug!(conn_id = %conn.id(), service = %service, "Ignoring unknown service");
                Ok(DispatchOutcome::Ignored)
            }
        }
    }
}
