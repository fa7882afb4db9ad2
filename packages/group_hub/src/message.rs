//! Wire message types
//!
//! Inbound: `{"service": string, "data": any, "token": string}`
//! Outbound: `{"code": int, "data": any, "error": string, "message_type": 0|1}`
//!
//! `data` is open-ended on the wire. [`ServiceRequest`] narrows it into a typed
//! request per service so the dispatcher never inspects JSON shapes itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubError;

pub const SERVICE_ECHO: &str = "echo.test";
pub const SERVICE_IN_GROUP: &str = "in_group";
pub const SERVICE_EXIT_GROUP: &str = "exit_group";
pub const SERVICE_MESSAGE: &str = "message";

/// Reply codes carried in [`OutboundMessage::code`].
pub mod codes {
    pub const OK: i64 = 0;
    /// The service is known but the payload does not fit its contract.
    pub const BAD_REQUEST: i64 = 400;
    pub const UNAUTHORIZED: i64 = 401;
    /// The frame could not be decoded as a message at all.
    pub const MALFORMED: i64 = 500;
}

/// Acknowledgement sent for a text `echo.test` request.
pub const ECHO_TEXT_ACK: &str = "received text message";

/// Member identifier inside a group.
pub type MemberId = i64;

/// Message received from a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundMessage {
    pub service: String,
    pub data: Value,
    pub token: String,
}

impl InboundMessage {
    pub fn new(service: impl Into<String>, data: Value) -> Self {
        Self {
            service: service.into(),
            data,
            token: String::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Decode a raw frame payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, HubError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Outbound message kind, serialized as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum MessageType {
    Ping,
    Message,
}

impl From<MessageType> for i8 {
    fn from(kind: MessageType) -> i8 {
        match kind {
            MessageType::Ping => 0,
            MessageType::Message => 1,
        }
    }
}

impl TryFrom<i8> for MessageType {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Ping),
            1 => Ok(MessageType::Message),
            other => Err(format!("unknown message_type {}", other)),
        }
    }
}

/// Message sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub code: i64,
    pub data: Value,
    pub error: String,
    pub message_type: MessageType,
}

impl OutboundMessage {
    /// Heartbeat frame.
    pub fn ping() -> Self {
        Self {
            code: codes::OK,
            data: Value::String("ping".to_string()),
            error: String::new(),
            message_type: MessageType::Ping,
        }
    }

    /// Successful application message carrying `data`.
    pub fn message(data: impl Into<Value>) -> Self {
        Self {
            code: codes::OK,
            data: data.into(),
            error: String::new(),
            message_type: MessageType::Message,
        }
    }

    /// Error reply with no payload.
    pub fn error(code: i64, error: impl Into<String>) -> Self {
        Self {
            code,
            data: Value::Null,
            error: error.into(),
            message_type: MessageType::Message,
        }
    }

    pub fn encode(&self) -> Result<String, HubError> {
        serde_json::to_string(self).map_err(|e| HubError::Encode(e.to_string()))
    }

    pub fn is_ping(&self) -> bool {
        self.message_type == MessageType::Ping
    }
}

/// Structured `echo.test` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoRecord {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EchoPayload {
    Text(String),
    Record(EchoRecord),
}

/// `in_group` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinRequest {
    pub id: MemberId,
    pub username: String,
}

/// A decoded request, one variant per recognised service.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceRequest {
    Echo(EchoPayload),
    JoinGroup(JoinRequest),
    ExitGroup,
    Broadcast(Value),
    /// Unrecognised service name. Dispatch treats this as a no-op.
    Unknown(String),
}

impl ServiceRequest {
    /// Apply the payload contract for `service` to `data`.
    pub fn parse(service: &str, data: Value) -> Result<Self, HubError> {
        match service {
            SERVICE_ECHO => match data {
                Value::String(text) => Ok(ServiceRequest::Echo(EchoPayload::Text(text))),
                Value::Object(_) => serde_json::from_value::<EchoRecord>(data)
                    .map(|record| ServiceRequest::Echo(EchoPayload::Record(record)))
                    .map_err(|e| invalid_payload(service, e.to_string())),
                other => Err(invalid_payload(
                    service,
                    format!("expected a string or an object, got {}", json_kind(&other)),
                )),
            },
            SERVICE_IN_GROUP => serde_json::from_value::<JoinRequest>(data)
                .map(ServiceRequest::JoinGroup)
                .map_err(|e| invalid_payload(service, e.to_string())),
            SERVICE_EXIT_GROUP => Ok(ServiceRequest::ExitGroup),
            SERVICE_MESSAGE => Ok(ServiceRequest::Broadcast(data)),
            other => Ok(ServiceRequest::Unknown(other.to_string())),
        }
    }
}

fn invalid_payload(service: &str, reason: String) -> HubError {
    HubError::InvalidPayload {
        service: service.to_string(),
        reason,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Membership change announced to a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GroupNotice {
    Joined { id: MemberId, username: String },
    Left { id: MemberId },
}

impl GroupNotice {
    pub fn into_message(self) -> OutboundMessage {
        // Serializing a plain tagged enum cannot fail.
        let data = serde_json::to_value(&self).unwrap_or(Value::Null);
        OutboundMessage::message(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_missing_fields_default() {
        let msg = InboundMessage::decode(br#"{"service":"message","data":"hi"}"#).unwrap();
        assert_eq!(msg.service, "message");
        assert_eq!(msg.data, json!("hi"));
        assert_eq!(msg.token, "");

        let empty = InboundMessage::decode(b"{}").unwrap();
        assert_eq!(empty, InboundMessage::default());
    }

    #[test]
    fn inbound_rejects_non_objects() {
        assert!(matches!(
            InboundMessage::decode(b"not json"),
            Err(HubError::Decode(_))
        ));
        assert!(InboundMessage::decode(b"[1,2]").is_err());
        assert!(InboundMessage::decode(br#"{"service":5}"#).is_err());
    }

    #[test]
    fn outbound_wire_shape() {
        let encoded = OutboundMessage::message("hi").encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            json!({"code": 0, "data": "hi", "error": "", "message_type": 1})
        );

        let ping: Value = serde_json::from_str(&OutboundMessage::ping().encode().unwrap()).unwrap();
        assert_eq!(ping["message_type"], json!(0));
    }

    #[test]
    fn message_type_rejects_unknown_values() {
        let result: Result<OutboundMessage, _> = serde_json::from_value(
            json!({"code": 0, "data": null, "error": "", "message_type": 7}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn echo_text_and_record() {
        assert_eq!(
            ServiceRequest::parse(SERVICE_ECHO, json!("hello")).unwrap(),
            ServiceRequest::Echo(EchoPayload::Text("hello".into()))
        );
        assert_eq!(
            ServiceRequest::parse(SERVICE_ECHO, json!({"id": 3, "name": "bob"})).unwrap(),
            ServiceRequest::Echo(EchoPayload::Record(EchoRecord {
                id: 3,
                name: "bob".into()
            }))
        );
    }

    #[test]
    fn echo_wrong_shape_is_invalid_payload() {
        let err = ServiceRequest::parse(SERVICE_ECHO, json!({"id": "three"})).unwrap_err();
        assert!(matches!(err, HubError::InvalidPayload { ref service, .. } if service == SERVICE_ECHO));

        let err = ServiceRequest::parse(SERVICE_ECHO, json!(42)).unwrap_err();
        assert!(err.to_string().contains("a number"));
    }

    #[test]
    fn join_request_defaults_missing_fields() {
        let parsed = ServiceRequest::parse(SERVICE_IN_GROUP, json!({"id": 7})).unwrap();
        assert_eq!(
            parsed,
            ServiceRequest::JoinGroup(JoinRequest {
                id: 7,
                username: String::new()
            })
        );
        assert!(ServiceRequest::parse(SERVICE_IN_GROUP, json!("seven")).is_err());
    }

    #[test]
    fn unknown_service_is_not_an_error() {
        assert_eq!(
            ServiceRequest::parse("does.not.exist", Value::Null).unwrap(),
            ServiceRequest::Unknown("does.not.exist".into())
        );
    }

    #[test]
    fn notices_are_tagged() {
        let joined = GroupNotice::Joined {
            id: 7,
            username: "alice".into(),
        }
        .into_message();
        assert_eq!(
            joined.data,
            json!({"event": "joined", "id": 7, "username": "alice"})
        );
        assert_eq!(joined.message_type, MessageType::Message);

        let left = GroupNotice::Left { id: 7 }.into_message();
        assert_eq!(left.data, json!({"event": "left", "id": 7}));
    }
}
