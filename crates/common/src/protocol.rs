//! Wire protocol frames for the chat session channel
//!
//! Every frame is a flat JSON object carrying a `type` discriminator plus
//! type-specific fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Path prefix of the chat endpoint; the session id is appended to it.
pub const CHAT_PATH_PREFIX: &str = "/ws/chat";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Frame has no string `type` field")]
    MissingType,
    #[error("Malformed `{kind}` frame: {source}")]
    MalformedFields {
        kind: String,
        source: serde_json::Error,
    },
}

/// Frames produced by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Message {
        content: String,
        message_id: String,
        timestamp: DateTime<Utc>,
    },

    Typing {
        is_typing: bool,
    },

    Heartbeat,
}

impl OutboundFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::Message { .. } => "message",
            OutboundFrame::Typing { .. } => "typing",
            OutboundFrame::Heartbeat => "heartbeat",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames produced by the chat service.
///
/// Frames the client only re-publishes keep their full JSON object so
/// subscribers see them verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    ConnectionEstablished(Value),

    /// Acknowledgment of a `message` frame
    MessageReceived(Value),

    HeartbeatAck,

    StreamStart {
        message_id: String,
        timestamp: Option<String>,
    },

    StreamToken {
        message_id: String,
        token: String,
        timestamp: Option<String>,
    },

    StreamEnd {
        message_id: String,
        /// Final text as declared by the service
        full_response: Option<String>,
        timestamp: Option<String>,
    },

    StreamError {
        message_id: String,
        error: Value,
        timestamp: Option<String>,
    },

    Error(Value),

    Broadcast(Value),

    /// Any frame type this client does not know about
    Other {
        kind: String,
        payload: Value,
    },
}

impl InboundFrame {
    pub fn kind(&self) -> &str {
        match self {
            InboundFrame::ConnectionEstablished(_) => "connection_established",
            InboundFrame::MessageReceived(_) => "message_received",
            InboundFrame::HeartbeatAck => "heartbeat_ack",
            InboundFrame::StreamStart { .. } => "stream_start",
            InboundFrame::StreamToken { .. } => "stream_token",
            InboundFrame::StreamEnd { .. } => "stream_end",
            InboundFrame::StreamError { .. } => "stream_error",
            InboundFrame::Error(_) => "error",
            InboundFrame::Broadcast(_) => "broadcast",
            InboundFrame::Other { kind, .. } => kind,
        }
    }
}

#[derive(Deserialize)]
struct StreamStartFields {
    message_id: String,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct StreamTokenFields {
    message_id: String,
    token: String,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct StreamEndFields {
    message_id: String,
    #[serde(default)]
    full_response: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Deserialize)]
struct StreamErrorFields {
    message_id: String,
    #[serde(default)]
    error: Value,
    #[serde(default)]
    timestamp: Option<String>,
}

fn fields<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::MalformedFields {
        kind: kind.to_string(),
        source,
    })
}

/// Parse one inbound text frame.
pub fn parse_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    let frame = match kind.as_str() {
        "connection_established" => InboundFrame::ConnectionEstablished(value),
        "message_received" => InboundFrame::MessageReceived(value),
        "heartbeat_ack" => InboundFrame::HeartbeatAck,
        "stream_start" => {
            let f: StreamStartFields = fields(&kind, value)?;
            InboundFrame::StreamStart {
                message_id: f.message_id,
                timestamp: f.timestamp,
            }
        }
        "stream_token" => {
            let f: StreamTokenFields = fields(&kind, value)?;
            InboundFrame::StreamToken {
                message_id: f.message_id,
                token: f.token,
                timestamp: f.timestamp,
            }
        }
        "stream_end" => {
            let f: StreamEndFields = fields(&kind, value)?;
            InboundFrame::StreamEnd {
                message_id: f.message_id,
                full_response: f.full_response,
                timestamp: f.timestamp,
            }
        }
        "stream_error" => {
            let f: StreamErrorFields = fields(&kind, value)?;
            InboundFrame::StreamError {
                message_id: f.message_id,
                error: f.error,
                timestamp: f.timestamp,
            }
        }
        "error" => InboundFrame::Error(value),
        "broadcast" => InboundFrame::Broadcast(value),
        _ => InboundFrame::Other {
            kind,
            payload: value,
        },
    };

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_frames_are_flat_objects() {
        let heartbeat: Value = serde_json::from_str(&OutboundFrame::Heartbeat.to_json().unwrap()).unwrap();
        assert_eq!(heartbeat, json!({ "type": "heartbeat" }));

        let typing: Value = serde_json::from_str(
            &OutboundFrame::Typing { is_typing: true }.to_json().unwrap(),
        ).unwrap();
        assert_eq!(typing, json!({ "type": "typing", "is_typing": true }));

        let msg = OutboundFrame::Message {
            content: "Hello, world!".to_string(),
            message_id: "m-1".to_string(),
            timestamp: Utc::now(),
        };
        let encoded: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(encoded["type"], "message");
        assert_eq!(encoded["content"], "Hello, world!");
        assert_eq!(encoded["message_id"], "m-1");
        assert!(encoded["timestamp"].is_string());
    }

    #[test]
    fn test_parse_stream_frames() {
        let frame = parse_frame(r#"{"type":"stream_token","message_id":"m1","token":"Hel","timestamp":"2024-01-01T00:00:00Z"}"#).unwrap();
        assert_eq!(frame, InboundFrame::StreamToken {
            message_id: "m1".to_string(),
            token: "Hel".to_string(),
            timestamp: Some("2024-01-01T00:00:00Z".to_string()),
        });

        let frame = parse_frame(r#"{"type":"stream_end","message_id":"m1","full_response":"Hello!"}"#).unwrap();
        match frame {
            InboundFrame::StreamEnd { message_id, full_response, .. } => {
                assert_eq!(message_id, "m1");
                assert_eq!(full_response.as_deref(), Some("Hello!"));
            }
            other => panic!("Wrong frame type: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_kept_verbatim() {
        let frame = parse_frame(r#"{"type":"presence","user":"ada"}"#).unwrap();
        assert_eq!(frame.kind(), "presence");
        match frame {
            InboundFrame::Other { payload, .. } => assert_eq!(payload["user"], "ada"),
            other => panic!("Wrong frame type: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(matches!(parse_frame("{not json"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(parse_frame(r#"{"message_id":"m1"}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(parse_frame("[1, 2, 3]"), Err(ProtocolError::MissingType)));
        assert!(matches!(
            parse_frame(r#"{"type":"stream_token","message_id":"m1"}"#),
            Err(ProtocolError::MalformedFields { .. })
        ));
    }
}
