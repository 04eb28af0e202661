//! Live channel wire protocol.
//!
//! Every frame is a JSON object `{ "type", "data", "timestamp" }` where
//! `timestamp` is Unix milliseconds. `ping`/`pong` frames are heartbeat only.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use herald_common::types::RenderedMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    /// Server status, e.g. the connection acknowledgement.
    System,
    Notification,
    Ping,
    Pong,
    /// Non-fatal error report, either direction.
    Error,
    /// Client reports a message as read.
    Read,
    /// Client reports a click on a message.
    Click,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameType,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default = "now_millis")]
    pub timestamp: i64,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{kind:?} frame is missing a valid message_id")]
    MissingMessageId { kind: FrameType },
}

impl Frame {
    pub fn new(kind: FrameType, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: now_millis(),
        }
    }

    /// Connection acknowledgement sent right after the handshake.
    pub fn ack(connection_id: Uuid, user_id: Uuid) -> Self {
        Self::new(
            FrameType::System,
            json!({
                "status": "connected",
                "connection_id": connection_id,
                "user_id": user_id,
            }),
        )
    }

    pub fn notification(message: &RenderedMessage) -> Self {
        Self::new(
            FrameType::Notification,
            json!({
                "message_id": message.message_id,
                "title": message.title,
                "body": message.body,
                "priority": message.priority,
                "category": message.category,
                "data": message.data,
            }),
        )
    }

    pub fn ping() -> Self {
        Self::new(FrameType::Ping, serde_json::Value::Null)
    }

    pub fn pong() -> Self {
        Self::new(FrameType::Pong, serde_json::Value::Null)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(FrameType::Error, json!({ "error": message.into() }))
    }

    pub fn parse(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> String {
        // a Frame is plain JSON data, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// `message_id` carried by read/click frames.
    pub fn message_id(&self) -> Result<Uuid, FrameError> {
        self.data
            .get("message_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or(FrameError::MissingMessageId { kind: self.kind })
    }

    /// Error text carried by an `error` frame.
    pub fn error_text(&self) -> Option<&str> {
        self.data.get("error").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::types::Priority;

    #[test]
    fn test_notification_frame_shape() {
        let message = RenderedMessage {
            message_id: Uuid::new_v4(),
            title: "Breaking".into(),
            body: "Body".into(),
            priority: Priority::Urgent,
            category: Some("news".into()),
            data: json!({"instrument_code": "600519"}),
        };
        let value: serde_json::Value =
            serde_json::from_str(&Frame::notification(&message).to_text()).unwrap();
        assert_eq!(value["type"], "notification");
        assert_eq!(value["data"]["title"], "Breaking");
        assert_eq!(value["data"]["priority"], "urgent");
        assert_eq!(value["data"]["message_id"], message.message_id.to_string());
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_parse_client_frames() {
        let id = Uuid::new_v4();
        let read = Frame::parse(&format!(r#"{{"type":"read","data":{{"message_id":"{id}"}}}}"#)).unwrap();
        assert_eq!(read.kind, FrameType::Read);
        assert_eq!(read.message_id().unwrap(), id);

        let pong = Frame::parse(r#"{"type":"pong","timestamp":1}"#).unwrap();
        assert_eq!(pong.kind, FrameType::Pong);
        assert!(pong.message_id().is_err());

        let err = Frame::parse(r#"{"type":"error","data":{"error":"bad render"}}"#).unwrap();
        assert_eq!(err.error_text(), Some("bad render"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Frame::parse("{").is_err());
        assert!(Frame::parse(r#"{"type":"subscribe"}"#).is_err());
        assert!(Frame::parse(r#"{"data":{}}"#).is_err());
    }
}
