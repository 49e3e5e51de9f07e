//! Wire records and consumer-facing event types.
//!
//! Inbound frames carry a JSON record (`id`, `type`, `data`, `timestamp`)
//! that is converted into a [`StreamEvent`]. Outbound requests are described
//! by [`StreamRequest`].

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::stream::codec::Frame;

/// Discriminator for a [`StreamEvent`].
///
/// The set is open: kinds the transport does not know are carried through
/// as [`EventKind::Other`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Thought,
    Answer,
    Status,
    Complete,
    Error,
    AgentStart,
    AgentEnd,
    System,
    Heartbeat,
    Other(String),
}

impl EventKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Thought => "thought",
            Self::Answer => "answer",
            Self::Status => "status",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::AgentStart => "agent_start",
            Self::AgentEnd => "agent_end",
            Self::System => "system",
            Self::Heartbeat => "heartbeat",
            Self::Other(name) => name,
        }
    }

    /// Returns true for kinds after which the server closes the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        match value {
            "thought" => Self::Thought,
            "answer" => Self::Answer,
            "status" => Self::Status,
            "complete" => Self::Complete,
            "error" => Self::Error,
            "agent_start" => Self::AgentStart,
            "agent_end" => Self::AgentEnd,
            "system" => Self::System,
            "heartbeat" => Self::Heartbeat,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of information delivered to message listeners.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    /// Position token used as the resume cursor. Opaque; compared only for
    /// equality.
    pub id: Option<String>,
    /// Event discriminator.
    pub kind: EventKind,
    /// Kind-specific data, not interpreted by the transport.
    pub payload: Value,
    /// When the server produced the event. Display only.
    pub emitted_at: Option<DateTime<Utc>>,
    /// Conversation identifier announced by the server, if the frame carried one.
    pub conversation_id: Option<String>,
}

impl StreamEvent {
    pub fn is_heartbeat(&self) -> bool {
        self.kind == EventKind::Heartbeat
    }

    /// Builds an event from a decoded frame.
    ///
    /// The frame-level `id:` wins over an `id` embedded in the record. When the
    /// record has no `type`, the frame's `event:` name is used instead.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let record: WireRecord = serde_json::from_str(frame.data.trim())?;

        let kind = record
            .kind
            .as_deref()
            .or(frame.event.as_deref())
            .map(EventKind::from)
            .ok_or(ProtocolError::MissingKind)?;

        let id = frame
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| record.id.as_ref().and_then(position_token));

        let payload = record.data.unwrap_or(Value::Null);
        let conversation_id = record.conversation_id.or_else(|| {
            payload
                .get("conversation_id")
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        Ok(Self {
            id,
            kind,
            emitted_at: record.timestamp.as_ref().and_then(parse_timestamp),
            payload,
            conversation_id,
        })
    }
}

/// Errors raised while turning a frame into a [`StreamEvent`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame data is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame record has no type and the frame has no event name")]
    MissingKind,

    #[error("frame is not valid utf-8")]
    InvalidUtf8,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    conversation_id: Option<String>,
}

fn position_token(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Value::Number(number) => number
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}

/// Body of the stream-initiating request.
///
/// `conversation_id` is always present (null until the server assigned one);
/// `resume_path` and `cursor` are omitted when unknown.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamRequest {
    pub prompt: String,
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub resume: bool,
}
