use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{CoreError, CoreResult};
use crate::id::MessageId;
use crate::position::GlobalPosition;

/// Partition used when callers do not pick one.
pub const DEFAULT_PARTITION: &str = "global";

/// Whether a message records a fact or a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Event,
    Command,
}

impl MessageKind {
    /// Single-character storage code.
    pub fn code(self) -> &'static str {
        match self {
            MessageKind::Event => "E",
            MessageKind::Command => "C",
        }
    }

    pub fn from_code(code: &str) -> CoreResult<Self> {
        match code {
            "E" => Ok(MessageKind::Event),
            "C" => Ok(MessageKind::Command),
            other => Err(CoreError::decoding(format!("unknown message kind '{other}'"))),
        }
    }
}

/// A message ready to be appended to a stream (not yet assigned any position).
///
/// Typed domain events are expected to serialize adjacently tagged
/// (`#[serde(tag = "type", content = "data")]`), which is what [`Message::event`]
/// and [`RecordedMessage::decode`] rely on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub kind: MessageKind,
    pub message_type: String,
    pub data: JsonValue,
    pub metadata: JsonValue,
    pub schema_version: u32,
}

impl Message {
    pub fn new(message_type: impl Into<String>, data: JsonValue) -> Self {
        Self {
            message_id: MessageId::new(),
            kind: MessageKind::Event,
            message_type: message_type.into(),
            data,
            metadata: JsonValue::Object(Map::new()),
            schema_version: 1,
        }
    }

    pub fn command(message_type: impl Into<String>, data: JsonValue) -> Self {
        Self {
            kind: MessageKind::Command,
            ..Self::new(message_type, data)
        }
    }

    /// Encode a typed, adjacently tagged event.
    pub fn event<E>(event: &E) -> CoreResult<Self>
    where
        E: Serialize,
    {
        let value = serde_json::to_value(event).map_err(|e| CoreError::encoding(e.to_string()))?;
        let JsonValue::Object(mut fields) = value else {
            return Err(CoreError::encoding("event must serialize to an object"));
        };
        let message_type = match fields.remove("type") {
            Some(JsonValue::String(t)) => t,
            _ => return Err(CoreError::encoding("event is missing a string 'type' tag")),
        };
        let data = fields
            .remove("data")
            .unwrap_or_else(|| JsonValue::Object(Map::new()));
        Ok(Self::new(message_type, data))
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn with_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }
}

/// A message persisted in the log (assigned stream and global positions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedMessage {
    pub message_id: MessageId,
    pub kind: MessageKind,
    pub message_type: String,
    pub data: JsonValue,
    pub metadata: JsonValue,
    pub schema_version: u32,

    pub stream_name: String,
    /// 1-based position within the stream.
    pub stream_position: u64,
    pub partition: String,
    pub global_position: GlobalPosition,
    pub created_at: DateTime<Utc>,
}

impl RecordedMessage {
    /// Decode into a typed, adjacently tagged event.
    pub fn decode<E>(&self) -> CoreResult<E>
    where
        E: DeserializeOwned,
    {
        let mut envelope = Map::new();
        envelope.insert("type".to_string(), JsonValue::String(self.message_type.clone()));
        envelope.insert("data".to_string(), self.data.clone());
        serde_json::from_value(JsonValue::Object(envelope)).map_err(|e| {
            CoreError::decoding(format!(
                "{} at global position {}: {e}",
                self.message_type, self.global_position
            ))
        })
    }

    pub fn is_event(&self) -> bool {
        self.kind == MessageKind::Event
    }
}
