use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, MessageKind, UserId};

/// A persisted chat message as served by the history endpoint and echoed on
/// the realtime channel. Identity is `id`; two payloads with equal ids refer
/// to the same message regardless of which channel delivered them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender_username: String,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_username: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Frames the server pushes over the realtime channel, discriminated by
/// `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ChatMessage {
        message: MessagePayload,
        sender_id: UserId,
        sender_username: String,
    },
    MessageSent {
        message: MessagePayload,
    },
    TypingIndicator {
        sender_id: UserId,
        sender_username: String,
        is_typing: bool,
    },
    ReadReceipt {
        message_id: MessageId,
        read_by_id: UserId,
        read_by_username: String,
    },
    Connection {
        status: ConnectionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
    },
    Error {
        error: String,
    },
}

const KNOWN_FRAME_TYPES: [&str; 6] = [
    "chat_message",
    "message_sent",
    "typing_indicator",
    "read_receipt",
    "connection",
    "error",
];

/// Result of classifying one inbound text frame. A recognized `type` with a
/// malformed payload is a parse error; an unrecognized `type` is passed
/// through with its raw payload so consumers can observe it.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Known(ServerFrame),
    Unknown {
        kind: String,
        raw: serde_json::Value,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameParseError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no `type` discriminator")]
    MissingType,
    #[error("malformed `{kind}` frame: {source}")]
    MalformedPayload {
        kind: String,
        source: serde_json::Error,
    },
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, FrameParseError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or(FrameParseError::MissingType)?
            .to_string();

        if !KNOWN_FRAME_TYPES.contains(&kind.as_str()) {
            return Ok(Self::Unknown { kind, raw: value });
        }

        match serde_json::from_value::<ServerFrame>(value) {
            Ok(frame) => Ok(Self::Known(frame)),
            Err(source) => Err(FrameParseError::MalformedPayload { kind, source }),
        }
    }
}

/// Frames the client writes to the realtime channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    ChatMessage {
        receiver_id: UserId,
        content: String,
        message_type: MessageKind,
    },
    Typing {
        receiver_id: UserId,
        is_typing: bool,
    },
    ReadReceipt {
        message_id: MessageId,
    },
}

// REST bodies.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDetails {
    /// The login endpoint serializes this id as a JSON string.
    #[serde(with = "id_as_string")]
    pub id: UserId,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(rename = "userDetails")]
    pub user_details: UserDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh: String,
}

/// Renewal response. `refresh` is present only when the backend rotates
/// refresh tokens; absent means the old one stays valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub chatroom_id: i64,
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPresence {
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<UserPresence>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDirectory {
    pub success: bool,
    pub data: Vec<UserSummary>,
    pub count: i64,
}

mod id_as_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use crate::domain::UserId;

    pub fn serialize<S: Serializer>(id: &UserId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.0.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<UserId, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Num(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(id) => Ok(UserId(id)),
            Raw::Text(text) => text
                .parse::<i64>()
                .map(UserId)
                .map_err(|_| de::Error::custom(format!("invalid user id: {text:?}"))),
        }
    }
}
