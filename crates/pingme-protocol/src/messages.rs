//! Chat message records and their JSON projections.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric user id issued by the identity store.
pub type UserId = i64;

/// Longest accepted message body, in characters.
pub const MAX_BODY_CHARS: usize = 4096;

// ============================================================================
// Message ids
// ============================================================================

/// Returned when a string is not a well-formed message id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid message id: {0:?}")]
pub struct InvalidMessageId(pub String);

/// Opaque message identifier assigned by the store on insert.
///
/// Always `msg_` followed by 12 characters of the URL-safe nanoid alphabet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId(String);

impl MessageId {
    pub const PREFIX: &'static str = "msg_";
    pub const RANDOM_LEN: usize = 12;

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid(s: &str) -> bool {
        let Some(random) = s.strip_prefix(Self::PREFIX) else {
            return false;
        };
        random.len() == Self::RANDOM_LEN
            && random
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    }
}

impl FromStr for MessageId {
    type Err = InvalidMessageId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidMessageId(s.to_string()))
        }
    }
}

impl TryFrom<String> for MessageId {
    type Error = InvalidMessageId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if Self::is_valid(&value) {
            Ok(Self(value))
        } else {
            Err(InvalidMessageId(value))
        }
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Records
// ============================================================================

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(rename = "message", alias = "body")]
    pub body: String,
    /// Seconds since the Unix epoch, stamped by the server on acceptance.
    pub created_at: i64,
}

/// A message joined with the usernames of both participants.
///
/// Never stored. Usernames are empty when they could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender_username: String,
    pub receiver_id: UserId,
    pub receiver_username: String,
    #[serde(rename = "message", alias = "body")]
    pub body: String,
    pub created_at: i64,
}

impl MessageView {
    pub fn new(message: Message, sender_username: String, receiver_username: String) -> Self {
        Self {
            id: message.id,
            sender_id: message.sender_id,
            sender_username,
            receiver_id: message.receiver_id,
            receiver_username,
            body: message.body,
            created_at: message.created_at,
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Body of `POST /chat`.
///
/// Any `sender_id` in the payload is ignored; the sender is always the
/// authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateChatRequest {
    pub receiver_id: UserId,
    #[serde(rename = "message", alias = "body")]
    pub body: String,
}

/// A text frame read from a chat WebSocket. Same shape as a REST create.
pub type InboundFrame = CreateChatRequest;

/// Body of `PUT /chat/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateChatRequest {
    #[serde(rename = "message", alias = "body")]
    pub body: String,
}

/// Outcome of a successful update or delete, serialized as `{"status": ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ChatStatus {
    Updated,
    Deleted,
}
