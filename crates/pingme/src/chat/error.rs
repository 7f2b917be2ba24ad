//! Chat error taxonomy.

use std::time::Duration;

use thiserror::Error;

use crate::identity::IdentityError;

/// Result type for message store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for chat service operations.
pub type ChatResult<T> = Result<T, ChatError>;

/// Errors raised by a message store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be turned back into a message.
    #[error("corrupt message record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Errors surfaced by [`ChatService`](super::ChatService).
#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed or missing input.
    #[error("{0}")]
    Validation(String),

    /// The caller could not be mapped to a known user.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The caller does not own the message.
    #[error("{0}")]
    Forbidden(String),

    #[error("message not found: {0}")]
    NotFound(String),

    #[error("{operation} timed out after {}s", .limit.as_secs())]
    StoreTimeout {
        operation: &'static str,
        limit: Duration,
    },

    #[error("message store failure: {0}")]
    Store(#[from] StoreError),

    #[error("identity store failure: {0}")]
    Identity(#[source] IdentityError),
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl From<IdentityError> for ChatError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::UnknownUser(name) => Self::Unauthorized(format!("unknown user {name}")),
            other => Self::Identity(other),
        }
    }
}
