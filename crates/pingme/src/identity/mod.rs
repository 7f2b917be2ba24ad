//! Identity resolution.
//!
//! The chat hub never owns users. It asks an [`IdentityResolver`] to turn an
//! authenticated caller into a numeric user id, and a user id into a display
//! username. [`UserDirectory`] is the SQLite-backed implementation.

mod repository;

use async_trait::async_trait;
use pingme_protocol::UserId;
use thiserror::Error;

use crate::auth::CurrentUser;

pub use repository::{UserDirectory, UserRecord};

/// Errors from the identity store.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The token named a user the store does not know.
    #[error("unknown user: {0}")]
    UnknownUser(String),

    #[error("identity store error: {0}")]
    Backend(#[from] sqlx::Error),
}

/// Maps authenticated callers to user ids and user ids to usernames.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve the caller's stable user id.
    async fn resolve_user_id(&self, user: &CurrentUser) -> Result<UserId, IdentityError>;

    /// Look up the username for a user id. `None` if no such user.
    async fn username(&self, user_id: UserId) -> Result<Option<String>, IdentityError>;
}
