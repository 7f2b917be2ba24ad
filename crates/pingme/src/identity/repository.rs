//! User directory backed by the `users` table.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use pingme_protocol::UserId;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::{IdentityError, IdentityResolver};
use crate::auth::CurrentUser;

/// A row of the `users` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub created_at: String,
}

/// Repository for the identity store.
#[derive(Debug, Clone)]
pub struct UserDirectory {
    pool: SqlitePool,
}

impl UserDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Add a user and return the stored row.
    #[instrument(skip(self))]
    pub async fn create(&self, username: &str) -> Result<UserRecord> {
        if !is_valid_username(username) {
            bail!(
                "Invalid username format. Must be 3-50 alphanumeric characters, underscores, or hyphens."
            );
        }
        if self.get_by_username(username).await?.is_some() {
            bail!("Username '{}' is already taken.", username);
        }

        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO users (username) VALUES (?) RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert user")?;

        debug!("Created user {} ({})", username, id);

        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("User not found after creation"))
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: UserId) -> Result<Option<UserRecord>> {
        let user = sqlx::query_as::<_, UserRecord>(
            "SELECT id, username, created_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user")?;

        Ok(user)
    }

    #[instrument(skip(self))]
    pub async fn get_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        let user = sqlx::query_as::<_, UserRecord>(
            "SELECT id, username, created_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user by username")?;

        Ok(user)
    }

    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<UserRecord>> {
        sqlx::query_as::<_, UserRecord>("SELECT id, username, created_at FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list users")
    }
}

#[async_trait]
impl IdentityResolver for UserDirectory {
    async fn resolve_user_id(&self, user: &CurrentUser) -> Result<UserId, IdentityError> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE username = ?")
            .bind(user.username())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| IdentityError::UnknownUser(user.username().to_string()))
    }

    async fn username(&self, user_id: UserId) -> Result<Option<String>, IdentityError> {
        let name = sqlx::query_scalar::<_, String>("SELECT username FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(name)
    }
}

fn is_valid_username(username: &str) -> bool {
    (3..=50).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Claims;
    use crate::db::Database;

    async fn directory() -> UserDirectory {
        let db = Database::in_memory().await.unwrap();
        UserDirectory::new(db.pool().clone())
    }

    fn caller(username: &str) -> CurrentUser {
        CurrentUser::new(Claims::new(username, 0, 3600, "test"))
    }

    #[tokio::test]
    async fn test_create_and_resolve() {
        let users = directory().await;
        let alice = users.create("alice").await.unwrap();
        let bob = users.create("bob").await.unwrap();
        assert_ne!(alice.id, bob.id);

        assert_eq!(users.resolve_user_id(&caller("bob")).await.unwrap(), bob.id);
        assert_eq!(
            users.username(alice.id).await.unwrap().as_deref(),
            Some("alice")
        );
        assert_eq!(users.username(9999).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_caller() {
        let users = directory().await;
        let err = users.resolve_user_id(&caller("ghost")).await.unwrap_err();
        assert!(matches!(err, IdentityError::UnknownUser(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_bad_names() {
        let users = directory().await;
        users.create("alice").await.unwrap();
        assert!(users.create("alice").await.is_err());
        assert!(users.create("a").await.is_err());
        assert!(users.create("has space").await.is_err());
        assert_eq!(users.list().await.unwrap().len(), 1);
    }
}
