//! Message store trait and its SQLite implementation.

use async_trait::async_trait;
use pingme_protocol::{Message, MessageId, UserId};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::error::{StoreError, StoreResult};

/// A message accepted by the service but not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub created_at: i64,
}

/// Durable storage for chat messages.
///
/// Mutations are scoped by ownership: they match on both the message id and
/// the sender, and report whether a record was touched.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, assigning its id.
    async fn insert(&self, message: NewMessage) -> StoreResult<Message>;

    /// Every message where `user_id` is sender or receiver, in insertion order.
    async fn find_by_participant(&self, user_id: UserId) -> StoreResult<Vec<Message>>;

    async fn get(&self, id: &MessageId) -> StoreResult<Option<Message>>;

    /// Replace the body if `sender_id` owns the message.
    async fn update_body(&self, id: &MessageId, sender_id: UserId, body: &str)
    -> StoreResult<bool>;

    /// Delete the message if `sender_id` owns it.
    async fn delete(&self, id: &MessageId, sender_id: UserId) -> StoreResult<bool>;
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: String,
    sender_id: i64,
    receiver_id: i64,
    body: String,
    created_at: i64,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let id = row.id.parse::<MessageId>().map_err(|e| StoreError::Corrupt {
            id: row.id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Message {
            id,
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            body: row.body,
            created_at: row.created_at,
        })
    }
}

/// [`MessageStore`] over the `messages` table.
#[derive(Debug, Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn generate_id() -> String {
        let len = MessageId::RANDOM_LEN;
        format!("{}{}", MessageId::PREFIX, nanoid::nanoid!(len))
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    #[instrument(skip(self, message), fields(sender = message.sender_id, receiver = message.receiver_id))]
    async fn insert(&self, message: NewMessage) -> StoreResult<Message> {
        let id = Self::generate_id();

        sqlx::query(
            r#"
            INSERT INTO messages (id, sender_id, receiver_id, body, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(message.sender_id)
        .bind(message.receiver_id)
        .bind(&message.body)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        debug!("Inserted message {}", id);

        let id = id.parse::<MessageId>().map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Message {
            id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            body: message.body,
            created_at: message.created_at,
        })
    }

    #[instrument(skip(self))]
    async fn find_by_participant(&self, user_id: UserId) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, sender_id, receiver_id, body, created_at
            FROM messages
            WHERE sender_id = ? OR receiver_id = ?
            ORDER BY seq
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Message::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &MessageId) -> StoreResult<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT id, sender_id, receiver_id, body, created_at FROM messages WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Message::try_from).transpose()
    }

    #[instrument(skip(self, body))]
    async fn update_body(
        &self,
        id: &MessageId,
        sender_id: UserId,
        body: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE messages SET body = ? WHERE id = ? AND sender_id = ?")
            .bind(body)
            .bind(id.as_str())
            .bind(sender_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &MessageId, sender_id: UserId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ? AND sender_id = ?")
            .bind(id.as_str())
            .bind(sender_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
