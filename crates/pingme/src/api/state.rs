//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::chat::{ChatConfig, ChatService, MessageStore, SqliteMessageStore};
use crate::db::Database;
use crate::identity::{IdentityResolver, UserDirectory};
use crate::ws::{Broadcaster, ConnectionRegistry};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Authentication state.
    pub auth: AuthState,
    pub chat: ChatService,
    /// Live WebSocket connections.
    pub registry: Arc<ConnectionRegistry>,
    pub chat_config: Arc<ChatConfig>,
}

impl AppState {
    /// Wire the hub together and start its delivery worker.
    ///
    /// Must be called from within a Tokio runtime. The worker stops once the
    /// last clone of the state is dropped.
    pub fn new(
        auth: AuthState,
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityResolver>,
        chat_config: ChatConfig,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let (broadcaster, worker) = Broadcaster::new(chat_config.broadcast_capacity);
        worker.spawn(registry.clone());

        let chat = ChatService::new(store, identity, broadcaster, &chat_config);

        Self {
            auth,
            chat,
            registry,
            chat_config: Arc::new(chat_config),
        }
    }

    /// State backed by the SQLite message and identity stores.
    pub fn from_database(auth: AuthState, db: &Database, chat_config: ChatConfig) -> Self {
        let store = Arc::new(SqliteMessageStore::new(db.pool().clone()));
        let identity = Arc::new(UserDirectory::new(db.pool().clone()));
        Self::new(auth, store, identity, chat_config)
    }
}
