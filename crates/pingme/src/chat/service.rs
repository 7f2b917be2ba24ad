//! Chat service implementation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use pingme_protocol::{
    ChatStatus, CreateChatRequest, InboundFrame, MAX_BODY_CHARS, Message, MessageId, MessageView,
    UserId,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use super::error::{ChatError, ChatResult};
use super::store::{MessageStore, NewMessage};
use crate::auth::CurrentUser;
use crate::identity::IdentityResolver;
use crate::ws::{Broadcaster, ConnectionSession, DEFAULT_BROADCAST_CAPACITY};

/// Tunables for the chat hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Accepted messages that may wait for fan-out before publishers block.
    pub broadcast_capacity: usize,
    /// Views buffered per connection before it counts as backlogged.
    pub connection_buffer: usize,
    pub write_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub ping_interval_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            connection_buffer: 64,
            write_timeout_secs: 5,
            read_timeout_secs: 10,
            ping_interval_secs: 30,
        }
    }
}

impl ChatConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

/// Source of `created_at` stamps. Never hands out a value lower than one it
/// already handed out, even if the wall clock steps back.
#[derive(Debug, Default)]
pub struct AcceptanceClock {
    last: AtomicI64,
}

impl AcceptanceClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&self) -> i64 {
        self.stamp_at(chrono::Utc::now().timestamp())
    }

    pub fn stamp_at(&self, now: i64) -> i64 {
        let previous = self.last.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }
}

type PairKey = (UserId, UserId);

/// One async mutex per conversation pair, created on demand.
#[derive(Default)]
struct ConversationLocks {
    locks: DashMap<PairKey, Arc<Mutex<()>>>,
}

impl ConversationLocks {
    async fn lock(&self, a: UserId, b: UserId) -> ConversationGuard<'_> {
        let key = (a.min(b), a.max(b));
        let mutex = self.locks.entry(key).or_default().clone();
        let guard = mutex.lock_owned().await;
        ConversationGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

struct ConversationGuard<'a> {
    locks: &'a ConversationLocks,
    key: PairKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConversationGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own handle left: nobody holds or waits on this pair.
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Runs `fut` under `limit`, mapping expiry to [`ChatError::StoreTimeout`].
async fn bounded<T, E, F>(operation: &'static str, limit: Duration, fut: F) -> ChatResult<T>
where
    F: Future<Output = Result<T, E>>,
    ChatError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(ChatError::from),
        Err(_) => Err(ChatError::StoreTimeout { operation, limit }),
    }
}

fn validate_body(body: &str) -> ChatResult<()> {
    if body.trim().is_empty() {
        return Err(ChatError::validation("Message must not be empty"));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(ChatError::validation(format!(
            "Message exceeds {MAX_BODY_CHARS} characters"
        )));
    }
    Ok(())
}

fn validate_request(request: &CreateChatRequest) -> ChatResult<()> {
    if request.receiver_id <= 0 {
        return Err(ChatError::validation("Invalid receiver_id"));
    }
    validate_body(&request.body)
}

/// Entry point for every chat operation, socket or REST.
#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn MessageStore>,
    identity: Arc<dyn IdentityResolver>,
    broadcaster: Broadcaster,
    clock: Arc<AcceptanceClock>,
    locks: Arc<ConversationLocks>,
    write_timeout: Duration,
    read_timeout: Duration,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityResolver>,
        broadcaster: Broadcaster,
        config: &ChatConfig,
    ) -> Self {
        Self {
            store,
            identity,
            broadcaster,
            clock: Arc::new(AcceptanceClock::new()),
            locks: Arc::new(ConversationLocks::default()),
            write_timeout: config.write_timeout(),
            read_timeout: config.read_timeout(),
        }
    }

    /// Override the store deadlines.
    pub fn with_timeouts(mut self, write: Duration, read: Duration) -> Self {
        self.write_timeout = write;
        self.read_timeout = read;
        self
    }

    /// Map an authenticated caller to a user id.
    pub async fn resolve_caller(&self, user: &CurrentUser) -> ChatResult<UserId> {
        bounded(
            "resolve caller",
            self.read_timeout,
            self.identity.resolve_user_id(user),
        )
        .await
    }

    /// Handle one text frame read from a chat socket.
    ///
    /// Any sender in the frame is ignored; the session's user is the sender.
    pub async fn accept_inbound(
        &self,
        session: &mut ConnectionSession,
        raw: &str,
    ) -> ChatResult<MessageView> {
        let frame: InboundFrame = serde_json::from_str(raw)
            .map_err(|e| ChatError::validation(format!("Invalid input: {e}")))?;
        let sender_id = self.resolve_caller(&session.user).await?;
        let view = self.submit(sender_id, frame).await?;
        session.record_accepted(&view.id);
        Ok(view)
    }

    /// Handle `POST /chat`.
    pub async fn create_outbound(
        &self,
        user: &CurrentUser,
        request: CreateChatRequest,
    ) -> ChatResult<MessageView> {
        let sender_id = self.resolve_caller(user).await?;
        self.submit(sender_id, request).await
    }

    #[instrument(skip(self, request), fields(receiver = request.receiver_id))]
    async fn submit(&self, sender_id: UserId, request: CreateChatRequest) -> ChatResult<MessageView> {
        validate_request(&request)?;

        // Held until the view is queued, so a conversation's stamps and its
        // fan-out both follow insertion order.
        let _pair = self.locks.lock(sender_id, request.receiver_id).await;

        let message = bounded(
            "insert message",
            self.write_timeout,
            self.store.insert(NewMessage {
                sender_id,
                receiver_id: request.receiver_id,
                body: request.body,
                created_at: self.clock.stamp(),
            }),
        )
        .await?;
        debug!("Accepted message {} from {}", message.id, sender_id);

        let view = Arc::new(self.enrich(message).await);
        if let Err(e) = self.broadcaster.publish(view.clone()).await {
            warn!("Message {} persisted but not broadcast: {}", view.id, e);
        }
        Ok(Arc::unwrap_or_clone(view))
    }

    /// Every message the caller sent or received, oldest first.
    #[instrument(skip(self, user), fields(user = user.username()))]
    pub async fn list_conversations(&self, user: &CurrentUser) -> ChatResult<Vec<MessageView>> {
        let user_id = self.resolve_caller(user).await?;
        let mut messages = bounded(
            "list messages",
            self.read_timeout,
            self.store.find_by_participant(user_id),
        )
        .await?;
        messages.sort_by_key(|m| m.created_at);

        let mut names: HashMap<UserId, String> = HashMap::new();
        let mut views = Vec::with_capacity(messages.len());
        for message in messages {
            let sender = self.cached_username(&mut names, message.sender_id).await;
            let receiver = self.cached_username(&mut names, message.receiver_id).await;
            views.push(MessageView::new(message, sender, receiver));
        }
        Ok(views)
    }

    /// Replace the body of a message the caller sent.
    #[instrument(skip(self, user, body), fields(user = user.username()))]
    pub async fn update_message(
        &self,
        user: &CurrentUser,
        id: &MessageId,
        body: String,
    ) -> ChatResult<ChatStatus> {
        validate_body(&body)?;
        let user_id = self.resolve_caller(user).await?;
        let updated = bounded(
            "update message",
            self.write_timeout,
            self.store.update_body(id, user_id, &body),
        )
        .await?;
        if !updated {
            return Err(self.explain_miss(id).await);
        }
        info!("Message {} updated by {}", id, user_id);
        Ok(ChatStatus::Updated)
    }

    /// Delete a message the caller sent.
    #[instrument(skip(self, user), fields(user = user.username()))]
    pub async fn delete_message(&self, user: &CurrentUser, id: &MessageId) -> ChatResult<ChatStatus> {
        let user_id = self.resolve_caller(user).await?;
        let deleted = bounded(
            "delete message",
            self.write_timeout,
            self.store.delete(id, user_id),
        )
        .await?;
        if !deleted {
            return Err(self.explain_miss(id).await);
        }
        info!("Message {} deleted by {}", id, user_id);
        Ok(ChatStatus::Deleted)
    }

    /// Why a sender-scoped mutation matched nothing.
    async fn explain_miss(&self, id: &MessageId) -> ChatError {
        match bounded("find message", self.read_timeout, self.store.get(id)).await {
            Ok(Some(_)) => ChatError::Forbidden("You are not the sender of this message".into()),
            Ok(None) => ChatError::NotFound(id.to_string()),
            Err(e) => e,
        }
    }

    async fn enrich(&self, message: Message) -> MessageView {
        let sender = self.username_or_empty(message.sender_id).await;
        let receiver = self.username_or_empty(message.receiver_id).await;
        MessageView::new(message, sender, receiver)
    }

    async fn cached_username(&self, cache: &mut HashMap<UserId, String>, id: UserId) -> String {
        if let Some(name) = cache.get(&id) {
            return name.clone();
        }
        let name = self.username_or_empty(id).await;
        cache.insert(id, name.clone());
        name
    }

    /// Usernames are decoration: any lookup failure yields an empty string.
    async fn username_or_empty(&self, id: UserId) -> String {
        match tokio::time::timeout(self.read_timeout, self.identity.username(id)).await {
            Ok(Ok(Some(name))) => name,
            Ok(Ok(None)) => {
                warn!("No username for user {}", id);
                String::new()
            }
            Ok(Err(e)) => {
                warn!("Username lookup for user {} failed: {}", id, e);
                String::new()
            }
            Err(_) => {
                warn!("Username lookup for user {} timed out", id);
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Claims;
    use crate::chat::{SqliteMessageStore, StoreResult};
    use crate::db::Database;
    use crate::identity::{IdentityError, UserDirectory};
    use crate::ws::{ConnectionId, ConnectionRegistry, ConnectionSink, TransportError};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct Harness {
        chat: ChatService,
        sink: Arc<CollectingSink>,
        alice: CurrentUser,
        bob: CurrentUser,
        carol: CurrentUser,
        _registry: Arc<ConnectionRegistry>,
        _handle: Arc<dyn ConnectionSink>,
    }

    #[derive(Default)]
    struct CollectingSink {
        views: StdMutex<Vec<Arc<MessageView>>>,
    }

    impl ConnectionSink for CollectingSink {
        fn deliver(&self, view: Arc<MessageView>) -> Result<(), TransportError> {
            self.views.lock().unwrap().push(view);
            Ok(())
        }
    }

    impl CollectingSink {
        async fn wait_for(&self, count: usize) -> Vec<Arc<MessageView>> {
            for _ in 0..100 {
                {
                    let views = self.views.lock().unwrap();
                    if views.len() >= count {
                        return views.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("expected {count} broadcast views");
        }
    }

    fn caller(username: &str) -> CurrentUser {
        CurrentUser::new(Claims::new(username, 0, 3600, "test"))
    }

    async fn harness() -> Harness {
        let db = Database::in_memory().await.unwrap();
        let users = UserDirectory::new(db.pool().clone());
        users.create("alice").await.unwrap();
        users.create("bob").await.unwrap();
        users.create("carol").await.unwrap();

        let registry = Arc::new(ConnectionRegistry::new());
        let sink = Arc::new(CollectingSink::default());
        let handle: Arc<dyn ConnectionSink> = sink.clone();
        registry.register(&handle).unwrap();

        let config = ChatConfig::default();
        let (broadcaster, worker) = Broadcaster::new(config.broadcast_capacity);
        worker.spawn(registry.clone());

        let chat = ChatService::new(
            Arc::new(SqliteMessageStore::new(db.pool().clone())),
            Arc::new(users),
            broadcaster,
            &config,
        );

        Harness {
            chat,
            sink,
            alice: caller("alice"),
            bob: caller("bob"),
            carol: caller("carol"),
            _registry: registry,
            _handle: handle,
        }
    }

    fn request(receiver_id: UserId, body: &str) -> CreateChatRequest {
        CreateChatRequest {
            receiver_id,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_clock_never_goes_backwards() {
        let clock = AcceptanceClock::new();
        assert_eq!(clock.stamp_at(100), 100);
        assert_eq!(clock.stamp_at(90), 100);
        assert_eq!(clock.stamp_at(101), 101);
        assert!(clock.stamp() >= 101);
    }

    #[tokio::test]
    async fn test_pair_locks_are_released() {
        let locks = ConversationLocks::default();
        {
            let _a = locks.lock(1, 2).await;
            assert_eq!(locks.len(), 1);
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_pair_lock_is_symmetric() {
        let locks = Arc::new(ConversationLocks::default());
        let held = locks.lock(1, 2).await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock(2, 1).await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_create_enriches_and_broadcasts() {
        let h = harness().await;
        let view = h
            .chat
            .create_outbound(&h.alice, request(2, "hi"))
            .await
            .unwrap();

        assert_eq!(view.sender_id, 1);
        assert_eq!(view.sender_username, "alice");
        assert_eq!(view.receiver_username, "bob");
        assert!(view.created_at > 0);

        let delivered = h.sink.wait_for(1).await;
        assert_eq!(*delivered[0], view);
    }

    #[tokio::test]
    async fn test_validation() {
        let h = harness().await;
        for bad in [request(2, ""), request(2, "   "), request(0, "hi")] {
            let err = h.chat.create_outbound(&h.alice, bad).await.unwrap_err();
            assert!(matches!(err, ChatError::Validation(_)));
        }
        let long = "x".repeat(MAX_BODY_CHARS + 1);
        let err = h
            .chat
            .create_outbound(&h.alice, request(2, &long))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unknown_caller_is_unauthorized() {
        let h = harness().await;
        let err = h
            .chat
            .create_outbound(&caller("mallory"), request(2, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_accept_inbound_ignores_frame_sender() {
        let h = harness().await;
        let mut session = ConnectionSession::new(ConnectionId::new(7), h.bob.clone());

        let view = h
            .chat
            .accept_inbound(
                &mut session,
                r#"{"sender_id": 1, "receiver_id": 1, "message": "from bob"}"#,
            )
            .await
            .unwrap();
        assert_eq!(view.sender_id, 2);
        assert_eq!(session.accepted(), 1);
        assert_eq!(session.last_message(), Some(&view.id));

        let err = h
            .chat
            .accept_inbound(&mut session, "not json")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert_eq!(session.accepted(), 1);
    }

    #[tokio::test]
    async fn test_inbound_frames_broadcast_in_read_order() {
        let h = harness().await;
        let mut session = ConnectionSession::new(ConnectionId::new(1), h.alice.clone());
        for i in 0..5 {
            let frame = format!(r#"{{"receiver_id": 2, "message": "m{i}"}}"#);
            h.chat.accept_inbound(&mut session, &frame).await.unwrap();
        }

        let bodies: Vec<String> = h
            .sink
            .wait_for(5)
            .await
            .iter()
            .map(|v| v.body.clone())
            .collect();
        assert_eq!(bodies, ["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_list_is_visible_to_both_participants() {
        let h = harness().await;
        let sent = h
            .chat
            .create_outbound(&h.alice, request(2, "hi"))
            .await
            .unwrap();
        h.chat
            .create_outbound(&h.bob, request(1, "hey"))
            .await
            .unwrap();

        for user in [&h.alice, &h.bob] {
            let list = h.chat.list_conversations(user).await.unwrap();
            assert_eq!(list.len(), 2);
            assert_eq!(list[0].id, sent.id);
            assert_eq!(list[0].body, "hi");
            assert_eq!(list[0].created_at, sent.created_at);
            assert!(list.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        }
        assert!(h.chat.list_conversations(&h.carol).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_sender_may_mutate() {
        let h = harness().await;
        let sent = h
            .chat
            .create_outbound(&h.alice, request(2, "hi"))
            .await
            .unwrap();

        for other in [&h.bob, &h.carol] {
            let err = h
                .chat
                .update_message(other, &sent.id, "edited".into())
                .await
                .unwrap_err();
            assert!(matches!(err, ChatError::Forbidden(_)));
            let err = h.chat.delete_message(other, &sent.id).await.unwrap_err();
            assert!(matches!(err, ChatError::Forbidden(_)));
        }

        let status = h
            .chat
            .update_message(&h.alice, &sent.id, "edited".into())
            .await
            .unwrap();
        assert_eq!(status, ChatStatus::Updated);
        let list = h.chat.list_conversations(&h.bob).await.unwrap();
        assert_eq!(list[0].body, "edited");

        let status = h.chat.delete_message(&h.alice, &sent.id).await.unwrap();
        assert_eq!(status, ChatStatus::Deleted);
        assert!(h.chat.list_conversations(&h.bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_message_is_not_found() {
        let h = harness().await;
        let id: MessageId = "msg_doesnotexist".parse().unwrap();
        let err = h.chat.delete_message(&h.alice, &id).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        let err = h
            .chat
            .update_message(&h.alice, &id, "x".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    struct StalledStore;

    #[async_trait]
    impl MessageStore for StalledStore {
        async fn insert(&self, _message: NewMessage) -> StoreResult<Message> {
            std::future::pending().await
        }
        async fn find_by_participant(&self, _user_id: UserId) -> StoreResult<Vec<Message>> {
            std::future::pending().await
        }
        async fn get(&self, _id: &MessageId) -> StoreResult<Option<Message>> {
            Ok(None)
        }
        async fn update_body(&self, _: &MessageId, _: UserId, _: &str) -> StoreResult<bool> {
            Ok(false)
        }
        async fn delete(&self, _: &MessageId, _: UserId) -> StoreResult<bool> {
            Ok(false)
        }
    }

    /// Knows every caller as user 1 but cannot name anyone.
    struct NamelessResolver;

    #[async_trait]
    impl IdentityResolver for NamelessResolver {
        async fn resolve_user_id(&self, _user: &CurrentUser) -> Result<UserId, IdentityError> {
            Ok(1)
        }
        async fn username(&self, _user_id: UserId) -> Result<Option<String>, IdentityError> {
            Err(IdentityError::Backend(sqlx::Error::PoolTimedOut))
        }
    }

    #[tokio::test]
    async fn test_store_timeouts() {
        let (broadcaster, _worker) = Broadcaster::new(1);
        let chat = ChatService::new(
            Arc::new(StalledStore),
            Arc::new(NamelessResolver),
            broadcaster,
            &ChatConfig::default(),
        )
        .with_timeouts(Duration::from_millis(20), Duration::from_millis(20));
        let alice = caller("alice");

        let err = chat
            .create_outbound(&alice, request(2, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::StoreTimeout {
                operation: "insert message",
                ..
            }
        ));

        let err = chat.list_conversations(&alice).await.unwrap_err();
        assert!(matches!(err, ChatError::StoreTimeout { .. }));
    }

    #[tokio::test]
    async fn test_username_failure_degrades_to_empty() {
        let db = Database::in_memory().await.unwrap();
        let (broadcaster, worker) = Broadcaster::new(4);
        worker.spawn(Arc::new(ConnectionRegistry::new()));
        let chat = ChatService::new(
            Arc::new(SqliteMessageStore::new(db.pool().clone())),
            Arc::new(NamelessResolver),
            broadcaster,
            &ChatConfig::default(),
        );

        let view = chat
            .create_outbound(&caller("alice"), request(2, "hi"))
            .await
            .unwrap();
        assert_eq!(view.sender_username, "");
        assert_eq!(view.receiver_username, "");

        let list = chat.list_conversations(&caller("alice")).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, view.id);
    }
}
