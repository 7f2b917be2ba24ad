//! Per-connection state carried by the read loop.

use pingme_protocol::MessageId;

use super::registry::ConnectionId;
use crate::auth::CurrentUser;

/// The authenticated user behind one socket plus a few counters.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub id: ConnectionId,
    pub user: CurrentUser,
    accepted: u64,
    last_message: Option<MessageId>,
}

impl ConnectionSession {
    pub fn new(id: ConnectionId, user: CurrentUser) -> Self {
        Self {
            id,
            user,
            accepted: 0,
            last_message: None,
        }
    }

    pub fn record_accepted(&mut self, message: &MessageId) {
        self.accepted += 1;
        self.last_message = Some(message.clone());
    }

    /// Frames accepted from this connection so far.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn last_message(&self) -> Option<&MessageId> {
        self.last_message.as_ref()
    }
}
