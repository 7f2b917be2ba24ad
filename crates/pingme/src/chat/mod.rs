//! Chat service.
//!
//! Orchestrates the message lifecycle:
//!
//! ```text
//! frame / REST body ──► validate ──► stamp ──► MessageStore::insert
//!                                                   │
//!                       Broadcaster::publish ◄── enrich (usernames)
//! ```
//!
//! History reads and ownership-scoped edits go straight to the store. The
//! caller's identity is an argument of every operation and is re-resolved
//! through the [`IdentityResolver`](crate::identity::IdentityResolver) each
//! time.

mod error;
mod service;
mod store;

pub use error::{ChatError, ChatResult, StoreError, StoreResult};
pub use service::{AcceptanceClock, ChatConfig, ChatService};
pub use store::{MessageStore, NewMessage, SqliteMessageStore};
