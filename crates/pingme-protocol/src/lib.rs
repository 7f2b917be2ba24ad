//! Wire types for the PingMe chat hub.
//!
//! Both ingestion paths speak the same JSON shapes:
//!
//! ```text
//! REST  POST /chat {receiver_id, message} ──┐
//!                                            ├──> Message ──> MessageView ──> every socket
//! WS    frame      {receiver_id, message} ──┘
//! ```
//!
//! Field names are snake_case. The message text travels as `message`; requests
//! also accept `body`.

pub mod messages;

pub use messages::{
    ChatStatus, CreateChatRequest, InboundFrame, InvalidMessageId, MAX_BODY_CHARS, Message,
    MessageId, MessageView, UpdateChatRequest, UserId,
};
