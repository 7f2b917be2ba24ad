//! PingMe chat hub.
//!
//! Accepts chat messages over WebSocket frames and REST, persists them, and
//! fans every accepted message out to all connected clients.

pub mod api;
pub mod auth;
pub mod chat;
pub mod db;
pub mod identity;
pub mod ws;
