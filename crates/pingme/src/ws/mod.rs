//! Real-time chat transport.
//!
//! ```text
//!  socket ─► read loop ─► ChatService ─► Broadcaster (bounded FIFO)
//!                                              │
//!                                       DeliveryWorker
//!                                              │ for_each
//!                                     ConnectionRegistry
//!                                     ├─► conn-1 buffer ─► writer ─► socket
//!                                     └─► conn-2 buffer ─► writer ─► socket
//! ```
//!
//! REST writes publish to the same [`Broadcaster`], so socket clients see
//! every accepted message regardless of where it came from.

mod broadcaster;
mod handler;
mod registry;
mod session;

pub use broadcaster::{BroadcastError, Broadcaster, DEFAULT_BROADCAST_CAPACITY, DeliveryWorker};
pub use handler::ws_handler;
pub use registry::{ConnectionId, ConnectionRegistry, ConnectionSink, FanOutReport, TransportError};
pub use session::ConnectionSession;
