//! WebSocket handler for chat clients.

use axum::{
    body::Bytes,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use pingme_protocol::MessageView;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, AppState};
use crate::auth::CurrentUser;

use super::registry::{ConnectionSink, TransportError};
use super::session::ConnectionSession;

/// How long the writer may take to say goodbye before it is aborted.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// Registry-facing half of one socket.
///
/// Views go into a bounded buffer drained by the connection's writer task.
struct WsConnection {
    outbound: mpsc::Sender<Arc<MessageView>>,
    shutdown: CancellationToken,
}

impl ConnectionSink for WsConnection {
    fn deliver(&self, view: Arc<MessageView>) -> Result<(), TransportError> {
        self.outbound.try_send(view).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backlogged,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(
    State(state): State<AppState>,
    user: CurrentUser,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    // Unknown users are refused before the upgrade.
    let user_id = state.chat.resolve_caller(&user).await?;
    info!(
        "WebSocket upgrade request from {} (user {})",
        user.username(),
        user_id
    );

    Ok(ws.on_upgrade(move |socket| handle_ws_connection(socket, state, user)))
}

/// Drive one chat connection until either side closes it.
async fn handle_ws_connection(socket: WebSocket, state: AppState, user: CurrentUser) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Arc<MessageView>>(state.chat_config.connection_buffer.max(1));
    let shutdown = CancellationToken::new();
    let connection: Arc<dyn ConnectionSink> = Arc::new(WsConnection {
        outbound: tx,
        shutdown: shutdown.clone(),
    });

    let conn_id = match state.registry.register(&connection) {
        Ok(id) => id,
        Err(e) => {
            error!("Failed to register connection for {}: {}", user.username(), e);
            return;
        }
    };
    let mut session = ConnectionSession::new(conn_id, user);

    // Writer: drains the outbound buffer and keeps the socket alive.
    let registry = state.registry.clone();
    let writer_shutdown = shutdown.clone();
    let ping_every = state.chat_config.ping_interval();
    let mut send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(ping_every);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                _ = writer_shutdown.cancelled() => break,

                next = rx.recv() => {
                    let Some(view) = next else { break };
                    let json = match serde_json::to_string(view.as_ref()) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("Failed to serialize message {}: {}", view.id, e);
                            continue;
                        }
                    };
                    // A peer that stops reading parks this send; shutdown must still win.
                    let sent = tokio::select! {
                        _ = writer_shutdown.cancelled() => break,
                        sent = sender.send(Message::Text(json.into())) => sent,
                    };
                    if let Err(e) = sent {
                        debug!("Write to {} failed: {}", conn_id, e);
                        break;
                    }
                }

                _ = ping_interval.tick() => {
                    let sent = tokio::select! {
                        _ = writer_shutdown.cancelled() => break,
                        sent = sender.send(Message::Ping(Bytes::new())) => sent,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        registry.deregister(conn_id);
        writer_shutdown.cancel();
        let _ = sender.close().await;
    });

    // Reader: frames are handled one at a time, in arrival order.
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Connection {} shut down by server", conn_id);
                break;
            }
            frame = receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                match state.chat.accept_inbound(&mut session, text.as_str()).await {
                    Ok(view) => debug!("Accepted {} on {}", view.id, conn_id),
                    Err(e) => warn!(
                        "Dropped frame from {} on {}: {}",
                        session.user.username(),
                        conn_id,
                        e
                    ),
                }
            }
            Some(Ok(Message::Binary(_))) => {
                debug!("Ignoring binary frame on {}", conn_id);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                info!("{} closed connection {}", session.user.username(), conn_id);
                break;
            }
            Some(Err(e)) => {
                warn!("WebSocket error on {}: {}", conn_id, e);
                break;
            }
        }
    }

    // Clean up
    state.registry.deregister(conn_id);
    shutdown.cancel();
    drop(connection);
    // The close frame can stall behind unread data too.
    if tokio::time::timeout(WRITER_GRACE, &mut send_task).await.is_err() {
        debug!("Writer for {} did not finish, aborting", conn_id);
        send_task.abort();
    }

    info!(
        "Connection {} for {} closed after {} messages",
        conn_id,
        session.user.username(),
        session.accepted()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::registry::tests::view;

    fn connection(buffer: usize) -> (WsConnection, mpsc::Receiver<Arc<MessageView>>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            WsConnection {
                outbound: tx,
                shutdown: CancellationToken::new(),
            },
            rx,
        )
    }

    #[test]
    fn test_full_buffer_is_backlogged() {
        let (conn, _rx) = connection(1);
        conn.deliver(view("a")).unwrap();
        assert!(matches!(
            conn.deliver(view("b")),
            Err(TransportError::Backlogged)
        ));
    }

    #[test]
    fn test_dropped_writer_is_closed() {
        let (conn, rx) = connection(4);
        drop(rx);
        assert!(matches!(conn.deliver(view("a")), Err(TransportError::Closed)));
    }

    #[test]
    fn test_close_cancels_shutdown() {
        let (conn, _rx) = connection(1);
        let token = conn.shutdown.clone();
        conn.close();
        assert!(token.is_cancelled());
    }
}
