//! Chat WebSocket handler.
//!
//! The socket is split in two. A writer task drains the connection's outbound
//! queue into the sink, while the reader side is handed to the connection
//! lifecycle as a stream of [`InboundFrame`]s.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::chat::{ConnectionLifecycle, InboundFrame, OutboundFrame};
use crate::web::handlers::AppState;

/// Query parameters for the WebSocket connection.
#[derive(Debug, Default, serde::Deserialize)]
pub struct WsQuery {
    /// Identity token. A missing token is rejected after the upgrade with 1008.
    pub token: Option<String>,
}

/// WebSocket chat handler.
///
/// GET /ws/chat/:room_id?token={jwt}
///
/// Authentication happens after the upgrade so that a rejected client sees a
/// close frame with a policy violation code rather than an HTTP error.
pub async fn chat_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, room_id, query.token))
}

/// Handle a WebSocket connection.
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    room_id: String,
    token: Option<String>,
) {
    let (ws_sender, ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(write_outbound(ws_sender, rx));

    let mut inbound = ws_receiver
        .take_while(|msg| futures::future::ready(msg.is_ok()))
        .filter_map(|msg| futures::future::ready(msg.ok().and_then(to_inbound)));

    let lifecycle = ConnectionLifecycle::new(state.relay.clone(), room_id);
    let connection_id = lifecycle.connection_id();
    let reason = lifecycle.run(token, &mut inbound, tx).await;

    tracing::debug!(%connection_id, ?reason, "WebSocket session ended");

    // The lifecycle dropped its sender, so the writer ends once the queue
    // (and any close frame in it) is flushed.
    let _ = writer.await;
}

/// Translate an axum message into an ingress frame.
fn to_inbound(msg: Message) -> Option<InboundFrame> {
    match msg {
        Message::Text(text) => Some(InboundFrame::Text(text)),
        Message::Binary(data) => Some(InboundFrame::Binary(data)),
        Message::Ping(data) => Some(InboundFrame::Ping(data)),
        Message::Close(_) => Some(InboundFrame::Close),
        Message::Pong(_) => None,
    }
}

/// Drain the outbound queue into the socket.
async fn write_outbound(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        let (msg, last) = match frame {
            OutboundFrame::Text(text) => (Message::Text(text), false),
            OutboundFrame::Pong(data) => (Message::Pong(data), false),
            OutboundFrame::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };
        if ws_sender.send(msg).await.is_err() {
            tracing::debug!("WebSocket send failed, stopping writer");
            break;
        }
        if last {
            break;
        }
    }
    let _ = ws_sender.close().await;
}
