//! WebSocket transport for the signaling protocol

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use livecast_core::{
    dispatch::{Ack, ClientFrame, ConnectionContext},
    Error,
};
use livecast_sfu::ConnectionId;

use crate::flood::FloodGuard;
use crate::server::AppState;

/// Largest inbound frame accepted from a client
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Optional identity hints supplied on the upgrade request
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectQuery {
    pub name: Option<String>,
    pub user_id: Option<String>,
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: ConnectQuery) {
    let services = state.services;
    let ctx = ConnectionContext {
        connection_id: ConnectionId::generate(),
        display_name: query.name,
        user_id: query.user_id,
    };
    let connection_id = ctx.connection_id.clone();
    info!(connection_id = %connection_id, "WebSocket connected");

    // Register before the welcome listing so it lands in this queue
    let mut events = services.hub.register(&connection_id);
    services.lifecycle.on_connect(&connection_id);

    let (mut sender, mut receiver) = socket.split();
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<Ack>();

    let writer_id = connection_id.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                Some(event) = events.recv() => serde_json::to_string(&event),
                Some(ack) = ack_rx.recv() => serde_json::to_string(&ack),
                else => break,
            };
            let text = match text {
                Ok(text) => text,
                Err(e) => {
                    error!(connection_id = %writer_id, error = %e, "Failed to encode outbound frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                debug!(connection_id = %writer_id, "Socket closed while sending");
                break;
            }
        }
    });

    let guard = FloodGuard::new(
        state.connection_requests_per_second,
        state.connection_burst,
    );

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                        break;
                    }
                };

                let ack = match guard.check() {
                    Ok(()) => services.dispatcher.handle_text(&ctx, text.as_str()).await,
                    Err(retry_after_seconds) => {
                        warn!(connection_id = %connection_id, "Request flood, rejecting frame");
                        ClientFrame::parse(text.as_str())
                            .and_then(|frame| frame.ack)
                            .map(|ack| Ack::failure(ack, &Error::RateLimited { retry_after_seconds }))
                    }
                };
                if let Some(ack) = ack {
                    if ack_tx.send(ack).is_err() {
                        break;
                    }
                }
            }
            _ = &mut send_task => break,
        }
    }

    let summary = services.lifecycle.on_disconnect(&connection_id).await;
    services.hub.unregister(&connection_id);
    drop(ack_tx);
    send_task.abort();

    info!(
        connection_id = %connection_id,
        ended_stream = ?summary.ended_stream,
        left_chats = summary.left_chats.len(),
        closed_transports = summary.closed_transports,
        "WebSocket disconnected"
    );
}
