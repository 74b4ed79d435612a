//! Per-connection WebSocket session.
//!
//! 1. Register with the router (allocates the connection id)
//! 2. Writer task drains the outbound queue into the socket
//! 3. Reader loop hands each text/binary frame to the router
//! 4. When the reader stops, run cleanup, then let the writer flush what is
//!    still queued
//!
//! Cleanup runs only after the reader has stopped, so no request from this
//! connection can reach the hub after its cleanup.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::TransportState;
use crate::protocol::error_frame;
use crate::registry::{ConnectionHandle, ConnectionId, OutboundFrame};

/// How long the writer may keep flushing queued frames after cleanup.
pub const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<TransportState>>) -> Response {
    ws.max_message_size(state.max_frame_bytes)
        .max_frame_size(state.max_frame_bytes)
        .on_upgrade(move |socket| run_connection(socket, state))
}

/// Run one connection from upgrade to disconnect.
#[instrument(skip_all, name = "relay.transport.connection")]
pub async fn run_connection(socket: WebSocket, state: Arc<TransportState>) {
    let (handle, outbound) = ConnectionHandle::channel(state.outbound_buffer);

    let session = match state.router.connect(handle).await {
        Ok(session) => session,
        Err(e) => {
            warn!(
                target: "relay.transport",
                error = %e,
                "Rejecting connection, registration failed"
            );
            return;
        }
    };
    let connection_id = session.id();
    info!(target: "relay.transport", connection_id = %connection_id, "Client connected");

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, outbound, connection_id));

    loop {
        let message = tokio::select! {
            () = state.cancel_token.cancelled() => {
                debug!(target: "relay.transport", connection_id = %connection_id, "Closing on shutdown");
                break;
            }
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                let _ = session.handle_frame(text.as_bytes()).await;
            }
            Some(Ok(Message::Binary(data))) => {
                let _ = session.handle_frame(&data).await;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                debug!(target: "relay.transport", connection_id = %connection_id, "Client closed");
                break;
            }
            Some(Err(e)) => {
                debug!(
                    target: "relay.transport",
                    connection_id = %connection_id,
                    error = %e,
                    "Socket error"
                );
                break;
            }
        }
    }

    // Cleanup drops the hub's handle and `close` consumes the session's, so
    // the outbound queue closes once queued frames are written.
    let rooms = session.close().await;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!(
            target: "relay.transport",
            connection_id = %connection_id,
            "Writer did not drain in time, aborting"
        );
        writer.abort();
    }

    info!(
        target: "relay.transport",
        connection_id = %connection_id,
        rooms_left = rooms.len(),
        "Client disconnected"
    );
}

/// Forward queued frames to the socket until the queue closes or the socket
/// fails.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    connection_id: ConnectionId,
) {
    while let Some(frame) = outbound.recv().await {
        let text = match frame {
            OutboundFrame::Delivery(payload) => payload.to_string(),
            OutboundFrame::Error { reason } => error_frame(&reason),
        };
        if sink.send(Message::Text(text)).await.is_err() {
            debug!(
                target: "relay.transport",
                connection_id = %connection_id,
                "Socket write failed, writer stopping"
            );
            break;
        }
    }
    let _ = sink.close().await;
}
