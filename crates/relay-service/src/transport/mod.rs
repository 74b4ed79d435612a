//! WebSocket transport.
//!
//! `GET /ws` upgrades to a WebSocket. Each connection gets a reader (inbound
//! frames -> router) and a writer (outbound queue -> socket); see [`ws`].

pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::router::Router;

/// Shared state of the WebSocket endpoint.
#[derive(Clone)]
pub struct TransportState {
    pub router: Router,
    /// Per-connection outbound queue capacity.
    pub outbound_buffer: usize,
    /// Largest accepted inbound message, in bytes.
    pub max_frame_bytes: usize,
    /// Cancelled on shutdown; open connections are closed.
    pub cancel_token: CancellationToken,
}

/// Build the relay's HTTP router.
pub fn relay_router(state: TransportState) -> axum::Router {
    axum::Router::new()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}
