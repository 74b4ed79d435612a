//! Wire formats.
//!
//! - Client -> relay: [`ClientRequest`], one JSON object per frame, tagged by `kind`.
//! - Relay -> client: raw room payloads, or an error frame
//!   `{ "kind": "error", "reason": "..." }`.
//! - Relay -> broker -> relay: [`BrokerEnvelope`], published on the channel
//!   named after the room.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RelayError;

/// Longest accepted room name, in bytes.
pub const MAX_ROOM_NAME_BYTES: usize = 256;

/// A decoded inbound client request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ClientRequest {
    /// Join a room.
    Subscribe { room: String },
    /// Leave a room.
    Unsubscribe { room: String },
    /// Publish a payload to a room. The publisher need not be a member.
    Publish {
        #[serde(rename = "roomId")]
        room_id: String,
        message: Value,
    },
}

impl ClientRequest {
    /// Bounded label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ClientRequest::Subscribe { .. } => "subscribe",
            ClientRequest::Unsubscribe { .. } => "unsubscribe",
            ClientRequest::Publish { .. } => "publish",
        }
    }

    fn room(&self) -> &str {
        match self {
            ClientRequest::Subscribe { room } | ClientRequest::Unsubscribe { room } => room,
            ClientRequest::Publish { room_id, .. } => room_id,
        }
    }
}

/// Decode and validate one inbound frame.
pub fn decode_request(frame: &[u8]) -> Result<ClientRequest, RelayError> {
    let request: ClientRequest = serde_json::from_slice(frame)
        .map_err(|e| RelayError::MalformedRequest(format!("invalid request: {e}")))?;

    let room = request.room();
    if room.is_empty() {
        return Err(RelayError::MalformedRequest(
            "room name must not be empty".to_string(),
        ));
    }
    if room.len() > MAX_ROOM_NAME_BYTES {
        return Err(RelayError::MalformedRequest(format!(
            "room name exceeds {MAX_ROOM_NAME_BYTES} bytes"
        )));
    }

    Ok(request)
}

/// Render the error frame sent back to a misbehaving client.
#[must_use]
pub fn error_frame(reason: &str) -> String {
    serde_json::json!({ "kind": "error", "reason": reason }).to_string()
}

/// Message carried between relay instances over the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BrokerEnvelope {
    Message {
        #[serde(rename = "roomId")]
        room_id: String,
        message: Value,
    },
}

impl BrokerEnvelope {
    /// Encode a room payload for publishing.
    pub fn encode(room: &str, message: Value) -> Result<Bytes, RelayError> {
        let envelope = BrokerEnvelope::Message {
            room_id: room.to_string(),
            message,
        };
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|e| RelayError::Internal(format!("envelope encoding failed: {e}")))
    }

    /// Decode a payload delivered by the broker.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        match self {
            BrokerEnvelope::Message { room_id, .. } => room_id,
        }
    }

    /// The text delivered to each room member.
    ///
    /// String payloads are delivered as their content; any other JSON value
    /// as its compact serialization.
    #[must_use]
    pub fn into_delivery(self) -> Arc<str> {
        match self {
            BrokerEnvelope::Message {
                message: Value::String(text),
                ..
            } => Arc::from(text),
            BrokerEnvelope::Message { message, .. } => Arc::from(message.to_string()),
        }
    }
}
