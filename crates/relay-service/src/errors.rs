//! Room Relay error types.
//!
//! Errors map to the `reason` text of the `{ "kind": "error" }` frame sent back
//! to a client. Internal details are logged server-side but not exposed to clients.

use thiserror::Error;

use crate::registry::ConnectionId;

/// Relay service error type.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Operation referenced a connection that is not (or no longer) registered.
    ///
    /// Callers treat this as a no-op: the connection's own cleanup has already
    /// run or is in flight.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Inbound frame could not be decoded into a request.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Broker operation failed.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Actor mailbox or response channel failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            RelayError::MalformedRequest(reason) => reason.clone(),
            RelayError::Broker(_) => "Message could not be relayed, please retry".to_string(),
            RelayError::UnknownConnection(_) => "Connection is closing".to_string(),
            RelayError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Bounded label for the `relay_requests_rejected_total` metric.
    #[must_use]
    pub const fn metric_reason(&self) -> &'static str {
        match self {
            RelayError::UnknownConnection(_) => "unknown_connection",
            RelayError::MalformedRequest(_) => "malformed",
            RelayError::Broker(_) => "broker",
            RelayError::Internal(_) => "internal",
        }
    }
}

/// Broker transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker link is down (between loss and successful reconnect).
    #[error("Broker unavailable")]
    Unavailable,

    /// A broker command failed.
    #[error("Broker command {operation} failed: {message}")]
    Command {
        operation: &'static str,
        message: String,
    },

    /// The broker's background task has stopped.
    #[error("Broker closed")]
    Closed,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_hide_internal_details() {
        let err = RelayError::Broker(BrokerError::Command {
            operation: "publish",
            message: "connection refused at 10.0.0.7:6379".to_string(),
        });
        assert!(!err.client_message().contains("10.0.0.7"));

        let err = RelayError::Internal("hub mailbox closed".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_malformed_request_message_is_passed_through() {
        let err = RelayError::MalformedRequest("unknown kind `join`".to_string());
        assert_eq!(err.client_message(), "unknown kind `join`");
        assert_eq!(err.metric_reason(), "malformed");
    }

    #[test]
    fn test_broker_error_conversion() {
        let err: RelayError = BrokerError::Unavailable.into();
        assert!(matches!(err, RelayError::Broker(BrokerError::Unavailable)));
        assert_eq!(err.metric_reason(), "broker");
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!(
                "{}",
                BrokerError::Command {
                    operation: "subscribe",
                    message: "timeout".to_string()
                }
            ),
            "Broker command subscribe failed: timeout"
        );
        assert_eq!(
            format!("{}", RelayError::Broker(BrokerError::Closed)),
            "Broker error: Broker closed"
        );
    }
}
