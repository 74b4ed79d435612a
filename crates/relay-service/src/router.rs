//! Router: per-connection request handling.
//!
//! Decodes one inbound frame at a time and drives the hub (membership) or the
//! bridge (publish). Rejected frames get an error frame on the same
//! connection; the connection itself is never closed by the router.
//!
//! A [`ConnectionSession`] is the router's view of one live connection. It is
//! consumed by [`ConnectionSession::close`], so cleanup runs exactly once.

use tracing::{debug, instrument, warn};

use crate::actors::SubscriptionHubHandle;
use crate::bridge::BrokerBridge;
use crate::errors::RelayError;
use crate::observability::metrics;
use crate::protocol::{decode_request, ClientRequest};
use crate::registry::{ConnectionHandle, ConnectionId, OutboundFrame};

/// Dispatches decoded requests to the hub and the bridge. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    hub: SubscriptionHubHandle,
    bridge: BrokerBridge,
}

impl Router {
    #[must_use]
    pub fn new(hub: SubscriptionHubHandle, bridge: BrokerBridge) -> Self {
        Self { hub, bridge }
    }

    /// Register a new connection and return its session.
    pub async fn connect(&self, handle: ConnectionHandle) -> Result<ConnectionSession, RelayError> {
        let id = self.hub.register(handle.clone()).await?;
        Ok(ConnectionSession {
            id,
            handle,
            router: self.clone(),
        })
    }

    /// Apply one decoded request on behalf of `connection_id`.
    pub async fn dispatch(
        &self,
        connection_id: ConnectionId,
        request: ClientRequest,
    ) -> Result<(), RelayError> {
        match request {
            ClientRequest::Subscribe { room } => {
                self.hub.subscribe(connection_id, room).await?;
            }
            ClientRequest::Unsubscribe { room } => {
                self.hub.unsubscribe(connection_id, room).await?;
            }
            ClientRequest::Publish { room_id, message } => {
                self.bridge.publish(&room_id, message).await?;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn hub(&self) -> &SubscriptionHubHandle {
        &self.hub
    }

    #[must_use]
    pub fn bridge(&self) -> &BrokerBridge {
        &self.bridge
    }
}

/// One registered connection, as seen by the router.
pub struct ConnectionSession {
    id: ConnectionId,
    handle: ConnectionHandle,
    router: Router,
}

impl ConnectionSession {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Handle one inbound frame.
    ///
    /// Failures are reported to the client as an error frame, except
    /// `UnknownConnection`, which only happens while this connection is
    /// being cleaned up and is ignored. The error is also returned for the
    /// caller's benefit.
    #[instrument(skip_all, fields(connection_id = %self.id))]
    pub async fn handle_frame(&self, frame: &[u8]) -> Result<(), RelayError> {
        let result = match decode_request(frame) {
            Ok(request) => {
                debug!(
                    target: "relay.router",
                    connection_id = %self.id,
                    kind = request.kind(),
                    "Request received"
                );
                self.router.dispatch(self.id, request).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            metrics::record_request_rejected(e.metric_reason());
            match e {
                RelayError::UnknownConnection(_) => {
                    debug!(
                        target: "relay.router",
                        connection_id = %self.id,
                        "Request raced connection cleanup, ignored"
                    );
                }
                _ => {
                    debug!(
                        target: "relay.router",
                        connection_id = %self.id,
                        bytes = frame.len(),
                        error = %e,
                        "Request rejected"
                    );
                    self.reply_error(&e.client_message()).await;
                }
            }
        }

        result
    }

    /// Send an error frame to this connection.
    pub async fn reply_error(&self, reason: &str) {
        let frame = OutboundFrame::Error {
            reason: reason.to_string(),
        };
        if self.handle.send(frame).await.is_err() {
            debug!(
                target: "relay.router",
                connection_id = %self.id,
                "Error frame not sent, connection writer gone"
            );
        }
    }

    /// Run full cleanup for this connection.
    ///
    /// Returns the rooms the connection left.
    #[instrument(skip_all, fields(connection_id = %self.id))]
    pub async fn close(self) -> Vec<String> {
        match self.router.hub.deregister(self.id).await {
            Ok(rooms) => {
                let rooms = rooms.unwrap_or_default();
                debug!(
                    target: "relay.router",
                    connection_id = %self.id,
                    rooms = rooms.len(),
                    "Connection cleaned up"
                );
                rooms
            }
            Err(e) => {
                warn!(
                    target: "relay.router",
                    connection_id = %self.id,
                    error = %e,
                    "Connection cleanup failed"
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerStatus, MemoryBroker};
    use crate::errors::BrokerError;
    use crate::membership::MembershipView;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn router() -> Router {
        let (broker, events) = MemoryBroker::standalone();
        let bridge = BrokerBridge::new(
            Arc::new(broker) as Arc<dyn Broker>,
            MembershipView::new(),
            BrokerStatus::new(),
        );
        bridge.spawn_listener(events, CancellationToken::new());
        let hub = SubscriptionHubHandle::new(bridge.clone(), CancellationToken::new());
        Router::new(hub, bridge)
    }

    async fn recv(rx: &mut mpsc::Receiver<OutboundFrame>) -> OutboundFrame {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound channel closed")
    }

    async fn settle(router: &Router) {
        for _ in 0..200 {
            if router.bridge().is_idle() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_and_connection_stays_usable() {
        let router = router();
        let (handle, mut rx) = ConnectionHandle::channel(8);
        let session = router.connect(handle).await.unwrap();

        let err = session.handle_frame(b"{not json").await.unwrap_err();
        assert!(matches!(err, RelayError::MalformedRequest(_)));
        assert!(matches!(recv(&mut rx).await, OutboundFrame::Error { .. }));

        let err = session
            .handle_frame(br#"{"kind":"join","room":"r"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::MalformedRequest(_)));
        assert!(matches!(recv(&mut rx).await, OutboundFrame::Error { .. }));

        session
            .handle_frame(br#"{"kind":"subscribe","room":"r"}"#)
            .await
            .unwrap();
        assert_eq!(
            router.hub().rooms_of(session.id()).await.unwrap().unwrap(),
            vec!["r"]
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_members_but_not_publisher() {
        let router = router();
        let (a_handle, mut a_rx) = ConnectionHandle::channel(8);
        let (c_handle, mut c_rx) = ConnectionHandle::channel(8);
        let a = router.connect(a_handle).await.unwrap();
        let c = router.connect(c_handle).await.unwrap();

        a.handle_frame(br#"{"kind":"subscribe","room":"room1"}"#)
            .await
            .unwrap();
        settle(&router).await;

        c.handle_frame(br#"{"kind":"publish","roomId":"room1","message":"hi"}"#)
            .await
            .unwrap();

        assert_eq!(
            recv(&mut a_rx).await,
            OutboundFrame::Delivery(Arc::from("hi"))
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_failure_is_reported_to_publisher() {
        let router = router();
        let (handle, mut rx) = ConnectionHandle::channel(8);
        let session = router.connect(handle).await.unwrap();
        router.bridge().status().mark_disconnected();

        let err = session
            .handle_frame(br#"{"kind":"publish","roomId":"room1","message":"hi"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Broker(BrokerError::Unavailable)));

        match recv(&mut rx).await {
            OutboundFrame::Error { reason } => assert!(!reason.is_empty()),
            other => unreachable!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_after_cleanup_is_silent() {
        let router = router();
        let (handle, mut rx) = ConnectionHandle::channel(8);
        let session = router.connect(handle.clone()).await.unwrap();
        let id = session.id();

        router.hub().deregister(id).await.unwrap();

        let err = session
            .handle_frame(br#"{"kind":"subscribe","room":"r"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownConnection(_)));
        assert!(rx.try_recv().is_err());

        assert!(session.close().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_returns_rooms_left() {
        let router = router();
        let (handle, _rx) = ConnectionHandle::channel(8);
        let session = router.connect(handle).await.unwrap();

        session
            .handle_frame(br#"{"kind":"subscribe","room":"b"}"#)
            .await
            .unwrap();
        session
            .handle_frame(br#"{"kind":"subscribe","room":"a"}"#)
            .await
            .unwrap();

        assert_eq!(session.close().await, vec!["a", "b"]);
        assert_eq!(router.hub().get_status().await.unwrap().connections, 0);
    }
}
