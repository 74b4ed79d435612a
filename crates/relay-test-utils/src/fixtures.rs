//! Test fixtures: an in-process relay node and scripted clients.
//!
//! A [`TestRelay`] wires bridge, listener, hub and router over any broker,
//! without the WebSocket layer. A [`TestClient`] is one registered
//! connection with direct access to its outbound queue.

use std::sync::Arc;
use std::time::Duration;

use relay_service::actors::SubscriptionHubHandle;
use relay_service::bridge::BrokerBridge;
use relay_service::broker::{Broker, BrokerEvents, BrokerStatus, MemoryBus};
use relay_service::errors::RelayError;
use relay_service::membership::MembershipView;
use relay_service::registry::{ConnectionHandle, ConnectionId, OutboundFrame};
use relay_service::router::{ConnectionSession, Router};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::eventual::assert_eventually;

/// Outbound queue capacity of clients created with [`TestRelay::client`].
pub const TEST_OUTBOUND_BUFFER: usize = 64;

/// How long [`TestClient::recv`] waits for a frame.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// One relay node without the WebSocket layer.
pub struct TestRelay {
    pub router: Router,
    pub cancel_token: CancellationToken,
    listener: JoinHandle<()>,
}

impl TestRelay {
    /// Start a node over `broker` and its event stream.
    #[must_use]
    pub fn start(broker: Arc<dyn Broker>, events: BrokerEvents) -> Self {
        let cancel_token = CancellationToken::new();
        let bridge = BrokerBridge::new(broker, MembershipView::new(), BrokerStatus::new());
        let listener = bridge.spawn_listener(events, cancel_token.child_token());
        let hub = SubscriptionHubHandle::new(bridge.clone(), cancel_token.child_token());
        Self {
            router: Router::new(hub, bridge),
            cancel_token,
            listener,
        }
    }

    /// Start a node attached to a shared in-process bus.
    #[must_use]
    pub fn on_bus(bus: &MemoryBus) -> Self {
        let (broker, events) = bus.connect();
        Self::start(Arc::new(broker), events)
    }

    /// Register a client with the default queue capacity.
    pub async fn client(&self) -> TestClient {
        self.client_with_buffer(TEST_OUTBOUND_BUFFER).await
    }

    /// Register a client whose outbound queue holds `buffer` frames.
    pub async fn client_with_buffer(&self, buffer: usize) -> TestClient {
        let (handle, outbound) = ConnectionHandle::channel(buffer);
        let session = self
            .router
            .connect(handle)
            .await
            .expect("hub should accept registration");
        TestClient { session, outbound }
    }

    #[must_use]
    pub fn bridge(&self) -> &BrokerBridge {
        self.router.bridge()
    }

    #[must_use]
    pub fn hub(&self) -> &SubscriptionHubHandle {
        self.router.hub()
    }

    /// Wait until every broker lane has drained.
    pub async fn settle(&self) {
        let bridge = self.bridge().clone();
        assert_eventually("broker lanes drained", move || bridge.is_idle()).await;
    }

    /// Wait until the broker subscription state of `room` is `subscribed`.
    pub async fn wait_subscribed(&self, room: &str, subscribed: bool) {
        let bridge = self.bridge().clone();
        let room = room.to_string();
        assert_eventually(&format!("room {room} subscribed={subscribed}"), move || {
            bridge.is_subscribed(&room) == subscribed
        })
        .await;
    }

    /// Check that membership, the published view and broker subscriptions
    /// agree once the lanes are drained.
    pub async fn assert_consistent(&self) {
        self.settle().await;

        let view = self.bridge().view();
        let mut occupied = view.occupied_rooms();
        occupied.sort();
        assert_eq!(
            self.bridge().active_rooms(),
            occupied,
            "broker subscriptions should match occupied rooms"
        );

        let status = self.hub().get_status().await.expect("hub should be running");
        assert_eq!(status.rooms, occupied.len());

        for room in &occupied {
            let mut members = self
                .hub()
                .members_of(room.clone())
                .await
                .expect("hub should be running");
            members.sort();
            let mut viewed: Vec<ConnectionId> = view
                .members_of(room)
                .map(|members| members.iter().map(|m| m.id).collect())
                .unwrap_or_default();
            viewed.sort();
            assert_eq!(members, viewed, "view of {room} should match the hub");
        }
    }

    /// Stop the hub and the listener.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
        self.listener.abort();
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One registered connection.
pub struct TestClient {
    session: ConnectionSession,
    outbound: mpsc::Receiver<OutboundFrame>,
}

impl TestClient {
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.session.id()
    }

    /// Send a raw inbound frame.
    pub async fn send_raw(&self, frame: &str) -> Result<(), RelayError> {
        self.session.handle_frame(frame.as_bytes()).await
    }

    pub async fn subscribe(&self, room: &str) {
        self.send_raw(&json!({ "kind": "subscribe", "room": room }).to_string())
            .await
            .expect("subscribe should succeed");
    }

    pub async fn unsubscribe(&self, room: &str) {
        self.send_raw(&json!({ "kind": "unsubscribe", "room": room }).to_string())
            .await
            .expect("unsubscribe should succeed");
    }

    pub async fn publish(&self, room: &str, message: Value) -> Result<(), RelayError> {
        self.send_raw(&json!({ "kind": "publish", "roomId": room, "message": message }).to_string())
            .await
    }

    /// Next outbound frame, or `None` if nothing arrives in time.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        tokio::time::timeout(RECV_TIMEOUT, self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next frame, which must be a delivery.
    pub async fn expect_delivery(&mut self) -> String {
        match self.recv().await {
            Some(OutboundFrame::Delivery(text)) => text.to_string(),
            other => panic!("expected a delivery, got {other:?}"),
        }
    }

    /// Next frame, which must be an error frame. Returns its reason.
    pub async fn expect_error(&mut self) -> String {
        match self.recv().await {
            Some(OutboundFrame::Error { reason }) => reason,
            other => panic!("expected an error frame, got {other:?}"),
        }
    }

    /// Assert that nothing is received for `quiet`.
    pub async fn expect_nothing(&mut self, quiet: Duration) {
        if let Ok(frame) = tokio::time::timeout(quiet, self.outbound.recv()).await {
            panic!("expected no frame, got {frame:?}");
        }
    }

    /// Frames already queued, without waiting.
    pub fn drain(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Disconnect: run cleanup and return the rooms left.
    pub async fn close(self) -> Vec<String> {
        self.session.close().await
    }
}
