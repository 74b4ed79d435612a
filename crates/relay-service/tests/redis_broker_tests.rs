//! Redis broker tests against an in-process RESP2 server.
//!
//! Covers what only the real wire path shows:
//! - Several deliveries arriving in one socket read
//! - A delivery arriving ahead of a subscribe acknowledgement
//! - Link loss, commands during the outage, and reconnect

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use relay_service::broker::{BackoffConfig, Broker, BrokerEvent, BrokerEvents, RedisBroker};
use relay_service::errors::BrokerError;
use relay_test_utils::{assert_eventually, FakeRedis, TestRelay};
use tokio_util::sync::CancellationToken;

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        min: Duration::from_millis(20),
        max: Duration::from_millis(100),
    }
}

async fn connect(redis: &FakeRedis) -> (RedisBroker, BrokerEvents, CancellationToken) {
    let cancel_token = CancellationToken::new();
    let (broker, events) = RedisBroker::connect(&redis.url(), fast_backoff(), cancel_token.clone())
        .await
        .expect("broker should connect to the fake server");
    (broker, events, cancel_token)
}

async fn next_event(events: &mut BrokerEvents) -> BrokerEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for a broker event")
        .expect("broker event stream ended")
}

fn message(channel: &str, payload: &str) -> BrokerEvent {
    BrokerEvent::Message {
        channel: channel.to_string(),
        payload: Bytes::copy_from_slice(payload.as_bytes()),
    }
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_burst_in_one_read_is_delivered_in_full() {
    let redis = FakeRedis::start().await;
    let (broker, mut events, _cancel) = connect(&redis).await;

    broker.subscribe("room1").await.unwrap();
    let payloads = ["m0", "m1", "m2", "m3", "m4"];
    assert_eq!(redis.burst("room1", &payloads), 1);

    for payload in payloads {
        assert_eq!(next_event(&mut events).await, message("room1", payload));
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(100), events.recv())
            .await
            .is_err(),
        "no duplicates"
    );
}

#[tokio::test]
async fn test_delivery_ahead_of_subscribe_ack_is_kept() {
    let redis = FakeRedis::start().await;
    let (broker, mut events, _cancel) = connect(&redis).await;

    broker.subscribe("room1").await.unwrap();
    redis.deliver_ahead_of_next_ack("room1", "early");

    broker.subscribe("room2").await.unwrap();
    assert_eq!(next_event(&mut events).await, message("room1", "early"));
    assert_eq!(
        redis.subscriptions(),
        vec!["room1".to_string(), "room2".to_string()]
    );

    redis.burst("room2", &["after"]);
    assert_eq!(next_event(&mut events).await, message("room2", "after"));
}

#[tokio::test]
async fn test_publish_loops_back_to_own_subscription() {
    let redis = FakeRedis::start().await;
    let (broker, mut events, _cancel) = connect(&redis).await;

    broker.subscribe("room1").await.unwrap();
    broker
        .publish("room1", Bytes::from_static(b"hello"))
        .await
        .unwrap();

    assert_eq!(next_event(&mut events).await, message("room1", "hello"));
    assert_eq!(
        redis.published(),
        vec![("room1".to_string(), b"hello".to_vec())]
    );
}

#[tokio::test]
async fn test_unsubscribe_is_acknowledged() {
    let redis = FakeRedis::start().await;
    let (broker, _events, _cancel) = connect(&redis).await;

    broker.subscribe("room1").await.unwrap();
    broker.unsubscribe("room1").await.unwrap();
    assert!(redis.subscriptions().is_empty());
}

// ============================================================================
// Link Loss and Recovery
// ============================================================================

#[tokio::test]
async fn test_link_loss_then_reconnect() {
    let redis = FakeRedis::start().await;
    let (broker, mut events, _cancel) = connect(&redis).await;
    broker.subscribe("room1").await.unwrap();

    redis.set_refusing(true);
    redis.disconnect_all();
    assert_eq!(next_event(&mut events).await, BrokerEvent::Disconnected);

    // Commands during the outage fail fast instead of waiting for the link
    assert_eq!(
        broker.subscribe("room2").await,
        Err(BrokerError::Unavailable)
    );

    redis.set_refusing(false);
    assert_eq!(next_event(&mut events).await, BrokerEvent::Reconnected);

    // Subscriptions died with the old connection
    assert!(redis.subscriptions().is_empty());
    broker.subscribe("room1").await.unwrap();
    redis.burst("room1", &["back"]);
    assert_eq!(next_event(&mut events).await, message("room1", "back"));
}

#[tokio::test]
async fn test_cancel_stops_subscriber() {
    let redis = FakeRedis::start().await;
    let (broker, mut events, cancel) = connect(&redis).await;

    cancel.cancel();
    let ended = tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("event stream should close after cancel");
    assert_eq!(ended, None);
    assert_eq!(broker.subscribe("room1").await, Err(BrokerError::Closed));
}

// ============================================================================
// Relay Over Redis
// ============================================================================

#[tokio::test]
async fn test_relay_delivers_every_message_of_a_burst_once() {
    let redis = FakeRedis::start().await;
    let (broker, events, _cancel) = connect(&redis).await;
    let relay = TestRelay::start(Arc::new(broker), events);

    let mut a = relay.client().await;
    let mut b = relay.client().await;
    a.subscribe("room1").await;
    b.subscribe("room1").await;
    relay.wait_subscribed("room1", true).await;
    assert_eq!(redis.subscriptions(), vec!["room1".to_string()]);

    let envelopes: Vec<String> = (0..5)
        .map(|n| format!(r#"{{"kind":"message","roomId":"room1","message":"m{n}"}}"#))
        .collect();
    let envelopes: Vec<&str> = envelopes.iter().map(String::as_str).collect();
    redis.burst("room1", &envelopes);

    for n in 0..5 {
        assert_eq!(a.expect_delivery().await, format!("m{n}"));
        assert_eq!(b.expect_delivery().await, format!("m{n}"));
    }
    a.expect_nothing(Duration::from_millis(100)).await;
    b.expect_nothing(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_relay_restores_rooms_after_redis_reconnect() {
    let redis = FakeRedis::start().await;
    let (broker, events, _cancel) = connect(&redis).await;
    let relay = TestRelay::start(Arc::new(broker), events);

    let mut a = relay.client().await;
    a.subscribe("room1").await;
    a.subscribe("room2").await;
    relay.wait_subscribed("room1", true).await;
    relay.wait_subscribed("room2", true).await;

    redis.disconnect_all();

    let status = Arc::clone(relay.bridge().status());
    assert_eventually("broker link restored", move || status.reconnect_count() >= 1).await;
    assert_eventually("rooms resubscribed", || redis.subscriptions().len() == 2).await;
    assert_eq!(
        redis.subscriptions(),
        vec!["room1".to_string(), "room2".to_string()]
    );
    relay.assert_consistent().await;

    redis.burst(
        "room2",
        &[r#"{"kind":"message","roomId":"room2","message":"again"}"#],
    );
    assert_eq!(a.expect_delivery().await, "again");
}
