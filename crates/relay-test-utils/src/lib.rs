//! # Relay Test Utilities
//!
//! Shared test utilities for the Room Relay service.
//!
//! ## Modules
//!
//! - `mock_broker` - Scriptable broker with call recording and fault injection
//! - `fixtures` - In-process relay nodes and scripted clients
//! - `eventual` - Polling helpers for state that converges in the background
//! - `fake_redis` - RESP2 server on localhost for driving the Redis broker
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let (broker, events) = MockBroker::new();
//!     let relay = TestRelay::start(Arc::new(broker.clone()), events);
//!
//!     let mut alice = relay.client().await;
//!     alice.subscribe("lobby").await;
//!     relay.wait_subscribed("lobby", true).await;
//!
//!     alice.publish("lobby", json!("hi")).await.unwrap();
//!     assert_eq!(alice.expect_delivery().await, "hi");
//! }
//! ```

pub mod eventual;
pub mod fake_redis;
pub mod fixtures;
pub mod mock_broker;

pub use eventual::*;
pub use fake_redis::*;
pub use fixtures::*;
pub use mock_broker::*;
