//! Room Relay Service Library
//!
//! A WebSocket service that lets clients join named rooms and broadcast JSON
//! messages to every member of a room, across any number of relay instances
//! sharing one Redis pub/sub broker.
//!
//! # Architecture
//!
//! ```text
//! WebSocket connection (transport)
//!   └── ConnectionSession (router) ── subscribe/unsubscribe ──> SubscriptionHub actor
//!                                 └── publish ──> BrokerBridge ──> Broker
//!
//! SubscriptionHub (single writer)
//! ├── owns ConnectionRegistry + RoomIndex
//! ├── publishes MembershipView snapshots
//! └── enqueues per-room subscribe/unsubscribe lanes on the BrokerBridge
//!
//! BrokerBridge
//! ├── one lane per room, drained in hub order
//! └── one listener: broker message -> MembershipView -> outbound queues
//! ```
//!
//! # Key Design Decisions
//!
//! - **One broker subscription per room per instance**, held while the room
//!   has at least one local member
//! - **No awaits inside a hub step**: broker round trips run on room lanes,
//!   never blocking membership changes
//! - **Bounded outbound queues**: a slow client loses messages, it never
//!   stalls fan-out to others
//! - **Fail fast while the broker is down**: publishes are rejected with an
//!   error frame, subscriptions are restored on reconnect
//!
//! # Modules
//!
//! - [`actors`] - Subscription hub actor and mailbox monitoring
//! - [`bridge`] - Broker subscriptions and local fan-out
//! - [`broker`] - Broker abstraction with Redis and in-memory backends
//! - [`config`] - Service configuration from environment
//! - [`transport`] - WebSocket endpoint

pub mod actors;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod errors;
pub mod membership;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod transport;
