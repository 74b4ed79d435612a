//! Actor model for the Room Relay.
//!
//! ```text
//! SubscriptionHub (singleton per relay instance)
//! ├── owns ConnectionRegistry + RoomIndex
//! ├── publishes MembershipView snapshots (read by fan-out)
//! └── enqueues broker transitions on the BrokerBridge lanes
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer**: every membership mutation goes through the hub mailbox
//! - **Non-blocking steps**: the hub never awaits while handling a message
//! - **CancellationToken propagation**: the hub runs under a child token of
//!   the process root
//! - **Mailbox monitoring**: depth thresholds 500/2000 with a gauge
//!
//! # Modules
//!
//! - [`hub`] - `SubscriptionHub` actor and its handle
//! - [`messages`] - Message types for the hub
//! - [`metrics`] - Mailbox monitoring

pub mod hub;
pub mod messages;
pub mod metrics;

pub use hub::SubscriptionHubHandle;
pub use messages::{HubMessage, HubStatus};
pub use metrics::{MailboxLevel, MailboxMonitor};
