//! Observability for the Room Relay.
//!
//! Instrumentation uses `#[instrument(skip_all)]` with explicit safe fields.
//! Message payloads are never logged or used as labels, only their sizes.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `relay_connections_active` | Gauge | none | Registered connections |
//! | `relay_rooms_active` | Gauge | none | Rooms with local members |
//! | `relay_hub_mailbox_depth` | Gauge | none | Hub backpressure |
//! | `relay_broker_subscriptions_active` | Gauge | none | Live broker subscriptions |
//! | `relay_broker_connected` | Gauge | none | Broker link state |
//! | `relay_broker_reconnects_total` | Counter | none | Link recoveries |
//! | `relay_broker_operation_seconds` | Histogram | `operation` | Broker round trips |
//! | `relay_broker_operation_failures_total` | Counter | `operation` | Failed broker commands |
//! | `relay_messages_published_total` | Counter | none | Accepted publishes |
//! | `relay_publish_dropped_total` | Counter | none | Lost publishes |
//! | `relay_messages_delivered_total` | Counter | none | Per-recipient deliveries |
//! | `relay_deliveries_dropped_total` | Counter | `reason` | Lost deliveries |
//! | `relay_requests_rejected_total` | Counter | `reason` | Rejected client requests |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
