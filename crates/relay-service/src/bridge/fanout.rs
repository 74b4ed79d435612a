//! The bridge's single broker listener and local fan-out.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::BrokerBridge;
use crate::broker::{BrokerEvent, BrokerEvents};
use crate::observability::metrics;
use crate::protocol::BrokerEnvelope;
use crate::registry::OutboundFrame;

impl BrokerBridge {
    /// Start the one long-lived listener over the broker's event stream.
    ///
    /// Runs until `cancel_token` is cancelled or the stream ends.
    pub fn spawn_listener(
        &self,
        events: BrokerEvents,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let bridge = self.clone();
        tokio::spawn(bridge.listen(events, cancel_token))
    }

    #[instrument(skip_all, name = "relay.bridge.listener")]
    async fn listen(self, mut events: BrokerEvents, cancel_token: CancellationToken) {
        debug!(target: "relay.bridge", "Broker listener started");

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    debug!(target: "relay.bridge", "Broker listener cancelled");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!(target: "relay.bridge", "Broker event stream closed");
                        break;
                    }
                }
            }
        }

        info!(target: "relay.bridge", "Broker listener stopped");
    }

    fn handle_event(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::Message { channel, payload } => {
                self.fan_out(&channel, &payload);
            }
            BrokerEvent::Disconnected => {
                self.inner.status.mark_disconnected();
                metrics::set_broker_connected(false);
                warn!(target: "relay.bridge", "Broker link lost, delivery degraded");
            }
            BrokerEvent::Reconnected => {
                self.inner.status.mark_reconnected();
                metrics::set_broker_connected(true);
                metrics::record_broker_reconnect();
                info!(
                    target: "relay.bridge",
                    reconnects = self.inner.status.reconnect_count(),
                    "Broker link restored"
                );
                self.on_broker_reconnect();
            }
        }
    }

    /// Deliver one broker payload to every current local member of `channel`.
    ///
    /// Each member is handed the payload exactly once through a non-blocking
    /// enqueue; a full or closed queue loses only that member's copy. Returns
    /// the number of members the payload was queued for.
    pub fn fan_out(&self, channel: &str, payload: &[u8]) -> usize {
        let envelope = match BrokerEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::record_delivery_dropped("invalid_envelope");
                warn!(
                    target: "relay.bridge",
                    channel = %channel,
                    bytes = payload.len(),
                    error = %e,
                    "Dropping undecodable broker message"
                );
                return 0;
            }
        };

        if envelope.room_id() != channel {
            metrics::record_delivery_dropped("invalid_envelope");
            warn!(
                target: "relay.bridge",
                channel = %channel,
                "Dropping broker message addressed to another room"
            );
            return 0;
        }

        let Some(members) = self.inner.view.members_of(channel) else {
            trace!(target: "relay.bridge", channel = %channel, "No local members");
            return 0;
        };

        let delivery = envelope.into_delivery();
        let mut delivered = 0;
        for member in members.iter() {
            match member
                .handle
                .try_deliver(OutboundFrame::Delivery(delivery.clone()))
            {
                Ok(()) => delivered += 1,
                Err(failure) => {
                    metrics::record_delivery_dropped(failure.as_str());
                    debug!(
                        target: "relay.bridge",
                        channel = %channel,
                        connection_id = %member.id,
                        reason = failure.as_str(),
                        "Delivery dropped"
                    );
                }
            }
        }

        metrics::record_messages_delivered(delivered);
        trace!(
            target: "relay.bridge",
            channel = %channel,
            members = members.len(),
            delivered = delivered,
            "Fan-out complete"
        );
        delivered
    }
}
