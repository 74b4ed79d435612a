//! Redis pub/sub broker.
//!
//! Two connections are used:
//!
//! - a `ConnectionManager` for `PUBLISH` (cheaply cloneable, reconnects on
//!   its own),
//! - a dedicated pub/sub connection owned by a background subscriber task.
//!
//! The subscriber task is the only owner of the pub/sub connection, split into
//! a command sink and one long-lived message stream for the connection's
//! lifetime. Commands reach it over an mpsc mailbox with a oneshot reply.
//! When the message stream ends, the task emits [`BrokerEvent::Disconnected`],
//! reconnects with bounded exponential backoff, and emits
//! [`BrokerEvent::Reconnected`]. Redis drops subscriptions with the
//! connection, so restoring them is the bridge's job.
//!
//! Channel names are room names verbatim.

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub, PubSubSink};
use redis::{AsyncCommands, Client, Msg, RedisError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::backoff::{Backoff, BackoffConfig};
use super::{Broker, BrokerEvent, BrokerEvents, EVENT_CHANNEL_BUFFER};
use crate::errors::BrokerError;
use crate::observability::metrics;

/// Mailbox size for subscriber task commands.
const COMMAND_CHANNEL_BUFFER: usize = 256;

/// Commands for the subscriber task.
#[derive(Debug)]
enum PubSubCommand {
    Subscribe {
        channel: String,
        respond_to: oneshot::Sender<Result<(), BrokerError>>,
    },
    Unsubscribe {
        channel: String,
        respond_to: oneshot::Sender<Result<(), BrokerError>>,
    },
}

/// Redis-backed [`Broker`].
pub struct RedisBroker {
    publisher: ConnectionManager,
    commands: mpsc::Sender<PubSubCommand>,
}

impl RedisBroker {
    /// Connect both Redis connections and start the subscriber task.
    ///
    /// The task stops when `cancel_token` is cancelled or the broker is dropped.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Unavailable` if Redis cannot be reached.
    pub async fn connect(
        redis_url: &str,
        backoff: BackoffConfig,
        cancel_token: CancellationToken,
    ) -> Result<(Self, BrokerEvents), BrokerError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Note: Do NOT log redis_url as it may contain credentials
            error!(
                target: "relay.broker.redis",
                error = %e,
                "Failed to open Redis client"
            );
            BrokerError::Unavailable
        })?;

        let publisher = ConnectionManager::new(client.clone()).await.map_err(|e| {
            error!(
                target: "relay.broker.redis",
                error = %e,
                "Failed to connect Redis publisher"
            );
            BrokerError::Unavailable
        })?;

        let pubsub = client.get_async_pubsub().await.map_err(|e| {
            error!(
                target: "relay.broker.redis",
                error = %e,
                "Failed to open Redis pub/sub connection"
            );
            BrokerError::Unavailable
        })?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);

        let subscriber = Subscriber {
            client,
            commands: commands_rx,
            events: events_tx,
            backoff: Backoff::new(backoff),
            cancel_token,
        };
        tokio::spawn(subscriber.run(pubsub));

        info!(target: "relay.broker.redis", "Redis broker connected");

        Ok((
            Self {
                publisher,
                commands: commands_tx,
            },
            events_rx,
        ))
    }

    async fn request(
        &self,
        operation: &'static str,
        make: impl FnOnce(oneshot::Sender<Result<(), BrokerError>>) -> PubSubCommand,
    ) -> Result<(), BrokerError> {
        let started = Instant::now();
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| BrokerError::Closed)?;
        let result = rx.await.map_err(|_| BrokerError::Closed)?;
        metrics::record_broker_operation(operation, started.elapsed(), result.is_ok());
        result
    }
}

#[async_trait]
impl Broker for RedisBroker {
    #[instrument(skip_all, fields(channel = %channel))]
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        let started = Instant::now();
        let mut conn = self.publisher.clone();

        let result: Result<i64, RedisError> = conn.publish(channel, payload.to_vec()).await;
        metrics::record_broker_operation("publish", started.elapsed(), result.is_ok());

        match result {
            Ok(receivers) => {
                debug!(
                    target: "relay.broker.redis",
                    channel = %channel,
                    receivers = receivers,
                    "Published"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    target: "relay.broker.redis",
                    error = %e,
                    channel = %channel,
                    "Failed to publish"
                );
                Err(map_redis_error("publish", &e))
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        let channel = channel.to_string();
        self.request("subscribe", |respond_to| PubSubCommand::Subscribe {
            channel,
            respond_to,
        })
        .await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        let channel = channel.to_string();
        self.request("unsubscribe", |respond_to| PubSubCommand::Unsubscribe {
            channel,
            respond_to,
        })
        .await
    }
}

/// Connection-level failures mean the link is down; anything else is a
/// rejected command.
fn map_redis_error(operation: &'static str, e: &RedisError) -> BrokerError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        BrokerError::Unavailable
    } else {
        BrokerError::Command {
            operation,
            message: e.to_string(),
        }
    }
}

/// One iteration's outcome of the subscriber loop.
enum Step {
    Shutdown,
    Command(PubSubCommand),
    Message(Option<Msg>),
}

/// Owner of the pub/sub connection.
struct Subscriber {
    client: Client,
    commands: mpsc::Receiver<PubSubCommand>,
    events: mpsc::Sender<BrokerEvent>,
    backoff: Backoff,
    cancel_token: CancellationToken,
}

impl Subscriber {
    async fn run(mut self, pubsub: PubSub) {
        debug!(target: "relay.broker.redis", "Subscriber task started");

        let (mut sink, mut messages) = pubsub.split();

        loop {
            let step = tokio::select! {
                () = self.cancel_token.cancelled() => Step::Shutdown,
                command = self.commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Shutdown,
                },
                message = messages.next() => Step::Message(message),
            };

            match step {
                Step::Shutdown => break,
                // Deliveries keep buffering in `messages` while a command waits
                // for its acknowledgement.
                Step::Command(command) => Self::execute(&mut sink, command).await,
                Step::Message(Some(msg)) => {
                    if !self.forward(&msg).await {
                        break;
                    }
                }
                Step::Message(None) => {
                    warn!(target: "relay.broker.redis", "Pub/sub connection lost");
                    match self.recover().await {
                        Some(fresh) => (sink, messages) = fresh.split(),
                        None => break,
                    }
                }
            }
        }

        info!(target: "relay.broker.redis", "Subscriber task stopped");
    }

    async fn execute(sink: &mut PubSubSink, command: PubSubCommand) {
        match command {
            PubSubCommand::Subscribe {
                channel,
                respond_to,
            } => {
                let result = sink.subscribe(&channel).await.map_err(|e| {
                    warn!(
                        target: "relay.broker.redis",
                        error = %e,
                        channel = %channel,
                        "Failed to subscribe"
                    );
                    map_redis_error("subscribe", &e)
                });
                let _ = respond_to.send(result);
            }
            PubSubCommand::Unsubscribe {
                channel,
                respond_to,
            } => {
                let result = sink.unsubscribe(&channel).await.map_err(|e| {
                    warn!(
                        target: "relay.broker.redis",
                        error = %e,
                        channel = %channel,
                        "Failed to unsubscribe"
                    );
                    map_redis_error("unsubscribe", &e)
                });
                let _ = respond_to.send(result);
            }
        }
    }

    /// Pass a delivered message on. Returns `false` once nobody is listening.
    async fn forward(&self, msg: &Msg) -> bool {
        let event = BrokerEvent::Message {
            channel: msg.get_channel_name().to_string(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        };
        self.events.send(event).await.is_ok()
    }

    /// Reconnect with backoff. Returns `None` on shutdown.
    ///
    /// Commands arriving while the link is down fail fast with
    /// `BrokerError::Unavailable`.
    async fn recover(&mut self) -> Option<PubSub> {
        if self.events.send(BrokerEvent::Disconnected).await.is_err() {
            return None;
        }

        loop {
            let delay = self.backoff.next_delay();
            warn!(
                target: "relay.broker.redis",
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting pub/sub after delay"
            );

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = self.cancel_token.cancelled() => return None,
                    () = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        Some(command) => reject_unavailable(command),
                        None => return None,
                    },
                }
            }

            match self.client.get_async_pubsub().await {
                Ok(pubsub) => {
                    self.backoff.reset();
                    info!(target: "relay.broker.redis", "Pub/sub connection restored");
                    if self.events.send(BrokerEvent::Reconnected).await.is_err() {
                        return None;
                    }
                    return Some(pubsub);
                }
                Err(e) => {
                    warn!(
                        target: "relay.broker.redis",
                        error = %e,
                        "Pub/sub reconnect failed"
                    );
                }
            }
        }
    }
}

fn reject_unavailable(command: PubSubCommand) {
    let respond_to = match command {
        PubSubCommand::Subscribe { respond_to, .. }
        | PubSubCommand::Unsubscribe { respond_to, .. } => respond_to,
    };
    let _ = respond_to.send(Err(BrokerError::Unavailable));
}
