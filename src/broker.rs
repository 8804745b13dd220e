//! Broker transport.
//!
//! Service-to-service traffic travels a topic exchange with routing keys of
//! the form `message.<recipient>`. Three publish modes: fire-and-forget,
//! publish with a caller-supplied reply queue, and implicit RPC over the
//! direct-reply pseudo-queue with a single-shot waiter per correlation id.
//!
//! The [`BrokerTransport`] trait is the seam the router depends on; the
//! AMQP implementation lives behind it so tests can substitute a double.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::PostOfficeConfig;
use crate::domain_types::CorrelationId;
use crate::error::BrokerError;
use crate::message::Message;
use crate::readiness::Readiness;
use crate::router::{MessageOrigin, Router};

/// RabbitMQ's direct-reply pseudo-queue.
const DIRECT_REPLY_QUEUE: &str = "amq.rabbitmq.reply-to";

/// Routing key prefix for all service-bound traffic.
const ROUTING_KEY_PREFIX: &str = "message.";

/// Builds the routing key for a recipient.
#[must_use]
pub fn routing_key_for(recipient: &str) -> String {
    format!("{ROUTING_KEY_PREFIX}{recipient}")
}

/// Abstract broker transport the router publishes through.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Whether the transport currently has a usable connection.
    fn is_connected(&self) -> bool;

    /// Fire-and-forget publish. Correlation/reply metadata already present
    /// on the message is carried through to the broker properties.
    async fn publish(&self, routing_key: &str, message: &Message) -> Result<(), BrokerError>;

    /// Implicit RPC: stamps a fresh correlation id and the direct-reply
    /// queue onto the message, publishes, and waits for the matching reply.
    async fn request(&self, routing_key: &str, message: Message) -> Result<Message, BrokerError>;

    /// Offers an inbound response to the pending-reply registry. Returns
    /// whether a waiter consumed it.
    fn complete_reply(&self, correlation_id: &str, message: Message) -> bool;
}

/// AMQP-backed transport.
pub struct AmqpBroker {
    uri: String,
    exchange: String,
    self_keys: Vec<String>,
    rpc_timeout: Duration,
    readiness: Arc<Readiness>,
    channel: RwLock<Option<Channel>>,
    pending: DashMap<String, oneshot::Sender<Message>>,
}

impl AmqpBroker {
    #[must_use]
    pub fn new(config: &PostOfficeConfig, readiness: Arc<Readiness>) -> Self {
        let mut self_keys = vec![routing_key_for("PostOffice")];
        let own_key = routing_key_for(&config.component_id);
        if !self_keys.contains(&own_key) {
            self_keys.push(own_key);
        }
        Self {
            uri: config.broker_url.clone(),
            exchange: config.exchange.clone(),
            self_keys,
            rpc_timeout: config.rpc_timeout,
            readiness,
            channel: RwLock::new(None),
            pending: DashMap::new(),
        }
    }

    fn current_channel(&self) -> Result<Channel, BrokerError> {
        self.channel
            .read()
            .expect("broker channel lock poisoned")
            .clone()
            .ok_or(BrokerError::NotConnected)
    }

    fn install_channel(&self, channel: Channel) {
        *self.channel.write().expect("broker channel lock poisoned") = Some(channel);
    }

    fn clear_channel(&self) {
        *self.channel.write().expect("broker channel lock poisoned") = None;
    }

    /// Liveness of the underlying channel, for the health probe.
    #[must_use]
    pub fn channel_alive(&self) -> bool {
        self.channel
            .read()
            .expect("broker channel lock poisoned")
            .as_ref()
            .is_some_and(|channel| channel.status().connected())
    }

    async fn publish_raw(
        &self,
        routing_key: &str,
        message: &Message,
        properties: BasicProperties,
    ) -> Result<(), BrokerError> {
        let channel = self.current_channel()?;
        let payload = serde_json::to_vec(message)?;
        let _confirm = channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(BrokerError::Publish)?;
        debug!(routing_key, kind = %message.kind, "published");
        Ok(())
    }

    fn properties_for(message: &Message) -> BasicProperties {
        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if let Some(correlation_id) = message.correlation_id.as_deref() {
            properties = properties.with_correlation_id(correlation_id.into());
        }
        if let Some(reply_to) = message.reply_to.as_deref() {
            properties = properties.with_reply_to(reply_to.into());
        }
        properties
    }

    /// Attempts one connection: opens a channel, declares the exchange,
    /// binds this broker's own queue, and starts both consumers.
    async fn connect_once(&self) -> Result<(Connection, Consumer, Consumer), BrokerError> {
        let connection =
            Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        for key in &self.self_keys {
            channel
                .queue_bind(
                    queue.name().as_str(),
                    &self.exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        let inbound = channel
            .basic_consume(
                queue.name().as_str(),
                "postoffice-inbound",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        // Direct-reply deliveries arrive on the publishing channel; the
        // consumer must be up (no_ack) before the first RPC publish.
        let replies = channel
            .basic_consume(
                DIRECT_REPLY_QUEUE,
                "postoffice-replies",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.install_channel(channel);
        Ok((connection, inbound, replies))
    }
}

#[async_trait]
impl BrokerTransport for AmqpBroker {
    fn is_connected(&self) -> bool {
        self.readiness.broker_connected()
    }

    async fn publish(&self, routing_key: &str, message: &Message) -> Result<(), BrokerError> {
        self.publish_raw(routing_key, message, Self::properties_for(message))
            .await
    }

    async fn request(&self, routing_key: &str, mut message: Message) -> Result<Message, BrokerError> {
        let correlation_id = CorrelationId::generate();
        message.correlation_id = Some(correlation_id.to_string());
        message.reply_to = Some(DIRECT_REPLY_QUEUE.to_string());

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(correlation_id.to_string(), reply_tx);

        if let Err(err) = self
            .publish_raw(routing_key, &message, Self::properties_for(&message))
            .await
        {
            self.pending.remove(correlation_id.as_ref());
            return Err(err);
        }

        match tokio::time::timeout(self.rpc_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.pending.remove(correlation_id.as_ref());
                Err(BrokerError::ReplyChannelClosed)
            }
            Err(_) => {
                self.pending.remove(correlation_id.as_ref());
                Err(BrokerError::ReplyTimeout {
                    timeout_ms: self.rpc_timeout.as_millis() as u64,
                })
            }
        }
    }

    fn complete_reply(&self, correlation_id: &str, message: Message) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, waiter)) => waiter.send(message).is_ok(),
            None => false,
        }
    }
}

/// Keeps the AMQP connection alive: connects with a capped backoff, runs the
/// consumers, and flips readiness flags on connect/disconnect. Runs for the
/// life of the process.
pub async fn run_connection_manager(broker: Arc<AmqpBroker>, router: Arc<Router>) {
    let mut backoff = Duration::from_secs(1);
    loop {
        match broker.connect_once().await {
            Ok((connection, inbound, replies)) => {
                info!("broker connected");
                broker.readiness.set_broker_connected(true);
                broker.readiness.set_broker_healthy(true);
                backoff = Duration::from_secs(1);

                let reply_task = tokio::spawn(run_reply_consumer(Arc::clone(&broker), replies));
                run_inbound_consumer(Arc::clone(&router), inbound).await;

                reply_task.abort();
                broker.clear_channel();
                broker.readiness.set_broker_connected(false);
                if let Err(err) = connection.close(0, "postoffice shutting down consumer").await {
                    debug!(%err, "broker connection close");
                }
                warn!("broker connection lost, reconnecting");
            }
            Err(err) => {
                broker.readiness.set_broker_connected(false);
                warn!(%err, backoff_secs = backoff.as_secs(), "broker connect failed");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(30));
    }
}

/// Periodically verifies channel liveness and records it in readiness.
pub async fn run_health_probe(broker: Arc<AmqpBroker>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        broker
            .readiness
            .set_broker_healthy(broker.channel_alive());
    }
}

/// Consumes this broker's own queue and hands every frame to the router.
/// Returns when the stream ends (connection loss). A single bad message
/// never stops the loop.
async fn run_inbound_consumer(router: Arc<Router>, mut inbound: Consumer) {
    while let Some(delivery) = inbound.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(%err, "broker consumer stream error");
                break;
            }
        };

        match serde_json::from_slice::<Message>(&delivery.data) {
            Ok(message) => {
                if message.recipient_tag().is_none() {
                    warn!("broker frame without recipient dropped");
                } else if let Err(err) = router.route(message, MessageOrigin::Broker).await {
                    warn!(%err, "broker-delivered message failed to route");
                }
            }
            Err(err) => warn!(%err, "unparseable broker frame dropped"),
        }

        if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
            warn!(%err, "broker ack failed");
        }
    }
}

/// Consumes the direct-reply pseudo-queue and resolves pending RPC waiters.
async fn run_reply_consumer(broker: Arc<AmqpBroker>, mut replies: Consumer) {
    while let Some(delivery) = replies.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(%err, "reply consumer stream error");
                break;
            }
        };

        let correlation_id = delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_string());

        match serde_json::from_slice::<Message>(&delivery.data) {
            Ok(message) => {
                let correlation_id = correlation_id
                    .or_else(|| message.correlation_id.clone());
                match correlation_id {
                    Some(correlation_id) => {
                        if !broker.complete_reply(&correlation_id, message) {
                            debug!(%correlation_id, "reply arrived after its waiter left");
                        }
                    }
                    None => warn!("reply without correlation id dropped"),
                }
            }
            Err(err) => warn!(%err, "unparseable reply frame dropped"),
        }
    }
}
