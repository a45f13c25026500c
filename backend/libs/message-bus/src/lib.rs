//! AMQP (RabbitMQ) event bus for the order-processing saga.
//!
//! All services publish to a single durable topic exchange and consume
//! from durable quorum queues bound by routing-key pattern. Failed
//! deliveries are retried by republishing with an incremented
//! `x-retry-count` header and exponential backoff; messages that exhaust
//! their retry budget are rejected and dead-lettered into a shared DLQ
//! via the configured dead-letter exchange.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicGetOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use saga_events::SagaEvent;

mod error;

pub use error::{BusError, Result};

/// Main topic exchange all saga events flow through.
pub const EVENTS_EXCHANGE: &str = "saga_events";
/// Dead-letter exchange bound to every consumer queue.
pub const DEAD_LETTER_EXCHANGE: &str = "saga_events_dlx";
/// Terminal queue for messages that exhausted their retry budget.
pub const DEAD_LETTER_QUEUE: &str = "dead_letter_queue";

const RETRY_COUNT_HEADER: &str = "x-retry-count";
const CONNECT_ATTEMPTS: u32 = 5;

/// Handler invoked once per delivered event.
///
/// Implementations must be idempotent: the bus guarantees at-least-once
/// delivery. Return `Err` only for transient failures worth retrying;
/// domain rejections are emitted as reply events, not errors.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: SagaEvent) -> anyhow::Result<()>;
}

/// Queue binding for one consumer.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Topic pattern, e.g. `payment.requested` or `order.*`.
    pub pattern: String,
    /// Durable queue name owned by the consuming service.
    pub queue: String,
}

impl Subscription {
    pub fn new(pattern: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            queue: queue.into(),
        }
    }
}

/// Message pulled out of the dead-letter queue for inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub event: serde_json::Value,
    pub headers: serde_json::Map<String, serde_json::Value>,
    pub routing_key: String,
}

/// One long-lived connection and channel per service, prefetch 1.
pub struct MessageBus {
    connection: Connection,
    channel: Channel,
    cancel: CancellationToken,
}

impl MessageBus {
    /// Connect to the broker and declare the saga topology.
    ///
    /// Connection attempts are retried with exponential backoff before
    /// giving up, so services can start while the broker is still coming
    /// up.
    pub async fn connect(url: &str) -> Result<Self> {
        let mut delay = Duration::from_secs(2);
        let mut attempt = 1;

        let connection = loop {
            match Connection::connect(url, ConnectionProperties::default()).await {
                Ok(connection) => break connection,
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    warn!(
                        attempt,
                        max_attempts = CONNECT_ATTEMPTS,
                        error = %e,
                        "broker connection failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(10));
                    attempt += 1;
                }
                Err(e) => {
                    return Err(BusError::Connection(format!(
                        "failed to connect to {url}: {e}"
                    )))
                }
            }
        };

        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        // One in-flight message per consumer keeps handler execution
        // serialized and distribution fair across instances.
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        declare_topology(&channel).await?;

        info!(exchange = EVENTS_EXCHANGE, "connected to message broker");

        Ok(Self {
            connection,
            channel,
            cancel: CancellationToken::new(),
        })
    }

    /// Token cancelled when the bus shuts down; consumer loops and the
    /// outbox poller observe it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Publish an event under its canonical routing key.
    pub async fn publish(&self, event: &SagaEvent) -> Result<()> {
        self.publish_to(event.routing_key(), event).await
    }

    /// Publish an event under an explicit routing key.
    pub async fn publish_to(&self, routing_key: &str, event: &SagaEvent) -> Result<()> {
        let body = serde_json::to_vec(event)?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_headers(event_headers(event));

        let confirm = self
            .channel
            .basic_publish(
                EVENTS_EXCHANGE,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("publish failed: {e}")))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("publish confirmation failed: {e}")))?;

        debug!(
            event_type = event.routing_key(),
            event_id = %event.event_id,
            correlation_id = %event.correlation_id,
            routing_key,
            "published event"
        );

        Ok(())
    }

    /// Re-publish an event with fresh headers, clearing any retry count.
    pub async fn replay(&self, event: &SagaEvent) -> Result<()> {
        self.publish(event).await?;
        info!(event_id = %event.event_id, "replayed event");
        Ok(())
    }

    /// Declare and bind the subscription's queue, then spawn a consumer
    /// task that feeds deliveries to `handler`.
    pub async fn subscribe(
        &self,
        subscription: Subscription,
        handler: Arc<dyn EventHandler>,
        max_retries: u32,
    ) -> Result<JoinHandle<()>> {
        let mut queue_args = FieldTable::default();
        queue_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
        );
        queue_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dlq_routing_key(&subscription.pattern).into()),
        );
        queue_args.insert(
            "x-queue-type".into(),
            AMQPValue::LongString("quorum".into()),
        );

        self.channel
            .queue_declare(
                &subscription.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_args,
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("failed to declare queue: {e}")))?;

        self.channel
            .queue_bind(
                &subscription.queue,
                EVENTS_EXCHANGE,
                &subscription.pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("failed to bind queue: {e}")))?;

        let mut consumer = self
            .channel
            .basic_consume(
                &subscription.queue,
                &format!("{}-consumer", subscription.queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("failed to start consumer: {e}")))?;

        info!(
            queue = %subscription.queue,
            pattern = %subscription.pattern,
            "subscribed to events"
        );

        let channel = self.channel.clone();
        let cancel = self.cancel.child_token();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(queue = %subscription.queue, "consumer cancelled");
                        break;
                    }
                    delivery = consumer.next() => {
                        match delivery {
                            Some(Ok(delivery)) => {
                                process_delivery(&channel, delivery, handler.as_ref(), max_retries)
                                    .await;
                            }
                            Some(Err(e)) => {
                                error!(queue = %subscription.queue, error = %e, "consumer delivery error");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                            None => {
                                warn!(queue = %subscription.queue, "consumer stream closed");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(handle)
    }

    /// Pull up to `limit` messages from the dead-letter queue, acking
    /// each one.
    pub async fn drain_dlq(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let mut letters = Vec::new();

        for _ in 0..limit {
            let message = match self
                .channel
                .basic_get(DEAD_LETTER_QUEUE, BasicGetOptions::default())
                .await?
            {
                Some(message) => message,
                None => break,
            };

            let delivery = message.delivery;
            let event = serde_json::from_slice(&delivery.data)
                .unwrap_or_else(|_| {
                    serde_json::Value::String(String::from_utf8_lossy(&delivery.data).into_owned())
                });
            let headers = delivery
                .properties
                .headers()
                .as_ref()
                .map(field_table_to_json)
                .unwrap_or_default();

            letters.push(DeadLetter {
                event,
                headers,
                routing_key: delivery.routing_key.to_string(),
            });

            delivery.ack(BasicAckOptions::default()).await?;
        }

        Ok(letters)
    }

    /// Cancel consumer tasks and close the channel and connection.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.channel.close(200, "shutdown").await?;
        self.connection.close(200, "shutdown").await?;
        info!("disconnected from message broker");
        Ok(())
    }
}

async fn declare_topology(channel: &Channel) -> Result<()> {
    let durable = ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    };

    channel
        .exchange_declare(
            EVENTS_EXCHANGE,
            ExchangeKind::Topic,
            durable,
            FieldTable::default(),
        )
        .await?;

    channel
        .exchange_declare(
            DEAD_LETTER_EXCHANGE,
            ExchangeKind::Topic,
            durable,
            FieldTable::default(),
        )
        .await?;

    let mut dlq_args = FieldTable::default();
    dlq_args.insert(
        "x-queue-type".into(),
        AMQPValue::LongString("quorum".into()),
    );
    channel
        .queue_declare(
            DEAD_LETTER_QUEUE,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            dlq_args,
        )
        .await?;

    // Everything dead-lettered lands in the single DLQ regardless of the
    // per-queue dlq.<pattern> routing key.
    channel
        .queue_bind(
            DEAD_LETTER_QUEUE,
            DEAD_LETTER_EXCHANGE,
            "#",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok(())
}

async fn process_delivery(
    channel: &Channel,
    delivery: Delivery,
    handler: &dyn EventHandler,
    max_retries: u32,
) {
    let event: SagaEvent = match serde_json::from_slice(&delivery.data) {
        Ok(event) => event,
        Err(e) => {
            // Malformed payloads are a programmer error: drop them rather
            // than poisoning the retry path.
            warn!(
                routing_key = %delivery.routing_key,
                error = %e,
                "dropping malformed message"
            );
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!(error = %e, "failed to ack malformed message");
            }
            return;
        }
    };

    let retries = retry_count(&delivery.properties);
    debug!(
        event_type = event.routing_key(),
        event_id = %event.event_id,
        retry = retries,
        "processing event"
    );

    match handler.handle(event).await {
        Ok(()) => {
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!(error = %e, "failed to ack message");
            }
        }
        Err(handler_error) => {
            let next_retry = retries + 1;

            if next_retry <= max_retries {
                warn!(
                    routing_key = %delivery.routing_key,
                    attempt = next_retry,
                    max_retries,
                    error = %handler_error,
                    "handler failed, retrying"
                );

                tokio::time::sleep(retry_delay(next_retry)).await;

                let mut headers = delivery
                    .properties
                    .headers()
                    .clone()
                    .unwrap_or_default();
                headers.insert(
                    RETRY_COUNT_HEADER.into(),
                    AMQPValue::LongInt(next_retry as i32),
                );
                let properties = BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2)
                    .with_headers(headers);

                // Republish under the delivery's own routing key so
                // wildcard subscribers retry the message they actually
                // received.
                let republish = channel
                    .basic_publish(
                        EVENTS_EXCHANGE,
                        delivery.routing_key.as_str(),
                        BasicPublishOptions::default(),
                        &delivery.data,
                        properties,
                    )
                    .await;

                match republish {
                    Ok(confirm) => {
                        if let Err(e) = confirm.await {
                            error!(error = %e, "retry republish not confirmed");
                        }
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            error!(error = %e, "failed to ack retried message");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "retry republish failed, requeueing original");
                        let requeue = BasicRejectOptions { requeue: true };
                        if let Err(e) = delivery.reject(requeue).await {
                            error!(error = %e, "failed to requeue message");
                        }
                    }
                }
            } else {
                error!(
                    routing_key = %delivery.routing_key,
                    retries,
                    max_retries,
                    error = %handler_error,
                    "max retries exceeded, dead-lettering message"
                );
                let to_dlq = BasicRejectOptions { requeue: false };
                if let Err(e) = delivery.reject(to_dlq).await {
                    error!(error = %e, "failed to reject message");
                }
            }
        }
    }
}

fn event_headers(event: &SagaEvent) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        "event_type".into(),
        AMQPValue::LongString(event.routing_key().into()),
    );
    headers.insert(
        "event_id".into(),
        AMQPValue::LongString(event.event_id.to_string().into()),
    );
    headers.insert(
        "correlation_id".into(),
        AMQPValue::LongString(event.correlation_id.to_string().into()),
    );
    headers.insert("version".into(), AMQPValue::LongInt(event.version as i32));
    headers
}

fn retry_count(properties: &BasicProperties) -> u32 {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(RETRY_COUNT_HEADER))
        .and_then(amqp_value_as_u32)
        .unwrap_or(0)
}

fn amqp_value_as_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}

/// Exponential backoff before a retry republish, capped at one minute.
fn retry_delay(retry_count: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(retry_count).min(60))
}

fn dlq_routing_key(pattern: &str) -> String {
    format!("dlq.{pattern}")
}

fn field_table_to_json(table: &FieldTable) -> serde_json::Map<String, serde_json::Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.to_string(), amqp_value_to_json(value)))
        .collect()
}

fn amqp_value_to_json(value: &AMQPValue) -> serde_json::Value {
    match value {
        AMQPValue::Boolean(v) => serde_json::Value::Bool(*v),
        AMQPValue::ShortShortInt(v) => serde_json::Value::from(*v),
        AMQPValue::ShortShortUInt(v) => serde_json::Value::from(*v),
        AMQPValue::ShortInt(v) => serde_json::Value::from(*v),
        AMQPValue::ShortUInt(v) => serde_json::Value::from(*v),
        AMQPValue::LongInt(v) => serde_json::Value::from(*v),
        AMQPValue::LongUInt(v) => serde_json::Value::from(*v),
        AMQPValue::LongLongInt(v) => serde_json::Value::from(*v),
        AMQPValue::Float(v) => serde_json::Value::from(*v),
        AMQPValue::Double(v) => serde_json::Value::from(*v),
        AMQPValue::LongString(v) => {
            serde_json::Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        other => serde_json::Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_and_caps_at_sixty_seconds() {
        assert_eq!(retry_delay(1).as_secs(), 2);
        assert_eq!(retry_delay(2).as_secs(), 4);
        assert_eq!(retry_delay(3).as_secs(), 8);
        assert_eq!(retry_delay(5).as_secs(), 32);
        assert_eq!(retry_delay(6).as_secs(), 60);
        assert_eq!(retry_delay(20).as_secs(), 60);
    }

    #[test]
    fn dlq_routing_key_embeds_the_pattern() {
        assert_eq!(dlq_routing_key("payment.requested"), "dlq.payment.requested");
        assert_eq!(dlq_routing_key("order.*"), "dlq.order.*");
        assert_eq!(dlq_routing_key("*.*"), "dlq.*.*");
    }

    #[test]
    fn retry_count_reads_numeric_header_variants() {
        assert_eq!(amqp_value_as_u32(&AMQPValue::LongInt(3)), Some(3));
        assert_eq!(amqp_value_as_u32(&AMQPValue::ShortUInt(7)), Some(7));
        assert_eq!(amqp_value_as_u32(&AMQPValue::LongInt(-1)), None);
        assert_eq!(
            amqp_value_as_u32(&AMQPValue::LongString("3".into())),
            None
        );

        let mut headers = FieldTable::default();
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongInt(2));
        let properties = BasicProperties::default().with_headers(headers);
        assert_eq!(retry_count(&properties), 2);
        assert_eq!(retry_count(&BasicProperties::default()), 0);
    }

    #[test]
    fn event_headers_carry_identity_and_version() {
        let event = SagaEvent::new(
            uuid::Uuid::new_v4(),
            uuid::Uuid::new_v4(),
            saga_events::EventPayload::OrderConfirmed {
                order_id: uuid::Uuid::new_v4(),
            },
        );

        let headers = event_headers(&event);
        let inner = headers.inner();
        assert!(inner.contains_key("event_type"));
        assert!(inner.contains_key("event_id"));
        assert!(inner.contains_key("correlation_id"));
        assert_eq!(
            inner.get("version").and_then(amqp_value_as_u32),
            Some(event.version)
        );
    }
}

/// Integration tests requiring a running RabbitMQ instance.
///
/// Run with: AMQP_URL=amqp://localhost:5672 cargo test -p message-bus -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use saga_events::EventPayload;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn amqp_url() -> String {
        std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
    }

    fn confirmed_event() -> SagaEvent {
        let order_id = Uuid::new_v4();
        SagaEvent::new(
            order_id,
            Uuid::new_v4(),
            EventPayload::OrderConfirmed { order_id },
        )
    }

    struct CountingHandler {
        count: Arc<AtomicUsize>,
        tx: mpsc::Sender<SagaEvent>,
        fail_first: u32,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, event: SagaEvent) -> anyhow::Result<()> {
            let seen = self.count.fetch_add(1, Ordering::SeqCst) as u32;
            if seen < self.fail_first {
                anyhow::bail!("induced failure {seen}");
            }
            let _ = self.tx.send(event).await;
            Ok(())
        }
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn publish_and_consume_round_trip() {
        let bus = MessageBus::connect(&amqp_url()).await.expect("connect");
        let queue = format!("test-confirmed-{}", Uuid::new_v4());

        let count = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(4);
        bus.subscribe(
            Subscription::new("order.confirmed", queue),
            Arc::new(CountingHandler {
                count: count.clone(),
                tx,
                fail_first: 0,
            }),
            3,
        )
        .await
        .expect("subscribe");

        tokio::time::sleep(Duration::from_millis(100)).await;

        let event = confirmed_event();
        bus.publish(&event).await.expect("publish");

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");

        assert_eq!(received.event_id, event.event_id);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bus.close().await.expect("close");
    }

    #[tokio::test]
    #[ignore = "Requires RabbitMQ"]
    async fn transient_failure_is_retried_and_redelivered() {
        let bus = MessageBus::connect(&amqp_url()).await.expect("connect");
        let queue = format!("test-retry-{}", Uuid::new_v4());

        let count = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(4);
        bus.subscribe(
            Subscription::new("order.confirmed", queue),
            Arc::new(CountingHandler {
                count: count.clone(),
                tx,
                fail_first: 1,
            }),
            3,
        )
        .await
        .expect("subscribe");

        tokio::time::sleep(Duration::from_millis(100)).await;
        bus.publish(&confirmed_event()).await.expect("publish");

        // First delivery fails, retry republishes after ~2s backoff.
        let received = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");

        assert_eq!(received.version, saga_events::SCHEMA_VERSION);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        bus.close().await.expect("close");
    }
}
