//! NATS JetStream broker backend.
//!
//! - topic: a JetStream stream named after the topic, capturing `{topic}.>`
//! - consumer resource: a durable pull consumer filtered to
//!   `{topic}.{EventType}`, explicit acks, `max_deliver` set from the
//!   redrive policy
//! - dead-letter target: a stream capturing `dlq.{name}`
//!
//! JetStream has no native dead-letter queue, so exhausted and poison
//! messages are republished to the dead-letter stream and then terminated.

use super::{BrokerClient, BrokerError, BrokerResult, ConsumerResource};
use crate::envelope::{
    new_message_id, Delivery, OutboundMessage, EVENT_TYPE_ATTRIBUTE, MAX_DELIVERY_COUNT_EXCEEDED,
};
use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::Mutex;

/// Header carrying the dead-letter reason.
const REASON_HEADER: &str = "Dead-Letter-Reason";

/// Header carrying the dead-letter description.
const DESCRIPTION_HEADER: &str = "Dead-Letter-Description";

fn broker_error(context: &str, e: impl Display) -> BrokerError {
    let message = format!("{}: {}", context, e);
    let lower = message.to_ascii_lowercase();
    if lower.contains("not found") {
        BrokerError::NotFound(message)
    } else if lower.contains("timed out")
        || lower.contains("no responders")
        || lower.contains("disconnected")
        || lower.contains("connection")
    {
        BrokerError::Unavailable(message)
    } else {
        BrokerError::Operation(message)
    }
}

/// Map a lookup result to existence, keeping real failures as errors.
fn exists<T, E: Display>(context: &str, result: Result<T, E>) -> BrokerResult<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) => match broker_error(context, e) {
            BrokerError::NotFound(_) => Ok(false),
            other => Err(other),
        },
    }
}

fn subject(topic: &str, event_type: &str) -> String {
    format!("{}.{}", topic, event_type)
}

fn dead_letter_subject(name: &str) -> String {
    format!("dlq.{}", name)
}

fn consumer_config(resource: &ConsumerResource) -> jetstream::consumer::pull::Config {
    jetstream::consumer::pull::Config {
        durable_name: Some(resource.name.clone()),
        filter_subject: subject(&resource.topic, resource.filter.admitted_event_type()),
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        ack_wait: resource.lock_duration,
        max_deliver: i64::from(resource.max_delivery_count),
        ..Default::default()
    }
}

/// Broker backed by NATS JetStream.
///
/// # Example
///
/// ```rust,no_run
/// use commerce_events::broker::NatsBroker;
///
/// async fn example() -> Result<(), Box<dyn std::error::Error>> {
///     let broker = NatsBroker::connect("nats://localhost:4222").await?;
///     Ok(())
/// }
/// ```
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    consumers: Mutex<HashMap<String, PullConsumer>>,
    pending: Mutex<HashMap<String, jetstream::Message>>,
}

impl std::fmt::Debug for NatsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBroker").finish_non_exhaustive()
    }
}

impl NatsBroker {
    /// Connect to a NATS server with JetStream enabled.
    pub async fn connect(url: &str) -> BrokerResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::Unavailable(format!("{}: {}", url, e)))?;
        tracing::info!(url = %url, "Connected to NATS broker");

        let jetstream = jetstream::new(client.clone());
        Ok(Self {
            client,
            jetstream,
            consumers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        })
    }

    async fn consumer(&self, resource: &ConsumerResource) -> BrokerResult<PullConsumer> {
        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.get(&resource.name) {
            return Ok(consumer.clone());
        }

        let stream = self
            .jetstream
            .get_stream(&resource.topic)
            .await
            .map_err(|e| broker_error("get stream", e))?;
        let consumer: PullConsumer = stream
            .get_consumer(&resource.name)
            .await
            .map_err(|e| broker_error("get consumer", e))?;
        consumers.insert(resource.name.clone(), consumer.clone());
        Ok(consumer)
    }

    #[cfg(test)]
    async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn take_pending(&self, delivery: &Delivery) -> BrokerResult<jetstream::Message> {
        self.pending
            .lock()
            .await
            .remove(&delivery.receipt)
            .ok_or_else(|| {
                BrokerError::Operation(format!(
                    "message {} was already settled",
                    delivery.message_id
                ))
            })
    }

    async fn publish_dead_letter(
        &self,
        resource: &ConsumerResource,
        message: jetstream::Message,
        reason: &str,
        description: &str,
    ) -> BrokerResult<()> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(EVENT_TYPE_ATTRIBUTE, resource.event_type.as_str());
        headers.insert(REASON_HEADER, reason);
        headers.insert(DESCRIPTION_HEADER, description);

        self.jetstream
            .publish_with_headers(
                dead_letter_subject(&resource.dead_letter),
                headers,
                message.payload.clone(),
            )
            .await
            .map_err(|e| broker_error("publish dead letter", e))?
            .await
            .map_err(|e| broker_error("dead letter ack", e))?;

        message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| broker_error("terminate", e))?;
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for NatsBroker {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn topic_exists(&self, topic: &str) -> BrokerResult<bool> {
        exists("get stream", self.jetstream.get_stream(topic).await)
    }

    async fn create_topic(&self, topic: &str, retention: Duration) -> BrokerResult<()> {
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: topic.to_string(),
                subjects: vec![format!("{}.>", topic)],
                max_age: retention,
                retention: jetstream::stream::RetentionPolicy::Limits,
                ..Default::default()
            })
            .await
            .map_err(|e| broker_error("create stream", e))?;
        Ok(())
    }

    async fn dead_letter_exists(&self, name: &str) -> BrokerResult<bool> {
        exists("get stream", self.jetstream.get_stream(name).await)
    }

    async fn create_dead_letter(&self, name: &str, retention: Duration) -> BrokerResult<()> {
        self.jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: name.to_string(),
                subjects: vec![dead_letter_subject(name)],
                max_age: retention,
                ..Default::default()
            })
            .await
            .map_err(|e| broker_error("create dead-letter stream", e))?;
        Ok(())
    }

    async fn consumer_exists(&self, resource: &ConsumerResource) -> BrokerResult<bool> {
        let stream = match self.jetstream.get_stream(&resource.topic).await {
            Ok(stream) => stream,
            Err(e) => {
                return match broker_error("get stream", e) {
                    BrokerError::NotFound(_) => Ok(false),
                    other => Err(other),
                }
            }
        };
        exists(
            "get consumer",
            stream.get_consumer::<jetstream::consumer::pull::Config>(&resource.name).await,
        )
    }

    async fn create_consumer(&self, resource: &ConsumerResource) -> BrokerResult<()> {
        let stream = self
            .jetstream
            .get_stream(&resource.topic)
            .await
            .map_err(|e| broker_error("get stream", e))?;
        stream
            .get_or_create_consumer(&resource.name, consumer_config(resource))
            .await
            .map_err(|e| broker_error("create consumer", e))?;
        Ok(())
    }

    async fn apply_filter(&self, resource: &ConsumerResource) -> BrokerResult<()> {
        let stream = self
            .jetstream
            .get_stream(&resource.topic)
            .await
            .map_err(|e| broker_error("get stream", e))?;
        // Creating a durable consumer with an existing name updates its config.
        stream
            .create_consumer(consumer_config(resource))
            .await
            .map_err(|e| broker_error("update consumer", e))?;
        self.consumers.lock().await.remove(&resource.name);
        Ok(())
    }

    async fn apply_redrive(&self, resource: &ConsumerResource) -> BrokerResult<()> {
        if !self.dead_letter_exists(&resource.dead_letter).await? {
            return Err(BrokerError::NotFound(resource.dead_letter.clone()));
        }
        // max_deliver is part of the consumer config written by apply_filter.
        Ok(())
    }

    async fn send(&self, topic: &str, message: &OutboundMessage) -> BrokerResult<String> {
        let message_id = new_message_id();
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", message_id.as_str());
        for (key, value) in &message.attributes {
            headers.insert(key.as_str(), value.as_str());
        }

        self.jetstream
            .publish_with_headers(
                subject(topic, &message.event_type),
                headers,
                message.body.clone().into_bytes().into(),
            )
            .await
            .map_err(|e| broker_error("publish", e))?
            .await
            .map_err(|e| broker_error("publish ack", e))?;
        Ok(message_id)
    }

    async fn receive(
        &self,
        resource: &ConsumerResource,
        max_messages: usize,
        wait: Duration,
    ) -> BrokerResult<Vec<Delivery>> {
        let consumer = self.consumer(resource).await?;
        let messages = if wait.is_zero() {
            consumer.fetch().max_messages(max_messages).messages().await
        } else {
            consumer
                .batch()
                .max_messages(max_messages)
                .expires(wait)
                .messages()
                .await
        }
        .map_err(|e| broker_error("fetch", e))?;

        // Messages are registered as pending only once the batch is complete,
        // so a receive dropped mid-batch leaves nothing behind to settle.
        let mut messages = std::pin::pin!(messages);
        let mut batch = Vec::new();
        let mut received = Vec::new();
        while let Some(message) = messages.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) if batch.is_empty() => return Err(broker_error("fetch message", e)),
                Err(e) => {
                    tracing::warn!(error = %e, "Batch ended early");
                    break;
                }
            };
            let (stream_sequence, delivered) = {
                let info = message.info().map_err(|e| broker_error("message info", e))?;
                (info.stream_sequence, info.delivered)
            };

            let subject = message.subject.to_string();
            let event_type = subject
                .strip_prefix(&format!("{}.", resource.topic))
                .map(str::to_string);
            let mut attributes = HashMap::new();
            if let Some(event_type) = &event_type {
                attributes.insert(EVENT_TYPE_ATTRIBUTE.to_string(), event_type.clone());
            }

            let receipt = new_message_id();
            batch.push(Delivery {
                message_id: stream_sequence.to_string(),
                receipt: receipt.clone(),
                event_type,
                body: String::from_utf8_lossy(&message.payload).into_owned(),
                attributes,
                delivery_count: u32::try_from(delivered).unwrap_or(u32::MAX),
            });
            received.push((receipt, message));
        }

        self.pending.lock().await.extend(received);
        Ok(batch)
    }

    async fn acknowledge(&self, _resource: &ConsumerResource, delivery: &Delivery) -> BrokerResult<()> {
        let message = self.take_pending(delivery).await?;
        message.ack().await.map_err(|e| broker_error("ack", e))
    }

    async fn release(&self, resource: &ConsumerResource, delivery: &Delivery) -> BrokerResult<()> {
        let message = self.take_pending(delivery).await?;
        if delivery.delivery_count >= resource.max_delivery_count {
            let description = format!("delivered {} times", delivery.delivery_count);
            return self
                .publish_dead_letter(resource, message, MAX_DELIVERY_COUNT_EXCEEDED, &description)
                .await;
        }
        message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| broker_error("nak", e))
    }

    async fn dead_letter(
        &self,
        resource: &ConsumerResource,
        delivery: &Delivery,
        reason: &str,
        description: &str,
    ) -> BrokerResult<()> {
        let message = self.take_pending(delivery).await?;
        self.publish_dead_letter(resource, message, reason, description)
            .await
    }

    async fn close(&self) {
        if let Err(e) = self.client.flush().await {
            tracing::warn!(error = %e, "Failed to flush NATS connection");
        }
        self.pending.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SubscriptionFilter;

    fn resource() -> ConsumerResource {
        ConsumerResource {
            name: "shop-OrderPlaced".to_string(),
            topic: "shop".to_string(),
            event_type: "OrderPlaced".to_string(),
            filter: SubscriptionFilter::event_type("OrderPlaced"),
            dead_letter: "shop-OrderPlaced-dlq".to_string(),
            max_delivery_count: 3,
            retention: Duration::from_secs(3600),
            lock_duration: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_consumer_config() {
        let config = consumer_config(&resource());
        assert_eq!(config.durable_name.as_deref(), Some("shop-OrderPlaced"));
        assert_eq!(config.filter_subject, "shop.OrderPlaced");
        assert_eq!(config.max_deliver, 3);
        assert_eq!(config.ack_wait, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_dropped_receive_leaves_nothing_pending() {
        let Ok(broker) = NatsBroker::connect("nats://127.0.0.1:4222").await else {
            eprintln!("NATS not available, skipping");
            return;
        };
        let config = crate::config::EventBusConfig {
            topic_name: format!("shop-{}", new_message_id().replace('-', "")),
            ..Default::default()
        };
        crate::broker::provision::provision_topic(&broker, &config)
            .await
            .unwrap();
        let resource = crate::broker::provision::provision_consumer(&broker, &config, "OrderPlaced")
            .await
            .unwrap();

        for order_id in 1..=3 {
            let body = format!(r#"{{"order_id":{}}}"#, order_id);
            broker
                .send(&config.topic_name, &OutboundMessage::new("OrderPlaced", body))
                .await
                .unwrap();
        }

        // The batch stays open for its full wait, so the timeout drops it
        // after the three messages have arrived.
        let dropped = tokio::time::timeout(
            Duration::from_millis(500),
            broker.receive(&resource, 10, Duration::from_secs(5)),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(broker.pending_len().await, 0);
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            broker_error("get stream", "stream not found"),
            BrokerError::NotFound(_)
        ));
        assert!(matches!(
            broker_error("publish", "request timed out"),
            BrokerError::Unavailable(_)
        ));
        assert!(matches!(
            broker_error("create consumer", "invalid config"),
            BrokerError::Operation(_)
        ));
        assert_eq!(exists::<(), _>("get stream", Err("stream not found")), Ok(false));
    }
}
