//! Per-event-type consumption loop.
//!
//! Each loop owns one consumer resource. It long-polls the broker, unwraps
//! and decodes envelopes, runs the handlers and settles every delivery:
//!
//! | Outcome                         | Settlement                       |
//! |---------------------------------|----------------------------------|
//! | every handler succeeded         | acknowledge                      |
//! | a handler failed after retries  | release (broker counts delivery) |
//! | body cannot be deserialized     | dead-letter `DeserializationFailed` |
//! | envelope of another event type  | dead-letter `UnexpectedEventType` |
//! | no handler registered           | acknowledge and warn             |

use super::{BrokerClient, ConsumerResource};
use crate::bus::StatsCounters;
use crate::dispatch::dispatch;
use crate::envelope::{unwrap_body, wrapped_event_type, Delivery};
use crate::error::EventBusError;
use crate::registry::{DecodeFn, HandlerRegistry};
use crate::retry::RetryConfig;
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Dead-letter reason for envelopes delivered to the wrong consumer resource.
pub const UNEXPECTED_EVENT_TYPE: &str = "UnexpectedEventType";

/// Pause after a failed receive before polling again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Tuning shared by every loop of a bus.
#[derive(Debug, Clone)]
pub(crate) struct ConsumerSettings {
    pub(crate) batch_size: usize,
    pub(crate) wait: Duration,
    pub(crate) max_concurrent_calls: usize,
    pub(crate) retry: RetryConfig,
}

/// Consumption loop for one event type.
pub(crate) struct ConsumerLoop {
    broker: Arc<dyn BrokerClient>,
    resource: ConsumerResource,
    registry: Arc<HandlerRegistry>,
    decode: DecodeFn,
    settings: ConsumerSettings,
    stats: Arc<StatsCounters>,
}

impl ConsumerLoop {
    pub(crate) fn new(
        broker: Arc<dyn BrokerClient>,
        resource: ConsumerResource,
        registry: Arc<HandlerRegistry>,
        decode: DecodeFn,
        settings: ConsumerSettings,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            broker,
            resource,
            registry,
            decode,
            settings,
            stats,
        }
    }

    /// Poll until `cancel` fires.
    ///
    /// Cancellation is observed at the receive boundary. Envelopes already
    /// received finish processing before the loop returns.
    pub(crate) async fn run(self, cancel: CancellationToken) {
        self.stats.active_loops.fetch_add(1, Ordering::Relaxed);
        info!(
            consumer = %self.resource.name,
            event_type = %self.resource.event_type,
            broker = self.broker.name(),
            "Consumer loop started"
        );

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.broker.receive(
                    &self.resource,
                    self.settings.batch_size,
                    self.settings.wait,
                ) => result,
            };

            match received {
                Ok(deliveries) if deliveries.is_empty() => continue,
                Ok(deliveries) => {
                    futures::stream::iter(deliveries)
                        .for_each_concurrent(self.settings.max_concurrent_calls, |delivery| {
                            self.process(delivery, &cancel)
                        })
                        .await;
                }
                Err(e) => {
                    warn!(
                        consumer = %self.resource.name,
                        error = %e,
                        "Receive failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        self.stats.active_loops.fetch_sub(1, Ordering::Relaxed);
        info!(consumer = %self.resource.name, "Consumer loop stopped");
    }

    /// Process and settle one delivery.
    pub(crate) async fn process(&self, delivery: Delivery, cancel: &CancellationToken) {
        let event_type = self.resource.event_type.as_str();

        let delivered_type = delivery
            .event_type
            .clone()
            .or_else(|| wrapped_event_type(&delivery.body));
        if let Some(delivered) = delivered_type.filter(|t| t != event_type) {
            error!(
                consumer = %self.resource.name,
                message_id = %delivery.message_id,
                event_type = %delivered,
                "Envelope of another event type reached this consumer"
            );
            let description = format!("expected {}, got {}", event_type, delivered);
            self.dead_letter(&delivery, UNEXPECTED_EVENT_TYPE, &description)
                .await;
            return;
        }

        let body = unwrap_body(&delivery.body);
        let notification = match (self.decode)(&body) {
            Ok(notification) => notification,
            Err(source) => {
                let err = EventBusError::Deserialization {
                    event_type: event_type.to_string(),
                    message_id: delivery.message_id.clone(),
                    source,
                };
                error!(
                    consumer = %self.resource.name,
                    message_id = %delivery.message_id,
                    event_type = %event_type,
                    error = %err,
                    "Failed to deserialize envelope"
                );
                self.stats
                    .deserialization_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.dead_letter(&delivery, err.error_code(), &err.to_string())
                    .await;
                return;
            }
        };

        let registration = match self.registry.get(event_type).await {
            Some(registration) if !registration.handlers.is_empty() => registration,
            _ => {
                warn!(
                    message_id = %delivery.message_id,
                    event_type = %event_type,
                    "No handlers registered, acknowledging"
                );
                self.acknowledge(&delivery).await;
                return;
            }
        };

        let failures = dispatch(&registration, &notification, &self.settings.retry, cancel).await;
        if failures.is_empty() {
            self.acknowledge(&delivery).await;
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.stats
            .handler_failures
            .fetch_add(failures.len() as u64, Ordering::Relaxed);

        // Retries may have been cut short; the lock expires on its own.
        if cancel.is_cancelled() {
            warn!(
                consumer = %self.resource.name,
                message_id = %delivery.message_id,
                delivery_count = delivery.delivery_count,
                failed_handlers = failures.len(),
                "Shutting down, leaving envelope locked"
            );
            return;
        }

        let redriven = delivery.delivery_count >= self.resource.max_delivery_count;
        warn!(
            consumer = %self.resource.name,
            message_id = %delivery.message_id,
            delivery_count = delivery.delivery_count,
            failed_handlers = failures.len(),
            redriven,
            "Releasing envelope for redelivery"
        );

        match self.broker.release(&self.resource, &delivery).await {
            Ok(()) if redriven => {
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(()) => {}
            Err(e) => {
                warn!(
                    message_id = %delivery.message_id,
                    error = %e,
                    "Release failed, envelope reappears after its lock expires"
                );
            }
        }
    }

    async fn acknowledge(&self, delivery: &Delivery) {
        match self.broker.acknowledge(&self.resource, delivery).await {
            Ok(()) => {
                debug!(
                    consumer = %self.resource.name,
                    message_id = %delivery.message_id,
                    "Acknowledged envelope"
                );
            }
            Err(e) => {
                warn!(
                    consumer = %self.resource.name,
                    message_id = %delivery.message_id,
                    error = %e,
                    "Acknowledge failed, envelope may be redelivered"
                );
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str, description: &str) {
        match self
            .broker
            .dead_letter(&self.resource, delivery, reason, description)
            .await
        {
            Ok(()) => {
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                warn!(
                    consumer = %self.resource.name,
                    message_id = %delivery.message_id,
                    dead_letter = %self.resource.dead_letter,
                    reason = %reason,
                    "Dead-lettered envelope"
                );
            }
            Err(e) => {
                error!(
                    consumer = %self.resource.name,
                    message_id = %delivery.message_id,
                    error = %e,
                    "Dead-lettering failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::provision::{provision_consumer, provision_topic};
    use crate::broker::MemoryBroker;
    use crate::config::EventBusConfig;
    use crate::envelope::{OutboundMessage, DESERIALIZATION_FAILED, MAX_DELIVERY_COUNT_EXCEEDED};
    use crate::notification::{handler_fn, HandlerError, Notification};
    use crate::registry::Registration;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct RefundIssued {
        order_id: u64,
        amount_cents: u64,
    }

    impl Notification for RefundIssued {}

    struct Fixture {
        broker: Arc<MemoryBroker>,
        consumer: ConsumerLoop,
        calls: Arc<AtomicU32>,
        stats: Arc<StatsCounters>,
    }

    async fn fixture(fail: bool) -> Fixture {
        let broker = Arc::new(MemoryBroker::new());
        let config = EventBusConfig {
            topic_name: "shop".to_string(),
            ..EventBusConfig::default()
        };
        provision_topic(broker.as_ref(), &config).await.unwrap();
        let resource = provision_consumer(broker.as_ref(), &config, "RefundIssued")
            .await
            .unwrap();

        let registry = Arc::new(HandlerRegistry::new());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        registry
            .add::<RefundIssued, _>(handler_fn("refund-ledger", move |_event: RefundIssued, _cancel| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        Err(HandlerError::from("ledger offline"))
                    } else {
                        Ok(())
                    }
                }
            }))
            .await
            .unwrap();
        let registration: Registration = registry.get("RefundIssued").await.unwrap();

        let stats = Arc::new(StatsCounters::default());
        let consumer = ConsumerLoop::new(
            broker.clone(),
            resource,
            registry,
            registration.decode,
            ConsumerSettings {
                batch_size: 10,
                wait: Duration::from_millis(50),
                max_concurrent_calls: 4,
                retry: RetryConfig::no_retry(),
            },
            stats.clone(),
        );

        Fixture {
            broker,
            consumer,
            calls,
            stats,
        }
    }

    async fn process_next(fixture: &Fixture) {
        let mut batch = fixture
            .broker
            .receive(&fixture.consumer.resource, 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        fixture
            .consumer
            .process(batch.remove(0), &CancellationToken::new())
            .await;
    }

    #[tokio::test]
    async fn test_success_acknowledges() {
        let fixture = fixture(false).await;
        fixture
            .broker
            .send(
                "shop",
                &OutboundMessage::new("RefundIssued", r#"{"order_id":1,"amount_cents":250}"#),
            )
            .await
            .unwrap();

        process_next(&fixture).await;

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.broker.queue_depth("shop-RefundIssued").await, 0);
        assert_eq!(fixture.stats.delivered.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_poison_message_is_dead_lettered_without_handler_call() {
        let fixture = fixture(false).await;
        fixture
            .broker
            .send("shop", &OutboundMessage::new("RefundIssued", "{not json"))
            .await
            .unwrap();

        process_next(&fixture).await;

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.broker.queue_depth("shop-RefundIssued").await, 0);
        let dead = fixture.broker.dead_letters("shop-RefundIssued-dlq").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DESERIALIZATION_FAILED);
        assert_eq!(fixture.stats.deserialization_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_foreign_event_type_is_dead_lettered() {
        let fixture = fixture(false).await;
        let mut attributes = HashMap::new();
        attributes.insert("EventType".to_string(), "OrderPlaced".to_string());
        fixture
            .broker
            .enqueue_raw(
                "shop-RefundIssued",
                r#"{"order_id":1,"amount_cents":250}"#,
                attributes,
            )
            .await
            .unwrap();

        process_next(&fixture).await;

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 0);
        let dead = fixture.broker.dead_letters("shop-RefundIssued-dlq").await;
        assert_eq!(dead[0].reason, UNEXPECTED_EVENT_TYPE);
    }

    #[tokio::test]
    async fn test_failure_releases_until_redrive() {
        let fixture = fixture(true).await;
        fixture
            .broker
            .send(
                "shop",
                &OutboundMessage::new("RefundIssued", r#"{"order_id":1,"amount_cents":250}"#),
            )
            .await
            .unwrap();

        process_next(&fixture).await;
        assert_eq!(fixture.broker.queue_depth("shop-RefundIssued").await, 1);

        process_next(&fixture).await;
        process_next(&fixture).await;

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fixture.broker.queue_depth("shop-RefundIssued").await, 0);
        let dead = fixture.broker.dead_letters("shop-RefundIssued-dlq").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, MAX_DELIVERY_COUNT_EXCEEDED);
        assert_eq!(fixture.stats.dead_lettered.load(Ordering::Relaxed), 1);
        assert_eq!(fixture.stats.handler_failures.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_failure_during_shutdown_is_not_released() {
        let fixture = fixture(true).await;
        fixture
            .broker
            .send(
                "shop",
                &OutboundMessage::new("RefundIssued", r#"{"order_id":2,"amount_cents":900}"#),
            )
            .await
            .unwrap();

        process_next(&fixture).await;
        process_next(&fixture).await;

        let mut batch = fixture
            .broker
            .receive(&fixture.consumer.resource, 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch[0].delivery_count, 3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        fixture.consumer.process(batch.remove(0), &cancel).await;

        assert_eq!(fixture.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fixture.broker.queue_depth("shop-RefundIssued").await, 1);
        assert!(fixture.broker.dead_letters("shop-RefundIssued-dlq").await.is_empty());
        assert_eq!(fixture.stats.dead_lettered.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let fixture = fixture(false).await;
        let Fixture {
            broker,
            consumer,
            calls,
            stats,
        } = fixture;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(cancel.clone()));

        broker
            .send(
                "shop",
                &OutboundMessage::new("RefundIssued", r#"{"order_id":7,"amount_cents":1}"#),
            )
            .await
            .unwrap();

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.active_loops.load(Ordering::Relaxed), 0);
    }
}
