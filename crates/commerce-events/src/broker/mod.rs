//! Durable broker transports.
//!
//! A broker is reached through the [`BrokerClient`] trait. Provisioning
//! ([`provision`]) and the per-event-type consumption loop ([`consumer`]) are
//! written once against the trait; backends only translate each call into
//! their native operations.
//!
//! ## Topology
//!
//! ```text
//!                       ┌──────────────────────────┐
//!  publish ──► topic ──►│ filter EventType='A'     │──► {topic}-A ──► loop A
//!                 │     └──────────────────────────┘        │
//!                 │     ┌──────────────────────────┐        └─(3 deliveries)─► {topic}-A-dlq
//!                 └────►│ filter EventType='B'     │──► {topic}-B ──► loop B
//!                       └──────────────────────────┘
//! ```
//!
//! ## Backends
//!
//! - [`MemoryBroker`]: in-process emulation, always available
//! - `RedisBroker` (feature `redis`): Redis streams and consumer groups
//! - `NatsBroker` (feature `nats`): NATS JetStream

pub mod consumer;
pub mod memory;
pub mod provision;

#[cfg(feature = "nats")]
pub mod nats;
#[cfg(feature = "redis")]
pub mod redis;

use crate::envelope::{Delivery, OutboundMessage, EVENT_TYPE_ATTRIBUTE};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryBroker;

#[cfg(feature = "nats")]
pub use self::nats::NatsBroker;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

/// Broker client error types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker cannot be reached
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The named topic, queue or subscription does not exist
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The broker rejected the operation
    #[error("Broker operation failed: {0}")]
    Operation(String),
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Filter admitting only envelopes of one event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    event_type: String,
}

impl SubscriptionFilter {
    /// Filter on `EventType = event_type`.
    pub fn event_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
        }
    }

    /// The event type this filter admits.
    pub fn admitted_event_type(&self) -> &str {
        &self.event_type
    }

    /// Whether an envelope with these attributes passes the filter.
    pub fn matches(&self, attributes: &HashMap<String, String>) -> bool {
        attributes
            .get(EVENT_TYPE_ATTRIBUTE)
            .map(|value| value == &self.event_type)
            .unwrap_or(false)
    }

    /// SQL rule expression, for brokers with SQL subscription rules.
    pub fn to_sql(&self) -> String {
        format!(
            "{} = '{}'",
            EVENT_TYPE_ATTRIBUTE,
            self.event_type.replace('\'', "''")
        )
    }

    /// JSON filter policy, for brokers with attribute filter policies.
    pub fn to_filter_policy(&self) -> serde_json::Value {
        let mut policy = serde_json::Map::new();
        policy.insert(
            EVENT_TYPE_ATTRIBUTE.to_string(),
            serde_json::json!([self.event_type]),
        );
        serde_json::Value::Object(policy)
    }
}

/// Everything a broker needs to know about one per-event-type consumer resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerResource {
    /// `{topic}-{EventTypeName}`
    pub name: String,

    /// Shared topic the resource is bound to
    pub topic: String,

    /// Event type delivered to this resource
    pub event_type: String,

    /// Filter attached to the binding
    pub filter: SubscriptionFilter,

    /// Dead-letter target for exhausted or poison messages
    pub dead_letter: String,

    /// Broker deliveries before a message is dead-lettered
    pub max_delivery_count: u32,

    /// Message retention
    pub retention: Duration,

    /// Visibility lock of a received message
    pub lock_duration: Duration,
}

/// Client for a durable broker.
///
/// Existence checks return `Ok(false)` for absent resources; `Err` is reserved
/// for failures to reach or query the broker. Create operations must be
/// idempotent.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Backend name, used in logs.
    fn name(&self) -> &'static str;

    /// Whether the topic exists.
    async fn topic_exists(&self, topic: &str) -> BrokerResult<bool>;

    /// Create the topic.
    async fn create_topic(&self, topic: &str, retention: Duration) -> BrokerResult<()>;

    /// Whether the dead-letter target exists.
    async fn dead_letter_exists(&self, name: &str) -> BrokerResult<bool>;

    /// Create a dead-letter target.
    async fn create_dead_letter(&self, name: &str, retention: Duration) -> BrokerResult<()>;

    /// Whether the consumer resource exists.
    async fn consumer_exists(&self, resource: &ConsumerResource) -> BrokerResult<bool>;

    /// Create the consumer resource and bind it to its topic.
    async fn create_consumer(&self, resource: &ConsumerResource) -> BrokerResult<()>;

    /// Attach or replace the event type filter on the binding.
    async fn apply_filter(&self, resource: &ConsumerResource) -> BrokerResult<()>;

    /// Wire the dead-letter target and the delivery limit to the resource.
    async fn apply_redrive(&self, resource: &ConsumerResource) -> BrokerResult<()>;

    /// Allow the topic to deliver into the resource.
    ///
    /// Brokers without explicit access policies keep the default no-op.
    async fn authorize_topic(&self, _resource: &ConsumerResource) -> BrokerResult<()> {
        Ok(())
    }

    /// Send a message to the topic, returning the broker message id.
    async fn send(&self, topic: &str, message: &OutboundMessage) -> BrokerResult<String>;

    /// Receive up to `max_messages`, waiting at most `wait` when none are ready.
    async fn receive(
        &self,
        resource: &ConsumerResource,
        max_messages: usize,
        wait: Duration,
    ) -> BrokerResult<Vec<Delivery>>;

    /// Remove a delivered message permanently.
    async fn acknowledge(&self, resource: &ConsumerResource, delivery: &Delivery) -> BrokerResult<()>;

    /// Give a delivered message back without acknowledging it.
    ///
    /// The broker counts the delivery and dead-letters the message once the
    /// resource's `max_delivery_count` is reached.
    async fn release(&self, resource: &ConsumerResource, delivery: &Delivery) -> BrokerResult<()>;

    /// Move a delivered message to the dead-letter target immediately.
    async fn dead_letter(
        &self,
        resource: &ConsumerResource,
        delivery: &Delivery,
        reason: &str,
        description: &str,
    ) -> BrokerResult<()>;

    /// Release client resources. Called once, after every loop has stopped.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches_only_its_event_type() {
        let filter = SubscriptionFilter::event_type("OrderPlaced");

        let mut attributes = HashMap::new();
        attributes.insert(EVENT_TYPE_ATTRIBUTE.to_string(), "OrderPlaced".to_string());
        assert!(filter.matches(&attributes));

        attributes.insert(EVENT_TYPE_ATTRIBUTE.to_string(), "OrderCancelled".to_string());
        assert!(!filter.matches(&attributes));

        assert!(!filter.matches(&HashMap::new()));
    }

    #[test]
    fn test_filter_renderings() {
        let filter = SubscriptionFilter::event_type("OrderPlaced");
        assert_eq!(filter.to_sql(), "EventType = 'OrderPlaced'");
        assert_eq!(
            filter.to_filter_policy(),
            serde_json::json!({ "EventType": ["OrderPlaced"] })
        );

        let quoted = SubscriptionFilter::event_type("It's");
        assert_eq!(quoted.to_sql(), "EventType = 'It''s'");
    }
}
