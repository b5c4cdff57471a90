//! Wire-level envelopes.
//!
//! Every published envelope carries an `EventType` attribute holding the
//! notification's logical type name. It is the only routing key: brokers
//! filter on it and never inspect the payload.
//!
//! When a topic fans out into queues through a notification service, the
//! delivered body is the notification service's own JSON document with the
//! original payload nested in its `Message` field:
//!
//! ```text
//! {
//!   "Type": "Notification",
//!   "MessageId": "…",
//!   "TopicArn": "commerce-events",
//!   "Message": "{\"order_id\":1}",
//!   "MessageAttributes": { "EventType": { "Type": "String", "Value": "OrderPlaced" } }
//! }
//! ```
//!
//! [`unwrap_body`] strips exactly one such layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Reserved attribute carrying the event type name.
pub const EVENT_TYPE_ATTRIBUTE: &str = "EventType";

/// Dead-letter reason used for bodies that cannot be deserialized.
pub const DESERIALIZATION_FAILED: &str = "DeserializationFailed";

/// Dead-letter reason used when the broker's delivery limit is reached.
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

/// Name of the per-event-type consumer resource: `{topic}-{EventTypeName}`.
pub fn consumer_resource_name(topic: &str, event_type: &str) -> String {
    format!("{}-{}", topic, event_type)
}

/// Default dead-letter target name for a consumer resource.
pub fn dead_letter_name(consumer: &str) -> String {
    format!("{}-dlq", consumer)
}

/// A serialized notification on its way to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Logical event type name
    pub event_type: String,

    /// JSON body
    pub body: String,

    /// Broker attributes; always contains [`EVENT_TYPE_ATTRIBUTE`]
    pub attributes: HashMap<String, String>,

    /// Time the notification was published
    pub published_at: DateTime<Utc>,
}

impl OutboundMessage {
    /// Create a message tagged with its event type.
    pub fn new(event_type: impl Into<String>, body: impl Into<String>) -> Self {
        let event_type = event_type.into();
        let mut attributes = HashMap::new();
        attributes.insert(EVENT_TYPE_ATTRIBUTE.to_string(), event_type.clone());
        Self {
            event_type,
            body: body.into(),
            attributes,
            published_at: Utc::now(),
        }
    }

    /// Add an extra attribute. The event type attribute cannot be overwritten.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if key != EVENT_TYPE_ATTRIBUTE {
            self.attributes.insert(key, value.into());
        }
        self
    }
}

/// An envelope received from a consumer resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Broker-assigned message id
    pub message_id: String,

    /// Acknowledgement handle, valid for this delivery only
    pub receipt: String,

    /// Event type attribute as delivered
    pub event_type: Option<String>,

    /// Raw body, possibly wrapped in a notification-service envelope
    pub body: String,

    /// All broker attributes
    pub attributes: HashMap<String, String>,

    /// Number of times the broker has delivered this message, starting at 1
    pub delivery_count: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct NotificationEnvelope {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "MessageId", default)]
    message_id: Option<String>,
    #[serde(rename = "TopicArn", default)]
    topic: Option<String>,
    #[serde(rename = "Message")]
    message: String,
    #[serde(rename = "MessageAttributes", default)]
    attributes: HashMap<String, EnvelopeAttribute>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeAttribute {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Value")]
    value: String,
}

/// Wrap a message the way a notification service does when delivering a
/// topic message into a subscribed queue.
pub fn wrap_body(topic: &str, message_id: &str, message: &OutboundMessage) -> String {
    let envelope = NotificationEnvelope {
        kind: "Notification".to_string(),
        message_id: Some(message_id.to_string()),
        topic: Some(topic.to_string()),
        message: message.body.clone(),
        attributes: message
            .attributes
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    EnvelopeAttribute {
                        kind: "String".to_string(),
                        value: v.clone(),
                    },
                )
            })
            .collect(),
    };
    // A struct of strings and maps of strings always serializes.
    serde_json::to_string(&envelope).unwrap_or_else(|_| message.body.clone())
}

/// Recover the serialized notification from a delivered body.
///
/// Returns the nested `Message` when the body is a notification-service
/// envelope, otherwise the body unchanged. Only one layer is removed.
pub fn unwrap_body(body: &str) -> String {
    if !body.trim_start().starts_with('{') {
        return body.to_string();
    }
    match serde_json::from_str::<NotificationEnvelope>(body) {
        Ok(envelope) if envelope.kind == "Notification" => envelope.message,
        _ => body.to_string(),
    }
}

/// Event type carried inside a notification-service envelope, if any.
pub fn wrapped_event_type(body: &str) -> Option<String> {
    let envelope = serde_json::from_str::<NotificationEnvelope>(body).ok()?;
    envelope
        .attributes
        .get(EVENT_TYPE_ATTRIBUTE)
        .map(|attr| attr.value.clone())
}

/// Generate a broker message id.
pub(crate) fn new_message_id() -> String {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naming() {
        assert_eq!(consumer_resource_name("shop", "OrderPlaced"), "shop-OrderPlaced");
        assert_eq!(dead_letter_name("shop-OrderPlaced"), "shop-OrderPlaced-dlq");
    }

    #[test]
    fn test_outbound_message_is_tagged() {
        let message = OutboundMessage::new("OrderPlaced", "{}")
            .with_attribute("EventType", "Spoofed")
            .with_attribute("TenantId", "acme");
        assert_eq!(message.attributes[EVENT_TYPE_ATTRIBUTE], "OrderPlaced");
        assert_eq!(message.attributes["TenantId"], "acme");
    }

    #[test]
    fn test_unwrap_wrapped_body() {
        let message = OutboundMessage::new("OrderPlaced", r#"{"id":1}"#);
        let wrapped = wrap_body("shop", "m-1", &message);
        assert_ne!(wrapped, message.body);
        assert_eq!(unwrap_body(&wrapped), r#"{"id":1}"#);
        assert_eq!(wrapped_event_type(&wrapped).as_deref(), Some("OrderPlaced"));
    }

    #[test]
    fn test_unwrap_only_one_layer() {
        let inner = wrap_body("shop", "m-1", &OutboundMessage::new("OrderPlaced", r#"{"id":1}"#));
        let outer = wrap_body("shop", "m-2", &OutboundMessage::new("OrderPlaced", inner.clone()));
        assert_eq!(unwrap_body(&outer), inner);
    }

    #[test]
    fn test_raw_body_passes_through() {
        assert_eq!(unwrap_body(r#"{"id":1}"#), r#"{"id":1}"#);
        assert_eq!(unwrap_body("not json"), "not json");
        // A notification's own "Type" field does not trigger unwrapping.
        assert_eq!(
            unwrap_body(r#"{"Type":"Refund","amount":3}"#),
            r#"{"Type":"Refund","amount":3}"#
        );
    }
}
