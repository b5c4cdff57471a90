//! Error types for event bus operations
//!
//! This module defines the errors surfaced by the facade. Only
//! [`EventBusError::TransportUnavailable`] ever crosses the publish boundary
//! at runtime; consumption failures are terminal for a single message and are
//! logged rather than returned.

use crate::broker::BrokerError;
use crate::config::ConfigError;
use thiserror::Error;

/// Event bus error types.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// The broker client cannot be reached
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A required topic, consumer resource or dead-letter target is absent
    /// and automatic creation is disabled
    #[error("Infrastructure missing: {0}")]
    InfrastructureMissing(String),

    /// An envelope body does not match the expected notification shape
    #[error("Failed to deserialize {event_type} message {message_id}: {source}")]
    Deserialization {
        /// Event type the consumer expected
        event_type: String,
        /// Broker-assigned message id
        message_id: String,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// A notification could not be serialized for publishing
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A handler still failed after exhausting its retries
    #[error("Handler {handler} failed for {event_type}: {message}")]
    HandlerFailed {
        /// Event type being handled
        event_type: String,
        /// Handler type name
        handler: String,
        /// Last error reported by the handler
        message: String,
    },

    /// Two different notification types claim the same event type name
    #[error("Event type {event_type} is already bound to {existing}, cannot bind {incoming}")]
    EventTypeConflict {
        /// Conflicting routing name
        event_type: String,
        /// Rust type already registered under the name
        existing: String,
        /// Rust type that attempted to register
        incoming: String,
    },

    /// Any other broker failure
    #[error("Broker error: {0}")]
    Broker(String),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for event bus operations.
pub type EventBusResult<T> = Result<T, EventBusError>;

impl EventBusError {
    /// Whether retrying the failed operation could succeed.
    ///
    /// Deserialization, provisioning and configuration failures are
    /// deterministic and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EventBusError::TransportUnavailable(_)
                | EventBusError::HandlerFailed { .. }
                | EventBusError::Broker(_)
        )
    }

    /// Short machine-readable code, used as the dead-letter reason.
    pub fn error_code(&self) -> &'static str {
        match self {
            EventBusError::TransportUnavailable(_) => "TransportUnavailable",
            EventBusError::InfrastructureMissing(_) => "InfrastructureMissing",
            EventBusError::Deserialization { .. } => "DeserializationFailed",
            EventBusError::Serialization(_) => "SerializationFailed",
            EventBusError::HandlerFailed { .. } => "HandlerFailed",
            EventBusError::EventTypeConflict { .. } => "EventTypeConflict",
            EventBusError::Broker(_) => "BrokerError",
            EventBusError::Config(_) => "ConfigError",
        }
    }
}

impl From<BrokerError> for EventBusError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Unavailable(msg) => EventBusError::TransportUnavailable(msg),
            BrokerError::NotFound(msg) => EventBusError::InfrastructureMissing(msg),
            BrokerError::Operation(msg) => EventBusError::Broker(msg),
        }
    }
}
