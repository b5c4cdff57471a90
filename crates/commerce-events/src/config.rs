//! Event bus configuration.
//!
//! Selects the transport and tunes provisioning and consumption. Values are
//! loaded from environment variables with defaults suitable for local
//! development, where the in-process transport needs no infrastructure.

use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Retention applied to every dead-letter target, regardless of the primary TTL.
pub const DEAD_LETTER_RETENTION: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Broker-level delivery attempts before a message is dead-lettered.
pub const MAX_DELIVERY_COUNT: u32 = 3;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required value was not provided.
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Error message.
        message: String,
    },

    /// The selected transport was not compiled into this build.
    #[error("Transport {0} requires the `{1}` feature")]
    UnsupportedTransport(String, &'static str),
}

/// Transport selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Unbounded in-process queue, no external infrastructure
    InMemory,
    /// Redis streams with consumer groups
    Redis,
    /// NATS JetStream
    Nats,
}

impl TransportKind {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::InMemory => "in_memory",
            TransportKind::Redis => "redis",
            TransportKind::Nats => "nats",
        }
    }

    /// Whether the transport talks to an external broker.
    pub fn is_broker(&self) -> bool {
        !matches!(self, TransportKind::InMemory)
    }
}

impl std::str::FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_memory" | "inmemory" | "memory" => Ok(TransportKind::InMemory),
            "redis" => Ok(TransportKind::Redis),
            "nats" => Ok(TransportKind::Nats),
            other => Err(ConfigError::InvalidValue {
                key: "EVENT_BUS_TRANSPORT".to_string(),
                message: format!("unknown transport '{}'", other),
            }),
        }
    }
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Transport used for publishing and consuming.
    pub transport: TransportKind,

    /// Create missing topics, consumer resources and dead-letter targets.
    pub auto_create_entities: bool,

    /// Shared topic every notification is published to.
    pub topic_name: String,

    /// Envelopes processed concurrently within one consumption loop.
    pub max_concurrent_calls: usize,

    /// Retention of messages in consumer resources, in days.
    pub default_message_ttl_days: u32,

    /// Shared dead-letter target. Required when `auto_create_entities` is off.
    pub dead_letter_target: Option<String>,

    /// Broker connection string (Redis URL or NATS server URL).
    pub connection_string: Option<String>,

    /// Maximum envelopes fetched per receive call.
    pub receive_batch_size: usize,

    /// Long-poll wait per receive call, in seconds.
    pub receive_wait_secs: u64,

    /// How long a received envelope stays invisible to other consumers, in seconds.
    pub lock_duration_secs: u64,

    /// Per-handler retry policy.
    #[serde(skip)]
    pub retry: RetryConfig,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::InMemory,
            auto_create_entities: true,
            topic_name: "commerce-events".to_string(),
            max_concurrent_calls: 4,
            default_message_ttl_days: 14,
            dead_letter_target: None,
            connection_string: None,
            receive_batch_size: 10,
            receive_wait_secs: 20,
            lock_duration_secs: 30,
            retry: RetryConfig::default(),
        }
    }
}

impl EventBusConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `EVENT_BUS_TRANSPORT`: `in_memory`, `redis` or `nats` (default: in_memory)
    /// - `EVENT_BUS_AUTO_CREATE_ENTITIES`: create missing infrastructure (default: true)
    /// - `EVENT_BUS_TOPIC_NAME`: shared topic name (default: commerce-events)
    /// - `EVENT_BUS_MAX_CONCURRENT_CALLS`: per-loop parallelism (default: 4)
    /// - `EVENT_BUS_DEFAULT_MESSAGE_TTL_DAYS`: message retention (default: 14)
    /// - `EVENT_BUS_DEAD_LETTER_TARGET`: shared dead-letter target
    /// - `EVENT_BUS_CONNECTION_STRING`: broker URL
    /// - `EVENT_BUS_RECEIVE_BATCH_SIZE`: envelopes per receive (default: 10)
    /// - `EVENT_BUS_RECEIVE_WAIT_SECS`: long-poll wait (default: 20)
    /// - `EVENT_BUS_LOCK_DURATION_SECS`: visibility lock (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();

        let transport = match lookup("EVENT_BUS_TRANSPORT") {
            Some(value) => value.parse()?,
            None => default.transport,
        };

        Ok(Self {
            transport,
            auto_create_entities: parse_bool_or(
                &lookup,
                "EVENT_BUS_AUTO_CREATE_ENTITIES",
                default.auto_create_entities,
            )?,
            topic_name: lookup("EVENT_BUS_TOPIC_NAME").unwrap_or(default.topic_name),
            max_concurrent_calls: parse_or(
                &lookup,
                "EVENT_BUS_MAX_CONCURRENT_CALLS",
                default.max_concurrent_calls,
            )?,
            default_message_ttl_days: parse_or(
                &lookup,
                "EVENT_BUS_DEFAULT_MESSAGE_TTL_DAYS",
                default.default_message_ttl_days,
            )?,
            dead_letter_target: lookup("EVENT_BUS_DEAD_LETTER_TARGET").filter(|s| !s.is_empty()),
            connection_string: lookup("EVENT_BUS_CONNECTION_STRING").filter(|s| !s.is_empty()),
            receive_batch_size: parse_or(
                &lookup,
                "EVENT_BUS_RECEIVE_BATCH_SIZE",
                default.receive_batch_size,
            )?,
            receive_wait_secs: parse_or(
                &lookup,
                "EVENT_BUS_RECEIVE_WAIT_SECS",
                default.receive_wait_secs,
            )?,
            lock_duration_secs: parse_or(
                &lookup,
                "EVENT_BUS_LOCK_DURATION_SECS",
                default.lock_duration_secs,
            )?,
            retry: default.retry,
        })
    }

    /// Validate that the configuration is usable for the selected transport.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "topic_name".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_calls".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.receive_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "receive_batch_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !self.auto_create_entities && self.dead_letter_target.is_none() {
            return Err(ConfigError::MissingValue(
                "dead_letter_target (required when auto_create_entities is false)".to_string(),
            ));
        }
        if self.transport.is_broker() && self.connection_string.is_none() {
            return Err(ConfigError::MissingValue(format!(
                "connection_string (required by the {} transport)",
                self.transport.as_str()
            )));
        }
        Ok(())
    }

    /// Retention of messages in consumer resources.
    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.default_message_ttl_days) * 24 * 60 * 60)
    }

    /// Long-poll wait per receive call.
    pub fn receive_wait(&self) -> Duration {
        Duration::from_secs(self.receive_wait_secs)
    }

    /// Visibility lock of a received envelope.
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool_or<F>(lookup: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{}'", other),
        }),
    }
}
