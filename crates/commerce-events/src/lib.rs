//! # Commerce Events
//!
//! Notification event bus for the commerce backend. Services publish typed
//! domain notifications (`OrderPlaced`, `PaymentCaptured`, ...) and register
//! handlers for them; the bus routes each notification to every handler of
//! its type with at-least-once delivery.
//!
//! ## Overview
//!
//! The commerce-events crate handles:
//! - **Notifications**: plain serde structs implementing [`Notification`]
//! - **Handlers**: async [`NotificationHandler`]s, or closures via [`handler_fn`]
//! - **Transports**: an in-process queue, or a durable broker with topic
//!   fan-out into one filtered queue per event type
//! - **Reliability**: per-handler retries with exponential backoff (2s, 4s),
//!   broker redelivery, and dead-lettering after 3 deliveries
//! - **Provisioning**: idempotent creation of topics, queues, filters and
//!   dead-letter targets
//!
//! ## Features
//!
//! - `memory` (default): in-process transport and broker emulation
//! - `redis`: Redis streams broker backend
//! - `nats`: NATS JetStream broker backend
//!
//! ## Usage
//!
//! ### Registering handlers and publishing
//!
//! ```rust,no_run
//! use commerce_events::{handler_fn, EventBus, EventBusConfig, HandlerError, Notification};
//! use serde::{Deserialize, Serialize};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: u64,
//!     total_cents: u64,
//! }
//!
//! impl Notification for OrderPlaced {}
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = EventBus::in_memory(EventBusConfig::default());
//!
//!     bus.register::<OrderPlaced, _>(handler_fn("reserve-stock", |event: OrderPlaced, _cancel| async move {
//!         println!("reserving stock for order {}", event.order_id);
//!         Ok::<(), HandlerError>(())
//!     }))
//!     .await?;
//!
//!     bus.publish(&OrderPlaced { order_id: 1, total_cents: 4_999 }).await?;
//!
//!     let shutdown = CancellationToken::new();
//!     bus.start_consuming(shutdown).await;
//!     Ok(())
//! }
//! ```
//!
//! ### Running in the background
//!
//! ```rust,no_run
//! use commerce_events::{EventBus, EventBusConfig, EventBusHost};
//! use std::sync::Arc;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = Arc::new(EventBus::from_config(EventBusConfig::from_env()?).await?);
//!     // register handlers here
//!     let host = EventBusHost::new(bus);
//!     host.start().await?;
//!     // ... serve traffic ...
//!     host.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Delivery semantics
//!
//! Handlers must be idempotent. Within one delivery every handler gets up to
//! three attempts. If a handler still fails, the broker envelope is released
//! and redelivered; after the third delivery it moves to the dead-letter
//! target. Envelopes that cannot be deserialized are dead-lettered at once
//! without invoking any handler.

pub mod broker;
pub mod bus;
pub mod config;
mod dispatch;
pub mod envelope;
pub mod error;
pub mod host;
pub mod memory;
pub mod notification;
pub mod registry;
pub mod retry;

// Re-export main types
pub use broker::{BrokerClient, BrokerError, BrokerResult, ConsumerResource, MemoryBroker, SubscriptionFilter};
pub use bus::{EventBus, EventBusStats};
pub use config::{ConfigError, EventBusConfig, TransportKind};
pub use envelope::{Delivery, OutboundMessage, EVENT_TYPE_ATTRIBUTE};
pub use error::{EventBusError, EventBusResult};
pub use host::EventBusHost;
pub use memory::InMemoryTransport;
pub use notification::{
    handler_fn, FunctionHandler, HandlerError, Notification, NotificationHandler, NotificationPublisher,
};
pub use registry::HandlerRegistry;
pub use retry::{with_retry, with_retry_until, RetryConfig};

#[cfg(feature = "nats")]
pub use broker::NatsBroker;
#[cfg(feature = "redis")]
pub use broker::RedisBroker;
