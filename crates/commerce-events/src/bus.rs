//! Event bus facade
//!
//! [`EventBus`] is the single entry point used by application code. It hides
//! the transport (selected once at construction) behind four operations:
//! [`register`](EventBus::register), [`publish`](EventBus::publish),
//! [`start_consuming`](EventBus::start_consuming) and
//! [`dispose`](EventBus::dispose).

use crate::broker::consumer::{ConsumerLoop, ConsumerSettings};
use crate::broker::provision::{provision_consumer, provision_topic};
use crate::broker::{BrokerClient, ConsumerResource};
use crate::config::{ConfigError, EventBusConfig, TransportKind};
use crate::envelope::OutboundMessage;
use crate::error::EventBusResult;
use crate::memory::InMemoryTransport;
use crate::notification::{Notification, NotificationHandler, NotificationPublisher};
use crate::registry::HandlerRegistry;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Event bus statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBusStats {
    /// Notifications accepted by `publish`
    pub events_published: u64,
    /// Envelopes whose handlers all succeeded
    pub events_delivered: u64,
    /// Handler invocations that failed after their retries
    pub handler_failures: u64,
    /// Envelopes moved to a dead-letter target
    pub dead_lettered: u64,
    /// Envelopes whose body could not be deserialized
    pub deserialization_failures: u64,
    /// Registered handlers across all event types
    pub registered_handlers: usize,
    /// Consumption loops currently running
    pub active_consumer_loops: usize,
}

/// Counters shared between the facade and its loops.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) published: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) handler_failures: AtomicU64,
    pub(crate) dead_lettered: AtomicU64,
    pub(crate) deserialization_failures: AtomicU64,
    pub(crate) active_loops: AtomicU64,
}

/// Transport selected once at startup.
enum Transport {
    InMemory(Arc<InMemoryTransport>),
    Broker(Arc<dyn BrokerClient>),
}

impl Transport {
    fn name(&self) -> &'static str {
        match self {
            Transport::InMemory(_) => "in_memory",
            Transport::Broker(broker) => broker.name(),
        }
    }
}

/// Notification event bus.
///
/// # Example
///
/// ```rust,no_run
/// use commerce_events::{handler_fn, EventBus, EventBusConfig, HandlerError, Notification};
/// use serde::{Deserialize, Serialize};
/// use tokio_util::sync::CancellationToken;
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderPlaced {
///     order_id: u64,
/// }
///
/// impl Notification for OrderPlaced {}
///
/// async fn example() -> Result<(), Box<dyn std::error::Error>> {
///     let bus = EventBus::from_config(EventBusConfig::from_env()?).await?;
///
///     bus.register::<OrderPlaced, _>(handler_fn("send-receipt", |event: OrderPlaced, _cancel| async move {
///         println!("receipt for order {}", event.order_id);
///         Ok::<(), HandlerError>(())
///     }))
///     .await?;
///
///     bus.publish(&OrderPlaced { order_id: 1 }).await?;
///
///     let cancel = CancellationToken::new();
///     bus.start_consuming(cancel).await;
///     bus.dispose().await;
///     Ok(())
/// }
/// ```
pub struct EventBus {
    config: EventBusConfig,
    transport: Transport,
    registry: Arc<HandlerRegistry>,
    stats: Arc<StatsCounters>,

    /// Root token; cancelled by `dispose`
    shutdown: CancellationToken,

    /// Token of the running consumption session, if any
    session: Mutex<Option<CancellationToken>>,

    /// Consumer resources provisioned by this process
    provisioned: Mutex<HashMap<&'static str, ConsumerResource>>,

    /// Event types with a running broker loop
    consuming: Mutex<HashSet<&'static str>>,

    tracker: TaskTracker,
    topic_ready: OnceCell<()>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("transport", &self.transport.name())
            .field("topic", &self.config.topic_name)
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventBus {
    /// Create a bus over the in-process transport.
    pub fn in_memory(config: EventBusConfig) -> Self {
        Self::new(Transport::InMemory(Arc::new(InMemoryTransport::new())), config)
    }

    /// Create a bus over a broker client.
    pub fn with_broker(broker: Arc<dyn BrokerClient>, config: EventBusConfig) -> Self {
        Self::new(Transport::Broker(broker), config)
    }

    /// Validate the configuration and connect the selected transport.
    pub async fn from_config(config: EventBusConfig) -> EventBusResult<Self> {
        config.validate()?;

        match config.transport {
            TransportKind::InMemory => Ok(Self::in_memory(config)),
            TransportKind::Redis => {
                let broker = connect_redis(&config).await?;
                Ok(Self::with_broker(broker, config))
            }
            TransportKind::Nats => {
                let broker = connect_nats(&config).await?;
                Ok(Self::with_broker(broker, config))
            }
        }
    }

    fn new(transport: Transport, config: EventBusConfig) -> Self {
        info!(
            transport = transport.name(),
            topic = %config.topic_name,
            auto_create_entities = config.auto_create_entities,
            "Event bus created"
        );
        Self {
            config,
            transport,
            registry: Arc::new(HandlerRegistry::new()),
            stats: Arc::new(StatsCounters::default()),
            shutdown: CancellationToken::new(),
            session: Mutex::new(None),
            provisioned: Mutex::new(HashMap::new()),
            consuming: Mutex::new(HashSet::new()),
            tracker: TaskTracker::new(),
            topic_ready: OnceCell::new(),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Registered handlers.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Register a handler for `N`.
    ///
    /// Allowed before or after consumption starts. On a broker transport the
    /// first handler of an event type provisions the topic and its consumer
    /// resource, so notifications published from then on are retained until
    /// consumed. After start it also starts the loop for that type.
    /// Provisioning errors are returned and the handler stays registered;
    /// `start_consuming` and `ensure_infrastructure` provision it again.
    pub async fn register<N, H>(&self, handler: H) -> EventBusResult<()>
    where
        N: Notification,
        H: NotificationHandler<N> + 'static,
    {
        let first = self.registry.add::<N, H>(handler).await?;
        let handlers = self.registry.handler_count(N::event_type()).await;
        info!(event_type = N::event_type(), handlers, "Registered handler");

        if !first {
            return Ok(());
        }

        let Transport::Broker(broker) = &self.transport else {
            return Ok(());
        };

        self.consumer_resource(broker, N::event_type()).await?;

        let session = self.session.lock().await.clone();
        match session {
            Some(session) if !session.is_cancelled() => {
                self.spawn_consumer(broker, N::event_type(), &session).await
            }
            _ => Ok(()),
        }
    }

    /// Publish a notification. Never waits for consumers.
    pub async fn publish<N: Notification>(&self, notification: &N) -> EventBusResult<()> {
        let body = serde_json::to_string(notification)?;
        let message = OutboundMessage::new(N::event_type(), body);

        match &self.transport {
            Transport::InMemory(transport) => transport.enqueue(message)?,
            Transport::Broker(broker) => {
                self.ensure_topic(broker).await?;
                let message_id = broker.send(&self.config.topic_name, &message).await?;
                debug!(
                    event_type = N::event_type(),
                    message_id = %message_id,
                    topic = %self.config.topic_name,
                    "Published notification"
                );
            }
        }

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Start one consumption loop per registered event type and run until
    /// `cancel` fires or the bus is disposed, then wait for every loop.
    ///
    /// A second call logs a warning and returns immediately. Event types whose
    /// provisioning fails are logged and skipped; use
    /// [`ensure_infrastructure`](Self::ensure_infrastructure) to fail fast.
    pub async fn start_consuming(&self, cancel: CancellationToken) {
        if self.disposed.load(Ordering::SeqCst) {
            warn!("Event bus is disposed, not starting consumption");
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Event bus consumption already started");
            return;
        }

        let session = self.shutdown.child_token();
        *self.session.lock().await = Some(session.clone());

        match &self.transport {
            Transport::InMemory(transport) => {
                let transport = transport.clone();
                let registry = self.registry.clone();
                let retry = self.config.retry.clone();
                let stats = self.stats.clone();
                let token = session.clone();
                self.tracker.spawn(async move {
                    transport.run(registry, retry, stats, token).await;
                });
            }
            Transport::Broker(broker) => {
                for event_type in self.registry.event_types().await {
                    if let Err(e) = self.spawn_consumer(broker, event_type, &session).await {
                        error!(
                            event_type = event_type,
                            error = %e,
                            "Failed to start consumer loop"
                        );
                    }
                }
            }
        }

        info!(transport = self.transport.name(), "Event bus consuming");

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = session.cancelled() => {}
        }
        session.cancel();

        self.tracker.close();
        self.tracker.wait().await;
        info!("Event bus consumption stopped");
    }

    /// Stop every loop, wait for in-flight handlers, then release the
    /// broker client. Idempotent; safe without a prior start.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        if let Transport::Broker(broker) = &self.transport {
            broker.close().await;
        }
        info!(transport = self.transport.name(), "Event bus disposed");
    }

    /// Provision, or verify, the topic and the consumer resource of every
    /// registered event type. Returns the first error.
    pub async fn ensure_infrastructure(&self) -> EventBusResult<()> {
        let Transport::Broker(broker) = &self.transport else {
            return Ok(());
        };

        self.ensure_topic(broker).await?;
        for event_type in self.registry.event_types().await {
            self.consumer_resource(broker, event_type).await?;
        }
        Ok(())
    }

    /// Current statistics.
    pub async fn stats(&self) -> EventBusStats {
        EventBusStats {
            events_published: self.stats.published.load(Ordering::Relaxed),
            events_delivered: self.stats.delivered.load(Ordering::Relaxed),
            handler_failures: self.stats.handler_failures.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            deserialization_failures: self.stats.deserialization_failures.load(Ordering::Relaxed),
            registered_handlers: self.registry.total_handlers().await,
            active_consumer_loops: self.stats.active_loops.load(Ordering::Relaxed) as usize,
        }
    }

    async fn ensure_topic(&self, broker: &Arc<dyn BrokerClient>) -> EventBusResult<()> {
        self.topic_ready
            .get_or_try_init(|| provision_topic(broker.as_ref(), &self.config))
            .await?;
        Ok(())
    }

    /// Consumer resource of `event_type`, provisioned on first use.
    async fn consumer_resource(
        &self,
        broker: &Arc<dyn BrokerClient>,
        event_type: &'static str,
    ) -> EventBusResult<ConsumerResource> {
        let mut provisioned = self.provisioned.lock().await;
        if let Some(resource) = provisioned.get(event_type) {
            return Ok(resource.clone());
        }

        self.ensure_topic(broker).await?;
        let resource = provision_consumer(broker.as_ref(), &self.config, event_type).await?;
        provisioned.insert(event_type, resource.clone());
        Ok(resource)
    }

    /// Spawn the loop of `event_type`, unless one is already running.
    async fn spawn_consumer(
        &self,
        broker: &Arc<dyn BrokerClient>,
        event_type: &'static str,
        session: &CancellationToken,
    ) -> EventBusResult<()> {
        let mut consuming = self.consuming.lock().await;
        if consuming.contains(event_type) {
            return Ok(());
        }

        let resource = self.consumer_resource(broker, event_type).await?;
        let Some(registration) = self.registry.get(event_type).await else {
            return Ok(());
        };

        let consumer = ConsumerLoop::new(
            broker.clone(),
            resource,
            self.registry.clone(),
            registration.decode,
            ConsumerSettings {
                batch_size: self.config.receive_batch_size,
                wait: self.config.receive_wait(),
                max_concurrent_calls: self.config.max_concurrent_calls,
                retry: self.config.retry.clone(),
            },
            self.stats.clone(),
        );
        self.tracker.spawn(consumer.run(session.clone()));
        consuming.insert(event_type);
        Ok(())
    }
}

#[async_trait]
impl NotificationPublisher for EventBus {
    async fn publish<N: Notification>(&self, notification: &N) -> EventBusResult<()> {
        EventBus::publish(self, notification).await
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(config: &EventBusConfig) -> EventBusResult<Arc<dyn BrokerClient>> {
    let url = config
        .connection_string
        .as_deref()
        .ok_or_else(|| ConfigError::MissingValue("connection_string".to_string()))?;
    let broker = crate::broker::RedisBroker::connect(url).await?;
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_config: &EventBusConfig) -> EventBusResult<Arc<dyn BrokerClient>> {
    Err(ConfigError::UnsupportedTransport("redis".to_string(), "redis").into())
}

#[cfg(feature = "nats")]
async fn connect_nats(config: &EventBusConfig) -> EventBusResult<Arc<dyn BrokerClient>> {
    let url = config
        .connection_string
        .as_deref()
        .ok_or_else(|| ConfigError::MissingValue("connection_string".to_string()))?;
    let broker = crate::broker::NatsBroker::connect(url).await?;
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "nats"))]
async fn connect_nats(_config: &EventBusConfig) -> EventBusResult<Arc<dyn BrokerClient>> {
    Err(ConfigError::UnsupportedTransport("nats".to_string(), "nats").into())
}
