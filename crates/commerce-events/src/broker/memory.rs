//! In-process broker emulation.
//!
//! [`MemoryBroker`] behaves like a topic that fans out into per-consumer
//! queues: bindings carry attribute filters, received messages are locked for
//! `lock_duration`, every receive counts as a delivery, and a message whose
//! delivery limit is reached moves to its dead-letter target. It lets the
//! broker transport run end to end without external infrastructure.

use super::{BrokerClient, BrokerError, BrokerResult, ConsumerResource, SubscriptionFilter};
use crate::envelope::{
    new_message_id, wrap_body, Delivery, OutboundMessage, EVENT_TYPE_ATTRIBUTE,
    MAX_DELIVERY_COUNT_EXCEEDED,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// A message held by a dead-letter target.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetteredMessage {
    /// Broker message id
    pub message_id: String,
    /// Body as it was delivered
    pub body: String,
    /// Broker attributes
    pub attributes: HashMap<String, String>,
    /// Why the message was dead-lettered
    pub reason: String,
    /// Human-readable detail
    pub description: String,
    /// Deliveries made before dead-lettering
    pub delivery_count: u32,
    /// When the message was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    attributes: HashMap<String, String>,
    delivery_count: u32,
    enqueued_at: Instant,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    locked_until: Instant,
}

#[derive(Debug)]
struct Queue {
    topic: String,
    filter: Option<SubscriptionFilter>,
    redrive: Option<(String, u32)>,
    authorized: bool,
    retention: Duration,
    lock_duration: Duration,
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlight>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Duration>,
    queues: HashMap<String, Queue>,
    dead_letters: HashMap<String, Vec<DeadLetteredMessage>>,
}

impl BrokerState {
    fn move_to_dead_letter(
        &mut self,
        dead_letter: &str,
        message: StoredMessage,
        reason: &str,
        description: &str,
    ) -> BrokerResult<()> {
        let target = self
            .dead_letters
            .get_mut(dead_letter)
            .ok_or_else(|| BrokerError::NotFound(dead_letter.to_string()))?;
        target.push(DeadLetteredMessage {
            message_id: message.message_id,
            body: message.body,
            attributes: message.attributes,
            reason: reason.to_string(),
            description: description.to_string(),
            delivery_count: message.delivery_count,
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }

    /// Return expired locks to the queue, dead-lettering exhausted messages.
    fn reclaim_expired(&mut self, queue_name: &str, now: Instant) -> BrokerResult<()> {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return Ok(());
        };

        let expired: Vec<String> = queue
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.locked_until <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        let redrive = queue.redrive.clone();
        let mut exhausted = Vec::new();
        for receipt in expired {
            if let Some(entry) = queue.in_flight.remove(&receipt) {
                match &redrive {
                    Some((_, max)) if entry.message.delivery_count >= *max => {
                        exhausted.push(entry.message)
                    }
                    _ => queue.ready.push_back(entry.message),
                }
            }
        }

        if let Some((dead_letter, _)) = redrive {
            for message in exhausted {
                self.move_to_dead_letter(
                    &dead_letter,
                    message,
                    MAX_DELIVERY_COUNT_EXCEEDED,
                    "lock expired on the final delivery",
                )?;
            }
        }
        Ok(())
    }
}

/// In-process broker with topic fan-out, filters, delivery counting and
/// dead-lettering.
///
/// # Example
///
/// ```rust
/// use commerce_events::broker::MemoryBroker;
/// use std::sync::Arc;
///
/// let broker = Arc::new(MemoryBroker::new().with_wrapped_deliveries());
/// ```
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    arrivals: Notify,
    unavailable: AtomicBool,
    closed: AtomicBool,
    wrap_deliveries: bool,
    require_authorization: bool,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver bodies wrapped in a notification-service envelope, the way a
    /// topic delivers into a subscribed queue without raw delivery.
    pub fn with_wrapped_deliveries(mut self) -> Self {
        self.wrap_deliveries = true;
        self
    }

    /// Only deliver into queues the topic has been authorized to write to.
    pub fn with_topic_authorization(mut self) -> Self {
        self.require_authorization = true;
        self
    }

    /// Simulate an outage: every call fails with [`BrokerError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Whether [`BrokerClient::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> BrokerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("memory broker is offline".to_string()));
        }
        if self.is_closed() {
            return Err(BrokerError::Unavailable("memory broker is closed".to_string()));
        }
        Ok(())
    }

    /// Whether a topic exists.
    pub async fn has_topic(&self, topic: &str) -> bool {
        self.state.lock().await.topics.contains_key(topic)
    }

    /// Messages held by a queue, visible or locked.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.in_flight.len())
            .unwrap_or(0)
    }

    /// Contents of a dead-letter target.
    pub async fn dead_letters(&self, dead_letter: &str) -> Vec<DeadLetteredMessage> {
        self.state
            .lock()
            .await
            .dead_letters
            .get(dead_letter)
            .cloned()
            .unwrap_or_default()
    }

    /// SQL rendering of the filter attached to a queue's binding.
    pub async fn filter_rule(&self, queue: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .and_then(|q| q.filter.as_ref())
            .map(SubscriptionFilter::to_sql)
    }

    /// Put a raw body straight into a queue, bypassing the topic.
    ///
    /// Used to simulate foreign or malformed producers.
    pub async fn enqueue_raw(
        &self,
        queue: &str,
        body: impl Into<String>,
        attributes: HashMap<String, String>,
    ) -> BrokerResult<String> {
        let message_id = new_message_id();
        {
            let mut state = self.state.lock().await;
            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::NotFound(queue.to_string()))?;
            target.ready.push_back(StoredMessage {
                message_id: message_id.clone(),
                body: body.into(),
                attributes,
                delivery_count: 0,
                enqueued_at: Instant::now(),
            });
        }
        self.arrivals.notify_waiters();
        Ok(message_id)
    }

    fn take_batch(
        &self,
        state: &mut BrokerState,
        resource: &ConsumerResource,
        max_messages: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        let now = Instant::now();
        state.reclaim_expired(&resource.name, now)?;

        let queue = state
            .queues
            .get_mut(&resource.name)
            .ok_or_else(|| BrokerError::NotFound(resource.name.clone()))?;

        let retention = queue.retention;
        queue
            .ready
            .retain(|message| now.duration_since(message.enqueued_at) < retention);

        let mut batch = Vec::new();
        while batch.len() < max_messages {
            let Some(mut message) = queue.ready.pop_front() else {
                break;
            };
            message.delivery_count += 1;

            let receipt = new_message_id();
            let (body, attributes) = if self.wrap_deliveries {
                let outbound = OutboundMessage {
                    event_type: message
                        .attributes
                        .get(EVENT_TYPE_ATTRIBUTE)
                        .cloned()
                        .unwrap_or_default(),
                    body: message.body.clone(),
                    attributes: message.attributes.clone(),
                    published_at: Utc::now(),
                };
                (
                    wrap_body(&queue.topic, &message.message_id, &outbound),
                    HashMap::new(),
                )
            } else {
                (message.body.clone(), message.attributes.clone())
            };

            batch.push(Delivery {
                message_id: message.message_id.clone(),
                receipt: receipt.clone(),
                event_type: attributes.get(EVENT_TYPE_ATTRIBUTE).cloned(),
                body,
                attributes,
                delivery_count: message.delivery_count,
            });
            queue.in_flight.insert(
                receipt,
                InFlight {
                    message,
                    locked_until: now + queue.lock_duration,
                },
            );
        }
        Ok(batch)
    }

    async fn take_in_flight(
        &self,
        resource: &ConsumerResource,
        delivery: &Delivery,
    ) -> BrokerResult<(tokio::sync::MutexGuard<'_, BrokerState>, StoredMessage)> {
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(&resource.name)
            .ok_or_else(|| BrokerError::NotFound(resource.name.clone()))?;
        let entry = queue.in_flight.remove(&delivery.receipt).ok_or_else(|| {
            BrokerError::Operation(format!(
                "lock for message {} expired or was already settled",
                delivery.message_id
            ))
        })?;
        Ok((state, entry.message))
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn topic_exists(&self, topic: &str) -> BrokerResult<bool> {
        self.check_available()?;
        Ok(self.has_topic(topic).await)
    }

    async fn create_topic(&self, topic: &str, retention: Duration) -> BrokerResult<()> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .topics
            .entry(topic.to_string())
            .or_insert(retention);
        Ok(())
    }

    async fn dead_letter_exists(&self, name: &str) -> BrokerResult<bool> {
        self.check_available()?;
        Ok(self.state.lock().await.dead_letters.contains_key(name))
    }

    async fn create_dead_letter(&self, name: &str, _retention: Duration) -> BrokerResult<()> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .dead_letters
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn consumer_exists(&self, resource: &ConsumerResource) -> BrokerResult<bool> {
        self.check_available()?;
        Ok(self.state.lock().await.queues.contains_key(&resource.name))
    }

    async fn create_consumer(&self, resource: &ConsumerResource) -> BrokerResult<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if !state.topics.contains_key(&resource.topic) {
            return Err(BrokerError::NotFound(resource.topic.clone()));
        }
        state
            .queues
            .entry(resource.name.clone())
            .or_insert_with(|| Queue {
                topic: resource.topic.clone(),
                filter: None,
                redrive: None,
                authorized: false,
                retention: resource.retention,
                lock_duration: resource.lock_duration,
                ready: VecDeque::new(),
                in_flight: HashMap::new(),
            });
        Ok(())
    }

    async fn apply_filter(&self, resource: &ConsumerResource) -> BrokerResult<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(&resource.name)
            .ok_or_else(|| BrokerError::NotFound(resource.name.clone()))?;
        queue.filter = Some(resource.filter.clone());
        Ok(())
    }

    async fn apply_redrive(&self, resource: &ConsumerResource) -> BrokerResult<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if !state.dead_letters.contains_key(&resource.dead_letter) {
            return Err(BrokerError::NotFound(resource.dead_letter.clone()));
        }
        let queue = state
            .queues
            .get_mut(&resource.name)
            .ok_or_else(|| BrokerError::NotFound(resource.name.clone()))?;
        queue.redrive = Some((resource.dead_letter.clone(), resource.max_delivery_count));
        Ok(())
    }

    async fn authorize_topic(&self, resource: &ConsumerResource) -> BrokerResult<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(&resource.name)
            .ok_or_else(|| BrokerError::NotFound(resource.name.clone()))?;
        queue.authorized = true;
        Ok(())
    }

    async fn send(&self, topic: &str, message: &OutboundMessage) -> BrokerResult<String> {
        self.check_available()?;
        let message_id = new_message_id();
        {
            let mut state = self.state.lock().await;
            if !state.topics.contains_key(topic) {
                return Err(BrokerError::NotFound(topic.to_string()));
            }
            let require_authorization = self.require_authorization;
            for queue in state.queues.values_mut() {
                if queue.topic != topic || (require_authorization && !queue.authorized) {
                    continue;
                }
                let admitted = queue
                    .filter
                    .as_ref()
                    .map(|filter| filter.matches(&message.attributes))
                    .unwrap_or(true);
                if admitted {
                    queue.ready.push_back(StoredMessage {
                        message_id: message_id.clone(),
                        body: message.body.clone(),
                        attributes: message.attributes.clone(),
                        delivery_count: 0,
                        enqueued_at: Instant::now(),
                    });
                }
            }
        }
        self.arrivals.notify_waiters();
        Ok(message_id)
    }

    async fn receive(
        &self,
        resource: &ConsumerResource,
        max_messages: usize,
        wait: Duration,
    ) -> BrokerResult<Vec<Delivery>> {
        let deadline = Instant::now() + wait;

        loop {
            self.check_available()?;
            let arrived = self.arrivals.notified();
            {
                let mut state = self.state.lock().await;
                let batch = self.take_batch(&mut state, resource, max_messages)?;
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = arrived => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn acknowledge(&self, resource: &ConsumerResource, delivery: &Delivery) -> BrokerResult<()> {
        self.check_available()?;
        let (_state, _message) = self.take_in_flight(resource, delivery).await?;
        Ok(())
    }

    async fn release(&self, resource: &ConsumerResource, delivery: &Delivery) -> BrokerResult<()> {
        self.check_available()?;
        {
            let (mut state, message) = self.take_in_flight(resource, delivery).await?;
            let redrive = state
                .queues
                .get(&resource.name)
                .and_then(|q| q.redrive.clone());

            match redrive {
                Some((dead_letter, max)) if message.delivery_count >= max => {
                    let description = format!("delivered {} times", message.delivery_count);
                    state.move_to_dead_letter(
                        &dead_letter,
                        message,
                        MAX_DELIVERY_COUNT_EXCEEDED,
                        &description,
                    )?;
                }
                _ => {
                    if let Some(queue) = state.queues.get_mut(&resource.name) {
                        queue.ready.push_back(message);
                    }
                }
            }
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn dead_letter(
        &self,
        resource: &ConsumerResource,
        delivery: &Delivery,
        reason: &str,
        description: &str,
    ) -> BrokerResult<()> {
        self.check_available()?;
        let (mut state, message) = self.take_in_flight(resource, delivery).await?;
        state.move_to_dead_letter(&resource.dead_letter, message, reason, description)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.arrivals.notify_waiters();
    }
}
