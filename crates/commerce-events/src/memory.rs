//! In-process transport.
//!
//! Published notifications go into an unbounded FIFO and are dispatched by a
//! single loop in publish order. There is no persistence and no dead-letter
//! path: a handler that still fails after its retries is logged and the
//! notification is dropped.

use crate::bus::StatsCounters;
use crate::dispatch::dispatch;
use crate::envelope::OutboundMessage;
use crate::error::{EventBusError, EventBusResult};
use crate::registry::HandlerRegistry;
use crate::retry::RetryConfig;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Unbounded in-process queue shared by publishers and the dispatch loop.
#[derive(Debug)]
pub struct InMemoryTransport {
    sender: mpsc::UnboundedSender<OutboundMessage>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<OutboundMessage>>>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Enqueue a message. Returns immediately.
    pub fn enqueue(&self, message: OutboundMessage) -> EventBusResult<()> {
        self.sender
            .send(message)
            .map_err(|_| EventBusError::TransportUnavailable("in-memory queue is closed".to_string()))
    }

    /// Dispatch queued messages until `cancel` fires.
    ///
    /// Only one loop can hold the queue; a concurrent second call returns
    /// immediately. The handler registry is consulted per message, so handlers
    /// registered while the loop runs see the next message of their type.
    pub(crate) async fn run(
        &self,
        registry: Arc<HandlerRegistry>,
        retry: RetryConfig,
        stats: Arc<StatsCounters>,
        cancel: CancellationToken,
    ) {
        let Some(mut receiver) = self.receiver.lock().await.take() else {
            warn!("In-memory dispatch loop is already running");
            return;
        };

        stats.active_loops.fetch_add(1, Ordering::Relaxed);
        info!("In-memory dispatch loop started");

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let Some(registration) = registry.get(&message.event_type).await else {
                warn!(event_type = %message.event_type, "No handlers registered, dropping notification");
                continue;
            };

            let notification = match (registration.decode)(&message.body) {
                Ok(notification) => notification,
                Err(e) => {
                    error!(
                        event_type = %message.event_type,
                        error = %e,
                        "Failed to deserialize notification, dropping"
                    );
                    stats.deserialization_failures.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let failures = dispatch(&registration, &notification, &retry, &cancel).await;
            if failures.is_empty() {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(event_type = %message.event_type, "Notification dispatched");
            } else {
                stats
                    .handler_failures
                    .fetch_add(failures.len() as u64, Ordering::Relaxed);
                error!(
                    event_type = %message.event_type,
                    failed_handlers = failures.len(),
                    "Dropping notification after handler failures"
                );
            }
        }

        *self.receiver.lock().await = Some(receiver);
        stats.active_loops.fetch_sub(1, Ordering::Relaxed);
        info!("In-memory dispatch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{handler_fn, HandlerError, Notification};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct WishlistShared {
        wishlist_id: u64,
    }

    impl Notification for WishlistShared {}

    async fn wait_for(counter: &AtomicU32, expected: u32) {
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_dispatches_in_publish_order() {
        let transport = Arc::new(InMemoryTransport::new());
        let registry = Arc::new(HandlerRegistry::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let count = Arc::new(AtomicU32::new(0));

        let (seen_clone, count_clone) = (seen.clone(), count.clone());
        registry
            .add::<WishlistShared, _>(handler_fn("record", move |event: WishlistShared, _cancel| {
                let (seen, count) = (seen_clone.clone(), count_clone.clone());
                async move {
                    seen.lock().unwrap().push(event.wishlist_id);
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            }))
            .await
            .unwrap();

        for id in 1..=3 {
            let body = serde_json::to_string(&WishlistShared { wishlist_id: id }).unwrap();
            transport
                .enqueue(OutboundMessage::new(WishlistShared::event_type(), body))
                .unwrap();
        }

        let stats = Arc::new(StatsCounters::default());
        let cancel = CancellationToken::new();
        let runner = {
            let transport = transport.clone();
            let (registry, stats, cancel) = (registry.clone(), stats.clone(), cancel.clone());
            tokio::spawn(async move {
                transport
                    .run(registry, RetryConfig::fast(), stats, cancel)
                    .await
            })
        };

        wait_for(&count, 3).await;
        cancel.cancel();
        runner.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(stats.delivered.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_failing_handler_drops_notification() {
        let transport = Arc::new(InMemoryTransport::new());
        let registry = Arc::new(HandlerRegistry::new());
        let attempts = Arc::new(AtomicU32::new(0));

        let attempts_clone = attempts.clone();
        registry
            .add::<WishlistShared, _>(handler_fn("broken", move |_event: WishlistShared, _cancel| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), HandlerError>("mailer down".into())
                }
            }))
            .await
            .unwrap();

        transport
            .enqueue(OutboundMessage::new("WishlistShared", r#"{"wishlist_id":1}"#))
            .unwrap();

        let stats = Arc::new(StatsCounters::default());
        let cancel = CancellationToken::new();
        let runner = {
            let transport = transport.clone();
            let (registry, stats, cancel) = (registry.clone(), stats.clone(), cancel.clone());
            tokio::spawn(async move {
                transport
                    .run(registry, RetryConfig::fast(), stats, cancel)
                    .await
            })
        };

        wait_for(&attempts, 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        runner.await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(stats.handler_failures.load(Ordering::Relaxed), 1);
        assert_eq!(stats.delivered.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_second_loop_returns_immediately() {
        let transport = Arc::new(InMemoryTransport::new());
        let registry = Arc::new(HandlerRegistry::new());
        let stats = Arc::new(StatsCounters::default());
        let cancel = CancellationToken::new();

        let first = {
            let transport = transport.clone();
            let (registry, stats, cancel) = (registry.clone(), stats.clone(), cancel.clone());
            tokio::spawn(async move {
                transport
                    .run(registry, RetryConfig::fast(), stats, cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport
            .run(registry, RetryConfig::fast(), stats.clone(), CancellationToken::new())
            .await;
        assert_eq!(stats.active_loops.load(Ordering::Relaxed), 1);

        cancel.cancel();
        first.await.unwrap();
        assert_eq!(stats.active_loops.load(Ordering::Relaxed), 0);
    }
}
