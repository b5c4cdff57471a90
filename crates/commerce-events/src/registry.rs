//! Handler registry.
//!
//! Maps an event type name to the handlers registered for it. Registration
//! takes the write lock; dispatch clones a [`Registration`] snapshot under the
//! read lock and never iterates the map while it is being mutated.

use crate::error::{EventBusError, EventBusResult};
use crate::notification::{HandlerError, Notification, NotificationHandler};
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// A deserialized notification whose concrete type is known to its handlers.
pub(crate) type AnyNotification = Arc<dyn Any + Send + Sync>;

/// Deserializes a JSON body into the registered notification type.
pub(crate) type DecodeFn = fn(&str) -> Result<AnyNotification, serde_json::Error>;

fn decode<N: Notification>(body: &str) -> Result<AnyNotification, serde_json::Error> {
    let notification: N = serde_json::from_str(body)?;
    Ok(Arc::new(notification))
}

/// Type-erased handler stored in the registry.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn handle(
        &self,
        notification: &(dyn Any + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError>;

    fn name(&self) -> &str;
}

struct TypedHandler<N, H> {
    handler: H,
    _notification: PhantomData<fn(N)>,
}

#[async_trait]
impl<N, H> ErasedHandler for TypedHandler<N, H>
where
    N: Notification,
    H: NotificationHandler<N>,
{
    async fn handle(
        &self,
        notification: &(dyn Any + Send + Sync),
        cancel: &CancellationToken,
    ) -> Result<(), HandlerError> {
        let notification = notification.downcast_ref::<N>().ok_or_else(|| {
            HandlerError::from(format!(
                "notification is not a {}",
                std::any::type_name::<N>()
            ))
        })?;
        self.handler.handle(notification, cancel).await
    }

    fn name(&self) -> &str {
        self.handler.name()
    }
}

/// Handlers registered for one event type.
#[derive(Clone)]
pub(crate) struct Registration {
    pub(crate) event_type: &'static str,
    pub(crate) type_name: &'static str,
    type_id: TypeId,
    pub(crate) decode: DecodeFn,
    pub(crate) handlers: Vec<Arc<dyn ErasedHandler>>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("event_type", &self.event_type)
            .field("type_name", &self.type_name)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Thread-safe map from event type name to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: RwLock<HashMap<&'static str, Registration>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types = self
            .entries
            .try_read()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("HandlerRegistry")
            .field("event_types", &types)
            .finish()
    }
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for `N`.
    ///
    /// Returns `true` when this is the first handler for the event type.
    pub(crate) async fn add<N, H>(&self, handler: H) -> EventBusResult<bool>
    where
        N: Notification,
        H: NotificationHandler<N> + 'static,
    {
        let event_type = N::event_type();
        let erased: Arc<dyn ErasedHandler> = Arc::new(TypedHandler {
            handler,
            _notification: PhantomData::<fn(N)>,
        });

        let mut entries = self.entries.write().await;
        match entries.get_mut(event_type) {
            Some(existing) if existing.type_id != TypeId::of::<N>() => {
                Err(EventBusError::EventTypeConflict {
                    event_type: event_type.to_string(),
                    existing: existing.type_name.to_string(),
                    incoming: std::any::type_name::<N>().to_string(),
                })
            }
            Some(existing) => {
                existing.handlers.push(erased);
                Ok(false)
            }
            None => {
                entries.insert(
                    event_type,
                    Registration {
                        event_type,
                        type_name: std::any::type_name::<N>(),
                        type_id: TypeId::of::<N>(),
                        decode: decode::<N>,
                        handlers: vec![erased],
                    },
                );
                Ok(true)
            }
        }
    }

    /// Snapshot of the registration for an event type.
    pub(crate) async fn get(&self, event_type: &str) -> Option<Registration> {
        self.entries.read().await.get(event_type).cloned()
    }

    /// Event types with at least one handler.
    pub async fn event_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.entries.read().await.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Number of handlers registered for an event type.
    pub async fn handler_count(&self, event_type: &str) -> usize {
        self.entries
            .read()
            .await
            .get(event_type)
            .map(|r| r.handlers.len())
            .unwrap_or(0)
    }

    /// Total number of handlers across all event types.
    pub async fn total_handlers(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .map(|r| r.handlers.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::handler_fn;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct StockReserved {
        sku: String,
    }

    impl Notification for StockReserved {}

    mod other {
        use super::*;

        #[derive(Debug, Clone, Serialize, Deserialize)]
        pub struct StockReserved {
            pub quantity: u32,
        }

        impl Notification for StockReserved {}
    }

    fn noop<N: Notification + Clone>() -> impl NotificationHandler<N> {
        handler_fn("noop", |_event: N, _cancel| async { Ok::<(), HandlerError>(()) })
    }

    #[tokio::test]
    async fn test_add_reports_first_handler() {
        let registry = HandlerRegistry::new();
        assert!(registry.add::<StockReserved, _>(noop()).await.unwrap());
        assert!(!registry.add::<StockReserved, _>(noop()).await.unwrap());

        assert_eq!(registry.handler_count("StockReserved").await, 2);
        assert_eq!(registry.event_types().await, vec!["StockReserved"]);
        assert_eq!(registry.total_handlers().await, 2);
    }

    #[tokio::test]
    async fn test_conflicting_type_names_are_rejected() {
        let registry = HandlerRegistry::new();
        registry.add::<StockReserved, _>(noop()).await.unwrap();

        let result = registry.add::<other::StockReserved, _>(noop()).await;
        assert!(matches!(result, Err(EventBusError::EventTypeConflict { .. })));
        assert_eq!(registry.handler_count("StockReserved").await, 1);
    }

    #[tokio::test]
    async fn test_decode_and_dispatch_through_registration() {
        let registry = HandlerRegistry::new();
        registry
            .add::<StockReserved, _>(handler_fn("check", |event: StockReserved, _cancel| async move {
                if event.sku == "SKU-1" {
                    Ok::<(), HandlerError>(())
                } else {
                    Err(HandlerError::from("unexpected sku"))
                }
            }))
            .await
            .unwrap();

        let registration = registry.get("StockReserved").await.unwrap();
        let decoded = (registration.decode)(r#"{"sku":"SKU-1"}"#).unwrap();
        let handler = &registration.handlers[0];
        assert_eq!(handler.name(), "check");
        handler
            .handle(decoded.as_ref(), &CancellationToken::new())
            .await
            .unwrap();

        assert!((registration.decode)(r#"{"wrong":true}"#).is_err());
    }
}
