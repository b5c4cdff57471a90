//! Notification and handler contracts.
//!
//! Domain code defines notifications as plain serde structs and implements
//! [`Notification`] for them. The logical type name returned by
//! [`Notification::event_type`] is the routing key on every transport.

use crate::error::EventBusResult;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Error returned by a handler. Any error type can be boxed into it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// An immutable, serializable domain notification.
///
/// # Example
///
/// ```rust
/// use commerce_events::Notification;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderPlaced {
///     order_id: u64,
/// }
///
/// impl Notification for OrderPlaced {}
///
/// assert_eq!(OrderPlaced::event_type(), "OrderPlaced");
/// ```
pub trait Notification: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical type name used for routing and filtering.
    ///
    /// Defaults to the unqualified Rust type name. Override it when the name
    /// must stay stable across renames, or for generic notification types.
    fn event_type() -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }
}

/// Strip the module path and generic arguments from a type name.
pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Handler for one notification type, implemented by application code.
#[async_trait]
pub trait NotificationHandler<N: Notification>: Send + Sync {
    /// Handle a notification.
    ///
    /// Handlers must tolerate duplicate delivery; the bus guarantees
    /// at-least-once, not exactly-once.
    async fn handle(&self, notification: &N, cancel: &CancellationToken) -> Result<(), HandlerError>;

    /// Name used in logs.
    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }
}

#[async_trait]
impl<N, H> NotificationHandler<N> for Arc<H>
where
    N: Notification,
    H: NotificationHandler<N> + ?Sized,
{
    async fn handle(&self, notification: &N, cancel: &CancellationToken) -> Result<(), HandlerError> {
        (**self).handle(notification, cancel).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Closure-based handler.
///
/// Created with [`handler_fn`]. The closure receives an owned copy of the
/// notification so the returned future can be `'static`.
pub struct FunctionHandler<N, F> {
    name: String,
    handler: F,
    _notification: PhantomData<fn(N)>,
}

/// Wrap an async closure as a [`NotificationHandler`].
///
/// # Example
///
/// ```rust
/// use commerce_events::{handler_fn, HandlerError, Notification};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderShipped {
///     order_id: u64,
/// }
///
/// impl Notification for OrderShipped {}
///
/// let handler = handler_fn("notify-customer", |event: OrderShipped, _cancel| async move {
///     println!("order {} shipped", event.order_id);
///     Ok::<(), HandlerError>(())
/// });
/// ```
pub fn handler_fn<N, F, Fut>(name: impl Into<String>, handler: F) -> FunctionHandler<N, F>
where
    N: Notification + Clone,
    F: Fn(N, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FunctionHandler {
        name: name.into(),
        handler,
        _notification: PhantomData,
    }
}

#[async_trait]
impl<N, F, Fut> NotificationHandler<N> for FunctionHandler<N, F>
where
    N: Notification + Clone,
    F: Fn(N, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, notification: &N, cancel: &CancellationToken) -> Result<(), HandlerError> {
        (self.handler)(notification.clone(), cancel.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Publishing side used by domain code.
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    /// Publish a notification. Never waits for consumers.
    async fn publish<N: Notification>(&self, notification: &N) -> EventBusResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct CartAbandoned {
        cart_id: u64,
    }

    impl Notification for CartAbandoned {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Renamed;

    impl Notification for Renamed {
        fn event_type() -> &'static str {
            "InventoryAdjusted"
        }
    }

    #[test]
    fn test_default_event_type_is_short_name() {
        assert_eq!(CartAbandoned::event_type(), "CartAbandoned");
        assert_eq!(Renamed::event_type(), "InventoryAdjusted");
    }

    #[test]
    fn test_short_type_name_strips_generics() {
        assert_eq!(short_type_name("shop::events::Wrapper<shop::Order>"), "Wrapper");
        assert_eq!(short_type_name("Plain"), "Plain");
    }

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let handler = handler_fn("count", move |event: CartAbandoned, _cancel| {
            let calls = calls_clone.clone();
            async move {
                assert_eq!(event.cart_id, 9);
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        });

        assert_eq!(NotificationHandler::<CartAbandoned>::name(&handler), "count");
        handler
            .handle(&CartAbandoned { cart_id: 9 }, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
