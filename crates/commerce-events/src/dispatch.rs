//! Handler dispatch shared by every transport.
//!
//! Each handler runs under its own retry loop, in registration order. A
//! failing handler never prevents the following handlers from running; the
//! caller decides what a failure means for the envelope.

use crate::error::EventBusError;
use crate::registry::{AnyNotification, Registration};
use crate::retry::{with_retry_until, RetryConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Run every handler of `registration` against an already decoded notification.
///
/// Returns one [`EventBusError::HandlerFailed`] per handler that still failed
/// after its retries; an empty vector means every handler succeeded.
pub(crate) async fn dispatch(
    registration: &Registration,
    notification: &AnyNotification,
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> Vec<EventBusError> {
    let mut failures = Vec::new();
    let notification = notification.as_ref();

    for handler in &registration.handlers {
        let handler = handler.as_ref();
        let result = with_retry_until(retry, cancel, move || handler.handle(notification, cancel)).await;

        match result {
            Ok(()) => {
                debug!(
                    event_type = registration.event_type,
                    handler = handler.name(),
                    "Handler completed"
                );
            }
            Err(e) => {
                error!(
                    event_type = registration.event_type,
                    handler = handler.name(),
                    error = %e,
                    "Handler failed after retries"
                );
                failures.push(EventBusError::HandlerFailed {
                    event_type: registration.event_type.to_string(),
                    handler: handler.name().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{handler_fn, HandlerError, Notification};
    use crate::registry::HandlerRegistry;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PaymentCaptured {
        amount_cents: u64,
    }

    impl Notification for PaymentCaptured {}

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let registry = HandlerRegistry::new();
        let healthy_calls = Arc::new(AtomicU32::new(0));
        let broken_calls = Arc::new(AtomicU32::new(0));

        let broken = broken_calls.clone();
        registry
            .add::<PaymentCaptured, _>(handler_fn("broken", move |_event: PaymentCaptured, _cancel| {
                let broken = broken.clone();
                async move {
                    broken.fetch_add(1, Ordering::SeqCst);
                    Err::<(), HandlerError>("ledger offline".into())
                }
            }))
            .await
            .unwrap();

        let healthy = healthy_calls.clone();
        registry
            .add::<PaymentCaptured, _>(handler_fn("healthy", move |_event: PaymentCaptured, _cancel| {
                let healthy = healthy.clone();
                async move {
                    healthy.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            }))
            .await
            .unwrap();

        let registration = registry.get("PaymentCaptured").await.unwrap();
        let notification: AnyNotification = Arc::new(PaymentCaptured { amount_cents: 500 });
        let failures = dispatch(
            &registration,
            &notification,
            &RetryConfig::fast(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(failures.len(), 1);
        assert!(matches!(
            &failures[0],
            EventBusError::HandlerFailed { handler, .. } if handler == "broken"
        ));
        assert_eq!(broken_calls.load(Ordering::SeqCst), 3);
        assert_eq!(healthy_calls.load(Ordering::SeqCst), 1);
    }
}
