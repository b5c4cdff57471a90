//! Background runner for the event bus.
//!
//! Applications register their handlers on the bus, hand it to an
//! [`EventBusHost`] and call [`start`](EventBusHost::start) during startup and
//! [`stop`](EventBusHost::stop) during shutdown.

use crate::bus::EventBus;
use crate::error::EventBusResult;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs [`EventBus::start_consuming`] as a background task.
#[derive(Debug)]
pub struct EventBusHost {
    bus: Arc<EventBus>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventBusHost {
    /// Create a host with its own shutdown token.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_shutdown(bus, &CancellationToken::new())
    }

    /// Create a host that also stops when `parent` is cancelled.
    pub fn with_shutdown(bus: Arc<EventBus>, parent: &CancellationToken) -> Self {
        Self {
            bus,
            cancel: parent.child_token(),
            task: Mutex::new(None),
        }
    }

    /// The hosted bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Verify the infrastructure, then start consuming in the background.
    ///
    /// Calling `start` on a running host does nothing.
    pub async fn start(&self) -> EventBusResult<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("Event bus host already started");
            return Ok(());
        }

        self.bus.ensure_infrastructure().await?;

        let bus = self.bus.clone();
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(async move {
            bus.start_consuming(cancel).await;
        }));
        info!("Event bus host started");
        Ok(())
    }

    /// Stop consuming, wait for the background task and dispose the bus.
    pub async fn stop(&self) {
        self.cancel.cancel();

        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Event bus consumer task ended abnormally");
            }
        }

        self.bus.dispose().await;
        info!("Event bus host stopped");
    }
}
