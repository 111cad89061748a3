//! Handler registry and dispatcher for the realtime event bus.
//!
//! The registry holds the registered handlers; the dispatcher consumes the
//! broadcast channel and feeds each event to every handler with timeout
//! and panic isolation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info, warn};

use super::handlers::RealtimeHandler;
use super::types::RealtimeEvent;

/// Default timeout for handler execution.
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Handler Registry
// ============================================================================

/// Registry for realtime handlers.
pub struct HandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn RealtimeHandler>>>,
    timeout: Duration,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HANDLER_TIMEOUT)
    }

    /// Create a new registry with custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            timeout,
        }
    }

    /// Add a handler alongside the existing ones.
    pub async fn register(&self, handler: Arc<dyn RealtimeHandler>) {
        let name = handler.name().to_string();
        self.handlers.write().await.push(handler);
        debug!(handler = %name, "Registered realtime handler");
    }

    /// Replace every registered handler with a single one.
    pub async fn replace(&self, handler: Arc<dyn RealtimeHandler>) {
        let name = handler.name().to_string();
        let mut handlers = self.handlers.write().await;
        handlers.clear();
        handlers.push(handler);
        debug!(handler = %name, "Replaced realtime handlers");
    }

    /// Remove all handlers.
    pub async fn clear(&self) {
        self.handlers.write().await.clear();
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Dispatch an event to all handlers, one after another.
    ///
    /// Each call is wrapped in a timeout and a panic guard; failures are
    /// logged and never propagate.
    pub async fn dispatch(&self, event: &RealtimeEvent) {
        let handlers = self.handlers.read().await.clone();

        for handler in handlers {
            let handler_name = handler.name().to_string();

            let result = tokio::time::timeout(
                self.timeout,
                AssertUnwindSafe(handler.handle(event)).catch_unwind(),
            )
            .await;

            match result {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    warn!(
                        handler = %handler_name,
                        event = event.name(),
                        error = %e,
                        "Handler execution failed"
                    );
                }
                Ok(Err(panic)) => {
                    let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "Unknown panic".to_string()
                    };
                    error!(
                        handler = %handler_name,
                        event = event.name(),
                        panic = %panic_msg,
                        "Handler panicked!"
                    );
                }
                Err(_) => {
                    error!(
                        handler = %handler_name,
                        event = event.name(),
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Handler timed out"
                    );
                }
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Handler Dispatcher
// ============================================================================

/// Consumes events from the bus and routes them to the registry.
pub struct HandlerDispatcher {
    registry: Arc<HandlerRegistry>,
}

impl HandlerDispatcher {
    /// Create a new dispatcher.
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// Run the dispatcher until the channel is closed.
    pub async fn run(self, mut receiver: broadcast::Receiver<RealtimeEvent>) {
        info!("Starting realtime handler dispatcher");

        loop {
            match receiver.recv().await {
                Ok(event) => {
                    self.registry.dispatch(&event).await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "Handler dispatcher lagged, missed events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Realtime event channel closed, stopping dispatcher");
                    break;
                }
            }
        }
    }

    /// Get the registry.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }
}

impl std::fmt::Debug for HandlerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDispatcher")
            .field("registry", &self.registry)
            .finish()
    }
}
