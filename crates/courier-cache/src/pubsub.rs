//! Redis Pub/Sub for cross-instance local-tier invalidation.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::local::LocalTier;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Channel invalidations are published on for a key prefix.
pub fn invalidation_channel(prefix: &str) -> String {
    format!("{prefix}:cache:invalidate")
}

/// Payload carried on the invalidation channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationMessage {
    /// Drop exactly this key
    Key(String),
    /// Drop every key containing this substring
    Pattern(String),
}

impl InvalidationMessage {
    pub fn encode(&self) -> String {
        match self {
            InvalidationMessage::Key(k) => format!("key:{k}"),
            InvalidationMessage::Pattern(p) => format!("pattern:{p}"),
        }
    }

    /// Bare payloads without a tag are treated as keys.
    pub fn decode(payload: &str) -> Self {
        if let Some(p) = payload.strip_prefix("pattern:") {
            InvalidationMessage::Pattern(p.to_string())
        } else if let Some(k) = payload.strip_prefix("key:") {
            InvalidationMessage::Key(k.to_string())
        } else {
            InvalidationMessage::Key(payload.to_string())
        }
    }

    /// Apply to a local tier, returning how many entries were dropped.
    pub fn apply(&self, local: &LocalTier) -> usize {
        match self {
            InvalidationMessage::Key(k) => usize::from(local.remove(k)),
            InvalidationMessage::Pattern(p) => local.remove_matching(p),
        }
    }
}

/// Cache invalidation listener that subscribes to Redis Pub/Sub.
///
/// ## How It Works
///
/// 1. Subscribe to `{prefix}:cache:invalidate`
/// 2. Apply each received key or pattern to the local tier
/// 3. Reconnect with exponential backoff if the connection is lost
///
/// ```text
/// Instance 1: coordinator.delete(Message, "m1")
///   ↓
/// Redis Pub/Sub: PUBLISH courier:cache:invalidate "key:message:m1"
///   ↓
/// Instance 2: Listener receives → removes "message:m1" from its local tier
/// ```
pub struct InvalidationListener {
    pub redis_url: String,
    pub channel: String,
    pub local: Arc<LocalTier>,
}

impl InvalidationListener {
    pub fn new(redis_url: impl Into<String>, prefix: &str, local: Arc<LocalTier>) -> Self {
        Self {
            redis_url: redis_url.into(),
            channel: invalidation_channel(prefix),
            local,
        }
    }

    /// Spawn the listener loop; it stops when `shutdown` is cancelled.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;

            loop {
                let result = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = self.run() => result,
                };

                match result {
                    Ok(()) => {
                        backoff = INITIAL_BACKOFF;
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Cache invalidation listener error, reconnecting..."
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
            tracing::debug!(channel = %self.channel, "Cache invalidation listener stopped");
        })
    }

    async fn run(&self) -> Result<(), String> {
        // Pub/sub needs a dedicated connection, not a pooled one
        let client = redis::Client::open(self.redis_url.clone())
            .map_err(|e| format!("failed to create Redis client: {e}"))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| format!("failed to get pub/sub connection: {e}"))?;

        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| format!("failed to subscribe: {e}"))?;

        tracing::info!(channel = %self.channel, "Subscribed to cache invalidation channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            match msg.get_payload::<String>() {
                Ok(payload) => {
                    let message = InvalidationMessage::decode(&payload);
                    let dropped = message.apply(&self.local);
                    tracing::debug!(payload = %payload, dropped, "received cache invalidation");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to parse invalidation message payload");
                }
            }
        }
        Err("pub/sub connection closed".to_string())
    }
}
