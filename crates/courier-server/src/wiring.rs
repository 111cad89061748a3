//! Assemble cache, transport and service from an [`AppConfig`].

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use courier_cache::create_cache_coordinator;
use courier_core::{
    ConnectionChange, HandlerError, PresenceEvent, RealtimeErrorEvent, RealtimeEvent,
    RealtimeHandler,
};
use courier_realtime::{MemoryTransport, RealtimeService, RedisTransportBuilder, Transport};

use crate::config::AppConfig;

/// Build the realtime service. Redis backs both the shared cache tier and
/// the transport when enabled; otherwise everything stays in-process.
pub async fn build_service(cfg: &AppConfig) -> anyhow::Result<Arc<RealtimeService>> {
    let cache = Arc::new(create_cache_coordinator(&cfg.cache, &cfg.redis).await);

    let transport: Arc<dyn Transport> = if cfg.redis.enabled {
        let pool = cfg
            .redis
            .create_pool()
            .map_err(|e| anyhow::anyhow!(e))
            .context("creating Redis pool for transport")?;
        let transport = RedisTransportBuilder::new()
            .with_pool(pool)
            .with_redis_url(cfg.redis.url.clone())
            .with_prefix(cfg.redis.key_prefix.clone())
            .build()
            .context("building Redis transport")?;
        tracing::info!(instance_id = %transport.instance_id(), "Using Redis transport");
        Arc::new(transport)
    } else {
        tracing::info!("Redis disabled, using in-process transport");
        Arc::new(MemoryTransport::new())
    };

    let service = RealtimeService::new(cfg.realtime.clone(), transport, Some(cache))
        .context("creating realtime service")?;
    Ok(service)
}

/// Logs connection changes, presence and errors from the bus.
#[derive(Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl RealtimeHandler for LoggingHandler {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_user_online(&self, event: &PresenceEvent) -> Result<(), HandlerError> {
        tracing::debug!(user_id = %event.user_id, online = event.is_online, "Presence changed");
        Ok(())
    }

    async fn on_connection_change(&self, change: ConnectionChange) -> Result<(), HandlerError> {
        match change {
            ConnectionChange::Connected => tracing::info!("Realtime connection up"),
            ConnectionChange::Disconnected => tracing::warn!("Realtime connection down"),
        }
        Ok(())
    }

    async fn on_error(&self, error: &RealtimeErrorEvent) -> Result<(), HandlerError> {
        if error.terminal {
            tracing::error!(source = ?error.source, message = %error.message, "Realtime gave up");
        } else {
            tracing::warn!(
                source = ?error.source,
                channel = error.channel.as_deref().unwrap_or("-"),
                message = %error.message,
                "Realtime error"
            );
        }
        Ok(())
    }

    async fn handle(&self, event: &RealtimeEvent) -> Result<(), HandlerError> {
        tracing::trace!(event = event.name(), "Realtime event");
        match event {
            RealtimeEvent::UserOnline(e) => self.on_user_online(e).await,
            RealtimeEvent::ConnectionChanged(c) => self.on_connection_change(*c).await,
            RealtimeEvent::Error(e) => self.on_error(e).await,
            _ => Ok(()),
        }
    }
}
