//! The realtime service facade.
//!
//! One constructed object owns the event bus, channel registry, supervisor,
//! presence and typing state. Its lifetime belongs to the caller: build it
//! with [`RealtimeService::new`], call [`start`](RealtimeService::start),
//! and release everything with [`destroy`](RealtimeService::destroy).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use courier_cache::CacheCoordinator;
use courier_core::{
    EventBroadcaster, HandlerDispatcher, HandlerRegistry, RealtimeErrorEvent, RealtimeEvent,
    RealtimeHandler,
};
use tokio::sync::{Notify, broadcast};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelKey, ChannelSpec};
use crate::config::RealtimeConfig;
use crate::dispatcher::EventDispatcher;
use crate::error::{RealtimeError, Result};
use crate::presence::PresenceTracker;
use crate::registry::ChannelRegistry;
use crate::router::ChannelRouter;
use crate::supervisor::{ConnectionState, ConnectionSupervisor, SupervisorSettings};
use crate::transport::Transport;
use crate::typing::{TYPING_EVENT, TypingIndicatorBroker, TypingPayload};

pub struct RealtimeService {
    config: RealtimeConfig,
    transport: Arc<dyn Transport>,
    cache: Option<Arc<CacheCoordinator>>,
    events: Arc<EventBroadcaster>,
    handlers: Arc<HandlerRegistry>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingIndicatorBroker>,
    registry: Arc<ChannelRegistry>,
    supervisor: Arc<ConnectionSupervisor>,
    started: AtomicBool,
    destroyed: AtomicBool,
    shutdown: CancellationToken,
}

impl RealtimeService {
    pub fn new(
        config: RealtimeConfig,
        transport: Arc<dyn Transport>,
        cache: Option<Arc<CacheCoordinator>>,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(RealtimeError::InvalidConfig)?;

        let events = Arc::new(EventBroadcaster::with_capacity(config.event_buffer));
        let handlers = Arc::new(HandlerRegistry::with_timeout(config.handler_timeout()));
        let dispatcher = Arc::new(EventDispatcher::new(cache.clone(), Arc::clone(&events)));
        let presence = Arc::new(PresenceTracker::new(Arc::clone(&events)));
        let typing = Arc::new(TypingIndicatorBroker::new(
            Arc::clone(&events),
            config.typing_idle_timeout(),
        ));

        let router = Arc::new(ChannelRouter::new(
            dispatcher,
            Arc::clone(&presence),
            Arc::clone(&typing),
            Arc::clone(&transport),
            Arc::clone(&events),
        ));

        let connection_lost = Arc::new(Notify::new());
        let registry = Arc::new(ChannelRegistry::new(
            Arc::clone(&transport),
            router,
            Arc::clone(&events),
            Arc::clone(&connection_lost),
        ));

        let shutdown = CancellationToken::new();
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            Arc::clone(&events),
            SupervisorSettings::from_config(&config),
            connection_lost,
            shutdown.child_token(),
        ));

        Ok(Arc::new(Self {
            config,
            transport,
            cache,
            events,
            handlers,
            presence,
            typing,
            registry,
            supervisor,
            started: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            shutdown,
        }))
    }

    /// Start handler delivery, connection supervision and, when an idle
    /// timeout is configured, the typing sweep. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        self.ensure_alive()?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.spawn_handler_dispatcher();
        if let Some(timeout) = self.typing.idle_timeout() {
            self.spawn_typing_sweep(timeout);
        }

        info!(transport = self.transport.name(), "Starting realtime service");
        self.supervisor.start().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event delivery
    // ------------------------------------------------------------------

    /// Replace every registered handler with `handler`.
    pub async fn set_callbacks(&self, handler: Arc<dyn RealtimeHandler>) {
        self.handlers.replace(handler).await;
    }

    /// Register an additional handler alongside the existing ones.
    pub async fn add_handler(&self, handler: Arc<dyn RealtimeHandler>) {
        self.handlers.register(handler).await;
    }

    /// Raw bus receiver, for consumers that prefer a stream over handlers.
    pub fn events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Messages, reactions and read receipts of one thread, plus its typing
    /// broadcasts.
    pub async fn subscribe_to_thread(&self, thread_id: &str, user_id: &str) -> Result<Arc<Channel>> {
        self.typing.set_local_user(thread_id, user_id);
        self.subscribe(ChannelKey::thread(thread_id), Some(user_id)).await
    }

    pub async fn subscribe_to_notifications(&self, user_id: &str) -> Result<Arc<Channel>> {
        self.subscribe(ChannelKey::notifications(user_id), Some(user_id)).await
    }

    pub async fn subscribe_to_user_threads(&self, user_id: &str) -> Result<Arc<Channel>> {
        self.subscribe(ChannelKey::user_threads(user_id), Some(user_id)).await
    }

    /// Join the presence room as `user_id`.
    pub async fn subscribe_to_presence(&self, user_id: &str) -> Result<Arc<Channel>> {
        self.presence.set_local_user(&self.config.presence_room, user_id);
        let key = ChannelKey::presence(self.config.presence_room.as_str());
        self.subscribe(key, Some(user_id)).await
    }

    async fn subscribe(&self, key: ChannelKey, user_id: Option<&str>) -> Result<Arc<Channel>> {
        self.ensure_alive()?;
        let spec = ChannelSpec::for_key(&key, user_id);
        Ok(self.registry.subscribe(key, spec).await)
    }

    pub async fn unsubscribe(&self, key: &ChannelKey) -> Result<bool> {
        self.ensure_alive()?;
        Ok(self.registry.unsubscribe(key).await)
    }

    pub async fn unsubscribe_all(&self) -> Result<usize> {
        self.ensure_alive()?;
        Ok(self.registry.unsubscribe_all().await)
    }

    pub fn channel(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        self.registry.get(key)
    }

    /// Registered channel keys, sorted.
    pub fn channels(&self) -> Vec<ChannelKey> {
        self.registry.keys()
    }

    // ------------------------------------------------------------------
    // Typing and presence
    // ------------------------------------------------------------------

    /// Broadcast a typing signal on `thread_id`. Returns false when the
    /// signal could not be sent; it is dropped, never queued.
    pub async fn send_typing_indicator(&self, thread_id: &str, user_id: &str, is_typing: bool) -> bool {
        if self.is_destroyed() || !self.supervisor.is_connected() {
            debug!(thread_id = %thread_id, "Not connected, typing signal dropped");
            return false;
        }

        let payload = TypingPayload {
            user_id: user_id.to_string(),
            is_typing,
        };
        let payload = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Typing payload did not serialize");
                return false;
            }
        };

        let topic = ChannelKey::thread(thread_id).topic();
        match self.transport.broadcast(&topic, TYPING_EVENT, payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(thread_id = %thread_id, error = %e, "Typing broadcast failed");
                self.events
                    .send_error(RealtimeErrorEvent::transport(e.to_string()).with_channel(topic));
                false
            }
        }
    }

    /// Start applying typing signals received on `thread_id`.
    pub fn listen_to_typing(&self, thread_id: &str) {
        self.typing.listen(thread_id);
    }

    pub fn get_typing_users(&self, thread_id: &str) -> Vec<String> {
        self.typing.typing_users(thread_id)
    }

    /// Peers online in the presence room, excluding the local user.
    pub fn get_online_users(&self) -> Vec<String> {
        self.presence.online_users(&self.config.presence_room)
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    pub fn get_connection_status(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    /// Re-enter the reconnect loop, including from the terminal failed state.
    pub fn reconnect(&self) -> Result<()> {
        self.ensure_alive()?;
        self.supervisor.reconnect_now();
        Ok(())
    }

    pub fn cache(&self) -> Option<&Arc<CacheCoordinator>> {
        self.cache.as_ref()
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Tear down every channel, stop all timers, clear in-memory state and
    /// close the transport and cache. Later calls fail with
    /// [`RealtimeError::Destroyed`].
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let closed = self.registry.unsubscribe_all().await;
        self.shutdown.cancel();
        self.supervisor.shutdown();
        self.transport.disconnect().await;

        self.handlers.clear().await;
        self.presence.clear();
        self.typing.clear();
        if let Some(cache) = &self.cache {
            cache.close();
        }

        info!(channels = closed, "Realtime service destroyed");
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(RealtimeError::Destroyed);
        }
        Ok(())
    }

    fn spawn_handler_dispatcher(&self) {
        let dispatcher = HandlerDispatcher::new(Arc::clone(&self.handlers));
        let receiver = self.events.subscribe();
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("Handler dispatcher cancelled"),
                _ = dispatcher.run(receiver) => {}
            }
        });
    }

    fn spawn_typing_sweep(&self, timeout: std::time::Duration) {
        let typing = Arc::clone(&self.typing);
        let token = self.shutdown.child_token();
        // Sweep at half the timeout so a silent typist lingers at most 1.5x
        let period = (timeout / 2).max(std::time::Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        typing.prune_idle();
                    }
                }
            }
        });
    }
}

impl Drop for RealtimeService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for RealtimeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeService")
            .field("transport", &self.transport.name())
            .field("supervisor", &self.supervisor)
            .field("channels", &self.registry.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
