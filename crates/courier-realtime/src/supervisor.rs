//! Connection health: heartbeat, staleness detection and reconnection.
//!
//! ## State Machine
//!
//! ```text
//! Disconnected → Connecting → Connected → Stale ─┐
//!                                 │              ↓
//!                                 └──────→ Reconnecting → Connected
//!                                                 │
//!                                                 └→ Failed (after the attempt cap)
//! ```
//!
//! Two timers run while the supervisor is started: the heartbeat stamps
//! `last_heartbeat_at` whenever a round trip succeeds, and the monitor
//! checks transport health and heartbeat age. A channel subscribe failing
//! with a connection error wakes the monitor early.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use courier_core::{ConnectionChange, ErrorSource, EventBroadcaster, RealtimeErrorEvent};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RealtimeConfig;
use crate::registry::ChannelRegistry;
use crate::transport::Transport;

/// Delay before reconnect attempt `attempt` (1-based):
/// `min(base * 2^(attempt-1), max)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    /// No heartbeat within twice the interval
    Stale,
    Reconnecting,
    /// Attempt cap reached; waits for an explicit reconnect
    Failed,
}

impl ConnectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Stale => "stale",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot returned to health-check callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub is_connected: bool,
    pub reconnect_attempts: u32,
    pub last_heartbeat_at: Option<Instant>,
    pub active_channel_count: usize,
}

/// Supervisor timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub heartbeat_interval: Duration,
    pub monitor_interval: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl SupervisorSettings {
    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            monitor_interval: config.monitor_interval(),
            base_delay: config.reconnect_base_delay(),
            max_delay: config.reconnect_max_delay(),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Heartbeat age beyond which the connection counts as stale.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(2)
    }
}

struct Inner {
    phase: ConnectionPhase,
    attempts: u32,
    last_heartbeat_at: Option<Instant>,
}

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    registry: Arc<ChannelRegistry>,
    events: Arc<EventBroadcaster>,
    settings: SupervisorSettings,
    inner: Mutex<Inner>,
    phase_tx: watch::Sender<ConnectionPhase>,
    reconnecting: AtomicBool,
    connection_lost: Arc<Notify>,
    shutdown: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<ChannelRegistry>,
        events: Arc<EventBroadcaster>,
        settings: SupervisorSettings,
        connection_lost: Arc<Notify>,
        shutdown: CancellationToken,
    ) -> Self {
        let (phase_tx, _) = watch::channel(ConnectionPhase::Disconnected);
        Self {
            transport,
            registry,
            events,
            settings,
            inner: Mutex::new(Inner {
                phase: ConnectionPhase::Disconnected,
                attempts: 0,
                last_heartbeat_at: None,
            }),
            phase_tx,
            reconnecting: AtomicBool::new(false),
            connection_lost,
            shutdown,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    /// Watch phase transitions.
    pub fn watch(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        let inner = self.inner.lock();
        ConnectionState {
            phase: inner.phase,
            is_connected: inner.phase == ConnectionPhase::Connected,
            reconnect_attempts: inner.attempts,
            last_heartbeat_at: inner.last_heartbeat_at,
            active_channel_count: self.registry.active_count(),
        }
    }

    /// Connect and start the heartbeat and monitor timers. A failed
    /// initial connect goes straight into the reconnect loop.
    pub async fn start(self: &Arc<Self>) {
        self.spawn_heartbeat();
        self.spawn_monitor();

        self.set_phase(ConnectionPhase::Connecting);
        match self.transport.connect().await {
            Ok(()) => {
                if !self.on_connected().await {
                    self.begin_reconnect();
                }
            }
            Err(e) => {
                warn!(transport = self.transport.name(), error = %e, "Initial connect failed");
                self.set_phase(ConnectionPhase::Disconnected);
                self.events.send_error(RealtimeErrorEvent::transport(e.to_string()));
                self.begin_reconnect();
            }
        }
    }

    /// Explicit reconnect trigger, e.g. when the app returns to the
    /// foreground. Resets the attempt counter.
    pub fn reconnect_now(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.inner.lock().attempts = 0;
        info!("Reconnect requested");
        self.begin_reconnect();
    }

    /// Stop timers and any reconnect in flight.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.set_phase(ConnectionPhase::Disconnected);
    }

    /// One monitor pass. Returns true if a reconnect was started.
    pub fn check(self: &Arc<Self>) -> bool {
        let (phase, last_heartbeat_at) = {
            let inner = self.inner.lock();
            (inner.phase, inner.last_heartbeat_at)
        };
        if phase != ConnectionPhase::Connected {
            return false;
        }

        if !self.transport.is_healthy() {
            warn!(transport = self.transport.name(), "Transport unhealthy");
            self.mark_lost(ConnectionPhase::Disconnected);
            self.begin_reconnect();
            return true;
        }

        let stale = last_heartbeat_at
            .is_none_or(|at| at.elapsed() > self.settings.stale_after());
        if stale {
            warn!(
                stale_after_ms = self.settings.stale_after().as_millis() as u64,
                "No heartbeat landed, treating connection as stale"
            );
            self.mark_lost(ConnectionPhase::Stale);
            self.begin_reconnect();
            return true;
        }
        false
    }

    /// Stamp a heartbeat if the round trip succeeds.
    pub async fn heartbeat(&self) -> bool {
        if self.phase() != ConnectionPhase::Connected {
            return false;
        }
        match self.transport.heartbeat().await {
            Ok(()) => {
                self.inner.lock().last_heartbeat_at = Some(Instant::now());
                true
            }
            Err(e) => {
                debug!(error = %e, "Heartbeat failed");
                false
            }
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.settings.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        this.heartbeat().await;
                    }
                }
            }
            debug!("Heartbeat timer stopped");
        });
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let token = self.shutdown.child_token();
        let lost = Arc::clone(&self.connection_lost);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.settings.monitor_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        this.check();
                    }
                    _ = lost.notified() => {
                        // Permits stored before a reconnect are stale
                        if this.phase() == ConnectionPhase::Connected && !this.transport.is_healthy() {
                            warn!("Channel reported connection loss");
                            this.mark_lost(ConnectionPhase::Disconnected);
                            this.begin_reconnect();
                        }
                    }
                }
            }
            debug!("Connection monitor stopped");
        });
    }

    fn mark_lost(&self, phase: ConnectionPhase) {
        self.set_phase(phase);
        self.events.send_connection(ConnectionChange::Disconnected);
    }

    /// Returns false if the connection dropped again while channels were
    /// being re-opened; the attempt counter is only reset on success.
    async fn on_connected(&self) -> bool {
        self.inner.lock().last_heartbeat_at = Some(Instant::now());
        self.set_phase(ConnectionPhase::Connected);
        info!(transport = self.transport.name(), "Connected");
        self.registry.resubscribe_all().await;

        if !self.transport.is_healthy() {
            warn!(transport = self.transport.name(), "Connection lost while resubscribing");
            if self.phase() == ConnectionPhase::Connected {
                self.mark_lost(ConnectionPhase::Disconnected);
            }
            return false;
        }
        if self.phase() != ConnectionPhase::Connected {
            return false;
        }

        self.inner.lock().attempts = 0;
        self.events.send_connection(ConnectionChange::Connected);
        true
    }

    /// Whether the phase calls for a reconnect loop to be running.
    fn needs_reconnect(&self) -> bool {
        !self.shutdown.is_cancelled()
            && matches!(
                self.phase(),
                ConnectionPhase::Disconnected | ConnectionPhase::Stale
            )
    }

    /// Start the reconnect loop unless one is already running.
    fn begin_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                this.reconnect_loop(&token).await;
                this.reconnecting.store(false, Ordering::Release);
                // A loss reported after the loop's last check found the flag set
                if !this.needs_reconnect() || this.reconnecting.swap(true, Ordering::AcqRel) {
                    break;
                }
                debug!("Connection lost again, restarting reconnect loop");
            }
        });
    }

    async fn reconnect_loop(&self, token: &CancellationToken) {
        loop {
            let attempt = {
                let mut inner = self.inner.lock();
                if inner.attempts >= self.settings.max_attempts {
                    None
                } else {
                    inner.attempts += 1;
                    Some(inner.attempts)
                }
            };

            let Some(attempt) = attempt else {
                let attempts = self.settings.max_attempts;
                error!(attempts, "Reconnect attempts exhausted");
                self.set_phase(ConnectionPhase::Failed);
                self.events.send_error(
                    RealtimeErrorEvent::new(
                        ErrorSource::Reconnect,
                        format!("reconnect gave up after {attempts} attempts"),
                    )
                    .terminal(),
                );
                return;
            };

            let delay = backoff_delay(attempt, self.settings.base_delay, self.settings.max_delay);
            self.set_phase(ConnectionPhase::Reconnecting);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if let Err(e) = self.transport.connect().await {
                warn!(attempt, error = %e, "Reconnect attempt failed");
                continue;
            }
            if self.on_connected().await {
                info!(attempt, "Reconnected");
                return;
            }
            if token.is_cancelled() {
                return;
            }
            warn!(attempt, "Reconnect attempt lost the connection again");
        }
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        let previous = std::mem::replace(&mut self.inner.lock().phase, phase);
        if previous != phase {
            debug!(from = %previous, to = %phase, "Connection phase changed");
            self.phase_tx.send_replace(phase);
        }
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("phase", &self.phase())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
