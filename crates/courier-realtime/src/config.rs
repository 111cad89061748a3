//! Realtime service settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timers, backoff and bus sizing for the realtime service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// How often a heartbeat is sent while connected
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How often transport health is checked
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// First reconnect delay; doubles per attempt
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Upper bound for a single reconnect delay
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Attempts before giving up until an explicit reconnect
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Room used by `subscribe_to_presence`
    #[serde(default = "default_presence_room")]
    pub presence_room: String,

    /// Drop typists silent for this long. Unset keeps them until an
    /// explicit stop.
    #[serde(default)]
    pub typing_idle_timeout_ms: Option<u64>,

    /// Event bus capacity
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Per-handler execution timeout
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_monitor_interval_ms() -> u64 {
    5_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_presence_room() -> String {
    "online_users".to_string()
}

fn default_event_buffer() -> usize {
    1024
}

fn default_handler_timeout_ms() -> u64 {
    5_000
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            presence_room: default_presence_room(),
            typing_idle_timeout_ms: None,
            event_buffer: default_event_buffer(),
            handler_timeout_ms: default_handler_timeout_ms(),
        }
    }
}

impl RealtimeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn typing_idle_timeout(&self) -> Option<Duration> {
        self.typing_idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval_ms == 0 {
            return Err("realtime.heartbeat_interval_ms must be > 0".into());
        }
        if self.monitor_interval_ms == 0 {
            return Err("realtime.monitor_interval_ms must be > 0".into());
        }
        if self.reconnect_base_delay_ms == 0 {
            return Err("realtime.reconnect_base_delay_ms must be > 0".into());
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(
                "realtime.reconnect_max_delay_ms must be >= reconnect_base_delay_ms".into(),
            );
        }
        if self.presence_room.trim().is_empty() {
            return Err("realtime.presence_room must not be empty".into());
        }
        if self.event_buffer == 0 {
            return Err("realtime.event_buffer must be > 0".into());
        }
        if self.typing_idle_timeout_ms == Some(0) {
            return Err("realtime.typing_idle_timeout_ms must be > 0 when set".into());
        }
        Ok(())
    }
}
