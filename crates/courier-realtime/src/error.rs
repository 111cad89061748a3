//! Transport and service error types.

use courier_core::CoreError;

/// Errors raised by a [`Transport`](crate::transport::Transport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("subscribe to '{topic}' failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },

    #[error("broadcast on '{topic}' failed: {reason}")]
    BroadcastFailed { topic: String, reason: String },

    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransportError {
    pub fn subscribe_failed(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SubscribeFailed {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn broadcast_failed(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BroadcastFailed {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error means the underlying connection is gone, as
    /// opposed to a single rejected request.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            Self::NotConnected | Self::ConnectionLost(_) | Self::Pool(_) => true,
            Self::Redis(e) => e.is_connection_dropped() || e.is_io_error() || e.is_timeout(),
            Self::SubscribeFailed { .. } | Self::BroadcastFailed { .. } | Self::Serialization(_) => {
                false
            }
        }
    }
}

impl From<deadpool_redis::PoolError> for TransportError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Self::Pool(e.to_string())
    }
}

/// Errors surfaced by the realtime service.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("invalid realtime configuration: {0}")]
    InvalidConfig(String),

    #[error("realtime service has been destroyed")]
    Destroyed,
}

pub type Result<T> = std::result::Result<T, RealtimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_loss_classification() {
        assert!(TransportError::NotConnected.is_connection_loss());
        assert!(TransportError::ConnectionLost("reset".into()).is_connection_loss());
        assert!(!TransportError::subscribe_failed("thread:t1", "denied").is_connection_loss());
        assert!(!TransportError::broadcast_failed("thread:t1", "too large").is_connection_loss());
    }

    #[test]
    fn test_display() {
        let err = TransportError::subscribe_failed("thread:t1", "denied");
        assert_eq!(err.to_string(), "subscribe to 'thread:t1' failed: denied");

        let err: RealtimeError = TransportError::NotConnected.into();
        assert_eq!(err.to_string(), "transport is not connected");
        assert_eq!(
            RealtimeError::ReconnectExhausted { attempts: 10 }.to_string(),
            "reconnect gave up after 10 attempts"
        );
    }
}
