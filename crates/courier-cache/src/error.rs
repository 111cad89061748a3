use thiserror::Error;

/// Errors from the shared cache tier and payload codec.
///
/// None of these reach callers of [`crate::CacheCoordinator`]; they are
/// logged and swallowed there.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Shared tier unavailable: {0}")]
    Unavailable(String),
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        CacheError::Pool(e.to_string())
    }
}
