//! Error types for key pool operations

/// Errors from pool and queue operations.
///
/// Exhaustion (every key rate limited or expired) is not an error; the pool
/// reports it as `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key pool is empty")]
    EmptyPool,

    #[error("store error: {0}")]
    Store(String),

    #[error("corrupt key record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },

    #[error("serialization error: {0}")]
    Serialize(String),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Store(err.to_string())
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
