use thiserror::Error;

pub type Result<T> = std::result::Result<T, LockError>;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to connect to Redis at {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("Timed out connecting to Redis at {endpoint}")]
    ConnectionTimeout { endpoint: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("Invalid job config: {reason}")]
    InvalidJob { reason: String },

    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LockError {
    /// True for failures that happen before any connection exists.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionTimeout { .. }
        )
    }
}
