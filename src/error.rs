//! Storage error taxonomy.

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Shard set is empty")]
    NoShards,

    #[error("Shard key is empty")]
    EmptyShardKey,

    #[error("Shard keys cannot duplicate: key={0}")]
    DuplicateShardKey(String),

    #[error("Connection parameter missing: key={key}, field={field}")]
    MissingConnectionParam { key: String, field: &'static str },

    #[error("Connection not selected")]
    ConnectionNotSelected,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Key is empty")]
    EmptyKey,

    #[error("Invalid {which} key: key is empty")]
    InvalidKey { which: &'static str },

    #[error("Operation is only supported by sharded clients")]
    NotSharded,

    #[error("Transaction already committed or rolled back")]
    TransactionDone,

    #[error("Context cancelled")]
    Cancelled,

    #[error("Context deadline exceeded")]
    DeadlineExceeded,

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Shard task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Admission gate closed")]
    GateClosed,

    #[error("{}", describe_all(.0))]
    Multiple(Vec<StorageError>),
}

impl StorageError {
    /// Whether this error means "no such key/record".
    ///
    /// For `Multiple`, true only when every inner error is a not-found.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::Database(sqlx::Error::RowNotFound) => true,
            StorageError::Multiple(errors) => errors.iter().all(StorageError::is_not_found),
            _ => false,
        }
    }

    /// Inner errors of an aggregate, or this error alone.
    pub fn errors(&self) -> Vec<&StorageError> {
        match self {
            StorageError::Multiple(errors) => errors.iter().collect(),
            other => vec![other],
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound("row".to_string()),
            other => StorageError::Database(other),
        }
    }
}

/// Fold the failures of a "wait for all" barrier into one result.
///
/// No failures is success, one failure is returned as itself, several are
/// wrapped in `Multiple` in the order given.
pub fn collect_errors(mut errors: Vec<StorageError>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(StorageError::Multiple(errors)),
    }
}

fn describe_all(errors: &[StorageError]) -> String {
    let parts: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("{} operations failed: {}", errors.len(), parts.join("; "))
}
