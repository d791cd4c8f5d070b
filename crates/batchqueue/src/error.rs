//! Error types for the batch orchestration crate.

use thiserror::Error;

/// Result type alias for batch operations
pub type Result<T> = std::result::Result<T, BatchQueueError>;

/// Error taxonomy for batch construction, storage and processing
#[derive(Error, Debug)]
pub enum BatchQueueError {
    /// Unknown job class, malformed job shape, or compensation on a parallel batch
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Dispatch attempted with zero jobs
    #[error("batch contains no jobs")]
    EmptyBatch,

    /// Lookup or append referencing a deleted or unknown batch
    #[error("batch not found: {batch_id}")]
    BatchNotFound { batch_id: String },

    /// Append to a batch that already reached a terminal status
    #[error("batch is closed: {batch_id}")]
    BatchClosed { batch_id: String },

    /// Callback given with an unknown class or a non-serializable shape
    #[error("invalid callback: {0}")]
    InvalidCallback(String),

    /// Storage backend failure outside of a driver error
    #[error("storage error: {0}")]
    Storage(String),

    /// SQL backend failure
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis backend failure
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Payload, context or envelope (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Queue transport failure
    #[error("queue error: {0}")]
    Queue(String),

    /// A user job raised during execution
    #[error("job execution failed: {0}")]
    JobExecution(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl BatchQueueError {
    /// Shorthand for a job execution failure
    pub fn execution(message: impl Into<String>) -> Self {
        BatchQueueError::JobExecution(message.into())
    }

    /// Shorthand for a storage failure that has no driver error attached
    pub fn storage(message: impl Into<String>) -> Self {
        BatchQueueError::Storage(message.into())
    }

    /// Check if the error is transient and worth a redelivery
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BatchQueueError::Storage(_)
                | BatchQueueError::Database(_)
                | BatchQueueError::Redis(_)
                | BatchQueueError::Queue(_)
        )
    }

    /// Check if the error is permanent (not retryable)
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }
}
