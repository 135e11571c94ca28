use thiserror::Error;

/// Failures of the inbound and egress queue transports
#[derive(Error, Debug)]
pub enum QueueError {
    #[cfg(feature = "sqlite")]
    #[error("Embedded queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queued payload is not a valid message envelope: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The lease behind a receipt handle expired or was already settled
    #[error("No leased message for receipt {0}")]
    LeaseLost(String),

    #[error("Queue consumer is stopped")]
    Stopped,

    #[cfg(feature = "sqs")]
    #[error("SQS request failed: {0}")]
    Sqs(String),
}
