use async_trait::async_trait;
use hs_common::{Message, QueueDisposition, QueuedMessage};

pub mod error;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Queue metrics for monitoring
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    /// Approximate number of messages visible in the queue (pending)
    pub pending_messages: u64,
    /// Approximate number of messages currently leased to a consumer
    pub in_flight_messages: u64,
    /// Messages moved to the dead-letter store
    pub dead_lettered_messages: u64,
    pub queue_identifier: String,
}

/// Trait for consuming messages from a queue
///
/// The broker leases each message to one consumer at a time; a message that is
/// neither completed nor dead-lettered becomes visible again and is redelivered
/// with an incremented delivery count.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Get the unique identifier for this consumer
    fn identifier(&self) -> &str;

    /// Poll for messages from the queue
    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedMessage>>;

    /// Remove a message from the queue
    async fn complete(&self, receipt_handle: &str) -> Result<()>;

    /// Release the lease so the message is redelivered after `delay_seconds`
    async fn abandon(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()>;

    /// Move a message to the dead-letter queue with an operator-facing reason
    async fn dead_letter(&self, message: &QueuedMessage, reason: &str, description: &str) -> Result<()>;

    /// Apply a dispatcher disposition
    async fn settle(&self, message: &QueuedMessage, disposition: &QueueDisposition) -> Result<()> {
        match disposition {
            QueueDisposition::Complete => self.complete(&message.receipt_handle).await,
            QueueDisposition::Retry => self.abandon(&message.receipt_handle, None).await,
            QueueDisposition::DeadLetter { reason, description } => {
                self.dead_letter(message, reason, description).await
            }
        }
    }

    fn is_healthy(&self) -> bool;

    async fn stop(&self);

    /// Returns None if metrics are not available for this queue type
    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        Ok(None)
    }
}

/// Trait for publishing messages to a queue
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    fn identifier(&self) -> &str;

    /// Publish a single message, returning the broker's message id
    async fn publish(&self, message: Message) -> Result<String>;
}

/// Combined consumer and publisher for embedded/dev mode
#[async_trait]
pub trait EmbeddedQueue: QueueConsumer + QueuePublisher {
    /// Initialize the queue schema (create tables, etc.)
    async fn init_schema(&self) -> Result<()>;
}
