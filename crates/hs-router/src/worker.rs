use hs_queue::{QueueConsumer, QueueError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::dispatcher::MessageDispatcher;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: u32,
    /// Sleep between polls that returned nothing
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Polls the inbound queue and settles each message with the dispatcher's disposition
pub struct QueueWorker {
    name: String,
    consumer: Arc<dyn QueueConsumer>,
    dispatcher: Arc<MessageDispatcher>,
    config: WorkerConfig,
}

impl QueueWorker {
    pub fn new(
        name: impl Into<String>,
        consumer: Arc<dyn QueueConsumer>,
        dispatcher: Arc<MessageDispatcher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            consumer,
            dispatcher,
            config,
        }
    }

    /// Poll once and settle everything received, returning the number of messages handled
    pub async fn run_once(&self) -> Result<usize, QueueError> {
        let messages = self.consumer.poll(self.config.batch_size).await?;

        for queued in &messages {
            let disposition = self.dispatcher.dispatch(queued).await;
            debug!(
                worker = %self.name,
                message_id = %queued.message.id,
                delivery_count = queued.delivery_count,
                ?disposition,
                "Settling message"
            );

            if let Err(e) = self.consumer.settle(queued, &disposition).await {
                // The lease expires and the broker redelivers
                error!(
                    worker = %self.name,
                    message_id = %queued.message.id,
                    error = %e,
                    "Failed to settle message"
                );
            }
        }

        Ok(messages.len())
    }

    /// Runs until shutdown. Shutdown is observed between polls, so a batch in
    /// progress is always dispatched and settled.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            worker = %self.name,
            queue = %self.consumer.identifier(),
            "Queue worker started"
        );

        loop {
            if shutdown_requested(&mut shutdown) {
                break;
            }

            let idle = match self.run_once().await {
                Ok(handled) => handled == 0,
                Err(QueueError::Stopped) => break,
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "Queue poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(worker = %self.name, "Queue worker stopped");
    }
}

/// A dropped sender or a lagged receiver counts as shutdown too
fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}
