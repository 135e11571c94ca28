//! Shared downstream delivery path
//!
//! Used by the dispatcher for fresh queue messages and by the scheduler when it
//! re-drives a pending request, so both report outcomes on the egress queue
//! the same way.

use hs_common::{MessageType, SyncResponse};
use hs_queue::QueuePublisher;
use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{HearingApiClient, HearingResponse};
use crate::error::{DispatchError, DownstreamError};

pub struct HearingDelivery {
    client: Arc<dyn HearingApiClient>,
    publisher: Arc<dyn QueuePublisher>,
    timeout: Duration,
}

impl HearingDelivery {
    pub fn new(
        client: Arc<dyn HearingApiClient>,
        publisher: Arc<dyn QueuePublisher>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            publisher,
            timeout,
        }
    }

    /// Decode `payload`, call the operation for `message_type` and publish the sync result.
    pub async fn deliver(
        &self,
        hearing_id: i64,
        message_type: MessageType,
        payload: &str,
    ) -> Result<HearingResponse, DispatchError> {
        let payload: Value = serde_json::from_str(payload).map_err(DispatchError::Payload)?;

        let call = async {
            match message_type {
                MessageType::RequestHearing => self.client.create_hearing(&payload).await,
                MessageType::AmendHearing => self.client.amend_hearing(&payload, hearing_id).await,
                MessageType::DeleteHearing => self.client.delete_hearing(&payload, hearing_id).await,
            }
        };

        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DownstreamError::Timeout(self.timeout)),
        };

        match &result {
            Ok(response) => {
                info!(
                    hearing_id,
                    message_type = %message_type,
                    status = response.status,
                    "Hearing delivered downstream"
                );
                self.publish_sync(hearing_id, SyncResponse::success(response.status))
                    .await;
            }
            Err(e) => {
                if let Some(sync) = e.sync_response() {
                    self.publish_sync(hearing_id, sync).await;
                }
            }
        }

        let outcome = if result.is_ok() { "success" } else { "failure" };
        counter!(
            "delivery.calls_total",
            "message_type" => message_type.as_str(),
            "result" => outcome
        )
        .increment(1);

        result.map_err(DispatchError::from)
    }

    /// The downstream outcome stands even when the egress publish fails
    async fn publish_sync(&self, hearing_id: i64, sync: SyncResponse) {
        let message = match sync.to_message(hearing_id) {
            Ok(message) => message,
            Err(e) => {
                error!(hearing_id, error = %e, "Failed to serialize sync response");
                return;
            }
        };

        match self.publisher.publish(message).await {
            Ok(message_id) => {
                debug!(
                    hearing_id,
                    message_id = %message_id,
                    status = sync.list_assist_http_status,
                    "Published sync response"
                );
            }
            Err(e) => {
                counter!("delivery.sync_publish_failures_total").increment(1);
                error!(
                    hearing_id,
                    queue = %self.publisher.identifier(),
                    error = %e,
                    "Failed to publish sync response"
                );
            }
        }
    }
}
