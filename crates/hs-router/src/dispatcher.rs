//! Message dispatcher
//!
//! Turns one inbound queue message into exactly one [`QueueDisposition`]:
//!
//! 1. Validate the `message_type` / `hearing_id` properties and the JSON body.
//!    Failures here dead-letter without touching the ledger or downstream.
//! 2. Find or create the pending request row and claim it (`PROCESSING`).
//! 3. Deliver through [`HearingDelivery`] and resolve the row.
//! 4. Map any failure to a disposition with the broker delivery count.

use hs_common::{
    MessageType, NewPendingRequest, PendingRequest, PendingRequestStatus, QueueDisposition,
    QueuedMessage, HEARING_ID_PROPERTY, MESSAGE_TYPE_PROPERTY,
};
use hs_store::PendingRequestRepository;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::classifier::{classify, dead_letter_description, ErrorKind};
use crate::delivery::HearingDelivery;
use crate::error::DispatchError;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Deliveries allowed before a retryable failure is dead-lettered
    pub max_delivery_count: u32,
    pub deployment_id: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_delivery_count: 3,
            deployment_id: "local".to_string(),
        }
    }
}

/// What happened to a message that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// Same event already delivered
    Duplicate,
    /// An earlier attempt for the hearing is unresolved; the scheduler re-drives the row
    Deferred,
}

impl DispatchOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Delivered => "delivered",
            DispatchOutcome::Duplicate => "duplicate",
            DispatchOutcome::Deferred => "deferred",
        }
    }
}

/// Parsed routing properties of an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingKey {
    pub message_type: MessageType,
    pub hearing_id: i64,
}

impl RoutingKey {
    pub fn from_message(message: &hs_common::Message) -> Result<Self, DispatchError> {
        let raw_type = message
            .property(MESSAGE_TYPE_PROPERTY)
            .ok_or(DispatchError::MissingProperty(MESSAGE_TYPE_PROPERTY))?;
        let message_type = raw_type
            .trim()
            .parse()
            .map_err(|_| DispatchError::InvalidProperty {
                name: MESSAGE_TYPE_PROPERTY,
                value: raw_type.to_string(),
            })?;

        let raw_id = message
            .property(HEARING_ID_PROPERTY)
            .ok_or(DispatchError::MissingProperty(HEARING_ID_PROPERTY))?;
        let hearing_id = raw_id
            .trim()
            .parse()
            .map_err(|_| DispatchError::InvalidProperty {
                name: HEARING_ID_PROPERTY,
                value: raw_id.to_string(),
            })?;

        Ok(Self {
            message_type,
            hearing_id,
        })
    }
}

enum LedgerEntry {
    Claimable(PendingRequest),
    AlreadyCompleted(PendingRequest),
    InFlight(PendingRequest),
}

pub struct MessageDispatcher {
    repository: Arc<dyn PendingRequestRepository>,
    delivery: Arc<HearingDelivery>,
    config: DispatcherConfig,
}

impl MessageDispatcher {
    pub fn new(
        repository: Arc<dyn PendingRequestRepository>,
        delivery: Arc<HearingDelivery>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            repository,
            delivery,
            config,
        }
    }

    pub async fn dispatch(&self, queued: &QueuedMessage) -> QueueDisposition {
        let result = match self.validate(queued) {
            Ok(key) => {
                let span = info_span!(
                    "dispatch",
                    hearing_id = key.hearing_id,
                    message_type = %key.message_type,
                    delivery_count = queued.delivery_count,
                );
                self.process(queued, key).instrument(span).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(outcome) => {
                counter!("dispatcher.messages_total", "outcome" => outcome.as_str()).increment(1);
                QueueDisposition::Complete
            }
            Err(e) => self.failure_disposition(queued, e),
        }
    }

    fn validate(&self, queued: &QueuedMessage) -> Result<RoutingKey, DispatchError> {
        let key = RoutingKey::from_message(&queued.message)?;
        serde_json::from_str::<serde_json::Value>(&queued.message.body)
            .map_err(DispatchError::Payload)?;
        Ok(key)
    }

    async fn process(
        &self,
        queued: &QueuedMessage,
        key: RoutingKey,
    ) -> Result<DispatchOutcome, DispatchError> {
        let deployment_id = self.config.deployment_id.as_str();

        let request = match self.ledger_entry(queued, key).await? {
            LedgerEntry::Claimable(request) => request,
            LedgerEntry::AlreadyCompleted(request) => {
                info!(
                    hearing_id = key.hearing_id,
                    pending_request_id = request.id,
                    "Event already delivered, completing duplicate"
                );
                return Ok(DispatchOutcome::Duplicate);
            }
            LedgerEntry::InFlight(request) => {
                info!(
                    hearing_id = key.hearing_id,
                    pending_request_id = request.id,
                    "Event is being delivered elsewhere, completing"
                );
                return Ok(DispatchOutcome::Deferred);
            }
        };

        if !self.repository.mark_processing(request.id, deployment_id).await? {
            info!(
                hearing_id = key.hearing_id,
                pending_request_id = request.id,
                "Hearing has an earlier attempt unresolved, leaving request for the scheduler"
            );
            return Ok(DispatchOutcome::Deferred);
        }

        let delivered = self
            .delivery
            .deliver(key.hearing_id, key.message_type, &request.message)
            .await;

        match delivered {
            Ok(_) => {
                if !self.repository.mark_completed(request.id, deployment_id).await? {
                    warn!(
                        pending_request_id = request.id,
                        "Pending request left PROCESSING before completion was recorded"
                    );
                }
                Ok(DispatchOutcome::Delivered)
            }
            Err(e) => {
                self.resolve_failed_attempt(&request, queued.delivery_count, &e)
                    .await;
                Err(e)
            }
        }
    }

    /// Reuse an unresolved row carrying the same event, otherwise create one.
    /// A matching `COMPLETED` row only counts as a duplicate while it is the newest.
    async fn ledger_entry(
        &self,
        queued: &QueuedMessage,
        key: RoutingKey,
    ) -> Result<LedgerEntry, DispatchError> {
        let deployment_id = self.config.deployment_id.as_str();
        let rows = self.repository.find_by_hearing_id_locked(key.hearing_id).await?;
        let same_event = |row: &&PendingRequest| {
            row.message_type == key.message_type && row.message == queued.message.body
        };

        let matched = rows
            .iter()
            .rev()
            .filter(|row| row.status != PendingRequestStatus::Completed)
            .find(same_event)
            .or_else(|| rows.last().filter(same_event))
            .cloned();

        if let Some(existing) = matched {
            debug!(
                hearing_id = key.hearing_id,
                pending_request_id = existing.id,
                status = %existing.status,
                "Found pending request for the same event"
            );
            return match existing.status {
                PendingRequestStatus::Completed => Ok(LedgerEntry::AlreadyCompleted(existing)),
                PendingRequestStatus::Processing => Ok(LedgerEntry::InFlight(existing)),
                PendingRequestStatus::Pending => Ok(LedgerEntry::Claimable(existing)),
                PendingRequestStatus::Exception => {
                    // Operator replay of a dead-lettered message
                    if !self.repository.requeue_exception(existing.id, deployment_id).await? {
                        debug!(pending_request_id = existing.id, "Exception row already re-queued");
                    }
                    Ok(LedgerEntry::Claimable(existing))
                }
            };
        }

        let created = self
            .repository
            .create(NewPendingRequest {
                hearing_id: key.hearing_id,
                message_type: key.message_type,
                message: queued.message.body.clone(),
                deployment_id: deployment_id.to_string(),
            })
            .await?;
        Ok(LedgerEntry::Claimable(created))
    }

    /// Back to PENDING while redelivery is still allowed, otherwise EXCEPTION
    async fn resolve_failed_attempt(
        &self,
        request: &PendingRequest,
        delivery_count: u32,
        error: &DispatchError,
    ) {
        let deployment_id = self.config.deployment_id.as_str();
        let retry = self.will_retry(classify(error), delivery_count);

        let resolved = if retry {
            self.repository
                .mark_pending_with_retry(request.id, deployment_id)
                .await
        } else {
            self.repository.mark_exception(request.id, deployment_id).await
        };

        if let Err(store_error) = resolved {
            error!(
                pending_request_id = request.id,
                error = %store_error,
                "Failed to record failed delivery attempt"
            );
        }
    }

    fn will_retry(&self, kind: ErrorKind, delivery_count: u32) -> bool {
        kind.is_retryable() && delivery_count < self.config.max_delivery_count
    }

    fn failure_disposition(&self, queued: &QueuedMessage, error: DispatchError) -> QueueDisposition {
        let kind = classify(&error);
        counter!("dispatcher.failures_total", "kind" => kind.as_str()).increment(1);

        if self.will_retry(kind, queued.delivery_count) {
            warn!(
                message_id = %queued.message.id,
                delivery_count = queued.delivery_count,
                kind = kind.as_str(),
                error = %error,
                "Dispatch failed, message will be redelivered"
            );
            return QueueDisposition::Retry;
        }

        error!(
            message_id = %queued.message.id,
            delivery_count = queued.delivery_count,
            kind = kind.as_str(),
            error = %error,
            "Dispatch failed, dead-lettering message"
        );
        QueueDisposition::DeadLetter {
            reason: kind.dead_letter_reason().to_string(),
            description: dead_letter_description(&queued.message.body, &error.to_string()),
        }
    }
}
