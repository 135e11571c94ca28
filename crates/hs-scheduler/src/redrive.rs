//! Re-drive of PENDING requests the queue path could not finish

use std::sync::Arc;

use chrono::Utc;
use hs_common::PendingRequest;
use hs_router::{classify, ErrorKind, HearingDelivery};
use hs_store::PendingRequestRepository;
use metrics::counter;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{SchedulerConfig, SchedulerError};

/// Result of one re-drive attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedriveOutcome {
    /// No eligible row
    Idle,
    Completed,
    /// Outstanding past the exception limit, marked EXCEPTION without a downstream call
    Expired,
    /// Payload cannot be decoded, marked EXCEPTION
    Rejected,
    /// Delivery failed, row back to PENDING with retry + 1
    Retried,
}

impl RedriveOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RedriveOutcome::Idle => "idle",
            RedriveOutcome::Completed => "completed",
            RedriveOutcome::Expired => "expired",
            RedriveOutcome::Rejected => "rejected",
            RedriveOutcome::Retried => "retried",
        }
    }
}

pub struct PendingRequestRedriver {
    config: SchedulerConfig,
    repository: Arc<dyn PendingRequestRepository>,
    delivery: Arc<HearingDelivery>,
}

impl PendingRequestRedriver {
    pub fn new(
        config: SchedulerConfig,
        repository: Arc<dyn PendingRequestRepository>,
        delivery: Arc<HearingDelivery>,
    ) -> Self {
        Self {
            config,
            repository,
            delivery,
        }
    }

    /// Claim the oldest eligible PENDING row and attempt it once
    pub async fn redrive_next(&self) -> Result<RedriveOutcome, SchedulerError> {
        let claimed = self
            .repository
            .claim_oldest_eligible_pending(self.config.pending_wait, &self.config.deployment_id)
            .await?;

        let outcome = match claimed {
            Some(request) => {
                let span = info_span!(
                    "redrive",
                    hearing_id = request.hearing_id,
                    message_type = %request.message_type,
                    pending_request_id = request.id,
                );
                self.attempt(&request).instrument(span).await?
            }
            None => {
                debug!("No pending request eligible for re-drive");
                RedriveOutcome::Idle
            }
        };

        counter!("scheduler.redrive_total", "outcome" => outcome.as_str()).increment(1);
        Ok(outcome)
    }

    async fn attempt(&self, request: &PendingRequest) -> Result<RedriveOutcome, SchedulerError> {
        let deployment_id = self.config.deployment_id.as_str();

        if request.submitted_date_time_period_elapsed(self.config.exception_limit, Utc::now()) {
            warn!(
                submitted = %request.submitted_date_time,
                retry_count = request.retry_count,
                "Pending request exceeded the exception limit, marking EXCEPTION"
            );
            let applied = self.repository.mark_exception(request.id, deployment_id).await?;
            warn_if_not_applied(applied, request, "EXCEPTION");
            return Ok(RedriveOutcome::Expired);
        }

        let delivered = self
            .delivery
            .deliver(request.hearing_id, request.message_type, &request.message)
            .await;

        match delivered {
            Ok(response) => {
                let applied = self.repository.mark_completed(request.id, deployment_id).await?;
                warn_if_not_applied(applied, request, "COMPLETED");
                info!(status = response.status, "Re-driven pending request delivered");
                Ok(RedriveOutcome::Completed)
            }
            Err(e) if classify(&e) == ErrorKind::JsonDecodeError => {
                warn!(error = %e, "Pending request payload is not valid JSON, marking EXCEPTION");
                let applied = self.repository.mark_exception(request.id, deployment_id).await?;
                warn_if_not_applied(applied, request, "EXCEPTION");
                Ok(RedriveOutcome::Rejected)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retry_count = request.retry_count + 1,
                    "Re-drive failed, pending request will be retried"
                );
                let applied = self
                    .repository
                    .mark_pending_with_retry(request.id, deployment_id)
                    .await?;
                warn_if_not_applied(applied, request, "PENDING");
                Ok(RedriveOutcome::Retried)
            }
        }
    }
}

fn warn_if_not_applied(applied: bool, request: &PendingRequest, target: &'static str) {
    if !applied {
        warn!(
            pending_request_id = request.id,
            target_status = target,
            "Pending request left PROCESSING before the re-drive result was recorded"
        );
    }
}
