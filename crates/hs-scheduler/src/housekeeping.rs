//! Escalation, cleanup and stuck-row reclaim

use std::sync::Arc;

use hs_store::PendingRequestRepository;
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::{SchedulerConfig, SchedulerError};

pub struct Housekeeper {
    config: SchedulerConfig,
    repository: Arc<dyn PendingRequestRepository>,
}

impl Housekeeper {
    pub fn new(config: SchedulerConfig, repository: Arc<dyn PendingRequestRepository>) -> Self {
        Self { config, repository }
    }

    /// Flag every unflagged row outstanding past the escalation window.
    /// Each candidate is logged before the flag is set so operators can raise an incident.
    pub async fn escalate(&self) -> Result<u64, SchedulerError> {
        let threshold = self.config.escalation_threshold;
        let candidates = self.repository.find_for_escalation(threshold).await?;
        gauge!("scheduler.escalation_candidates").set(candidates.len() as f64);

        for request in &candidates {
            warn!(
                hearing_id = request.hearing_id,
                pending_request_id = request.id,
                message_type = %request.message_type,
                status = %request.status,
                submitted = %request.submitted_date_time,
                retry_count = request.retry_count,
                "Pending request requires escalation"
            );
        }

        let escalated = self
            .repository
            .mark_for_escalation(threshold, &self.config.deployment_id)
            .await?;
        counter!("scheduler.escalated_total").increment(escalated);

        if escalated > 0 {
            info!(count = escalated, "Escalated pending requests");
        }
        Ok(escalated)
    }

    pub async fn delete_completed(&self) -> Result<u64, SchedulerError> {
        let deleted = self
            .repository
            .delete_completed_older_than(self.config.retention)
            .await?;
        counter!("scheduler.deleted_total").increment(deleted);

        if deleted > 0 {
            info!(
                count = deleted,
                retention_days = self.config.retention.as_secs() / 86_400,
                "Deleted completed pending requests"
            );
        } else {
            debug!("No completed pending requests past retention");
        }
        Ok(deleted)
    }

    /// Return rows abandoned in PROCESSING, e.g. by a crashed worker, to PENDING
    pub async fn reclaim_stuck(&self) -> Result<u64, SchedulerError> {
        let reclaimed = self
            .repository
            .reclaim_stuck_processing(self.config.processing_timeout, &self.config.deployment_id)
            .await?;
        counter!("scheduler.reclaimed_total").increment(reclaimed);
        gauge!("scheduler.last_reclaim_count").set(reclaimed as f64);

        if reclaimed > 0 {
            info!(
                count = reclaimed,
                timeout_mins = self.config.processing_timeout.as_secs() / 60,
                "Reclaimed pending requests stuck in PROCESSING"
            );
        }
        Ok(reclaimed)
    }
}
