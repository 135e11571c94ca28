//! Pending Request Repository Trait
//!
//! The retry ledger behind the dispatcher and the scheduler. Every status
//! transition is a conditional update that reports whether it applied, so
//! concurrent workers coordinate through the database alone.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hs_common::{MessageType, NewPendingRequest, PendingRequest, PendingRequestStatus};
use std::time::Duration;

use crate::error::{Result, StoreError};

/// Column list shared by every query that returns whole rows
pub(crate) const PENDING_REQUEST_COLUMNS: &str = "id, hearing_id, message_type, version_number, message, status, \
     submitted_date_time, last_tried_date_time, retry_count, incident_flag, deployment_id";

#[async_trait]
pub trait PendingRequestRepository: Send + Sync {
    /// Create the table and indexes if they do not exist
    async fn init_schema(&self) -> Result<()>;

    /// Insert a new `PENDING` row with the next version number for its hearing
    async fn create(&self, request: NewPendingRequest) -> Result<PendingRequest>;

    /// Atomically move the oldest eligible `PENDING` row to `PROCESSING`.
    ///
    /// Eligible means `last_tried_date_time` is null or older than
    /// `pending_wait`, no other row of the same hearing is `PROCESSING`, and no
    /// older version of the hearing is still `PENDING`.
    async fn claim_oldest_eligible_pending(
        &self,
        pending_wait: Duration,
        deployment_id: &str,
    ) -> Result<Option<PendingRequest>>;

    /// `PENDING -> PROCESSING`, refused while the hearing has a `PROCESSING` row
    /// or an older `PENDING` version
    async fn mark_processing(&self, id: i64, deployment_id: &str) -> Result<bool>;

    /// `PROCESSING -> COMPLETED`
    async fn mark_completed(&self, id: i64, deployment_id: &str) -> Result<bool>;

    /// `PROCESSING -> EXCEPTION`
    async fn mark_exception(&self, id: i64, deployment_id: &str) -> Result<bool>;

    /// `PROCESSING -> PENDING` with `retry_count + 1`
    async fn mark_pending_with_retry(&self, id: i64, deployment_id: &str) -> Result<bool>;

    /// `EXCEPTION -> PENDING`
    async fn requeue_exception(&self, id: i64, deployment_id: &str) -> Result<bool>;

    async fn find_by_id(&self, id: i64) -> Result<Option<PendingRequest>>;

    /// Highest version row for the hearing
    async fn find_latest_by_hearing_id(&self, hearing_id: i64) -> Result<Option<PendingRequest>>;

    /// All rows of a hearing ordered by version, read under a row lock where the backend has one
    async fn find_by_hearing_id_locked(&self, hearing_id: i64) -> Result<Vec<PendingRequest>>;

    /// Unflagged rows submitted more than `threshold` ago
    async fn find_for_escalation(&self, threshold: Duration) -> Result<Vec<PendingRequest>>;

    /// Set `incident_flag` on every unflagged row submitted more than `threshold` ago
    async fn mark_for_escalation(&self, threshold: Duration, deployment_id: &str) -> Result<u64>;

    /// Delete `COMPLETED` rows submitted at least `threshold` ago
    async fn delete_completed_older_than(&self, threshold: Duration) -> Result<u64>;

    /// Return rows stuck in `PROCESSING` for longer than `timeout` to `PENDING`
    async fn reclaim_stuck_processing(&self, timeout: Duration, deployment_id: &str) -> Result<u64>;
}

/// Epoch millis of `now - age`, saturating for ages that overflow
pub(crate) fn cutoff_millis(now: DateTime<Utc>, age: Duration) -> i64 {
    let age_ms = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_sub(age_ms)
}

/// Column values as read from either backend
pub(crate) struct RawPendingRequest {
    pub id: i64,
    pub hearing_id: i64,
    pub message_type: String,
    pub version_number: i32,
    pub message: String,
    pub status: String,
    pub submitted_date_time: i64,
    pub last_tried_date_time: Option<i64>,
    pub retry_count: i32,
    pub incident_flag: bool,
    pub deployment_id: Option<String>,
}

impl TryFrom<RawPendingRequest> for PendingRequest {
    type Error = StoreError;

    fn try_from(raw: RawPendingRequest) -> Result<Self> {
        let id = raw.id;
        let corrupt = move |reason: String| StoreError::CorruptRow { id, reason };

        let message_type: MessageType = raw
            .message_type
            .parse()
            .map_err(|e: hs_common::ParseEnumError| corrupt(e.to_string()))?;
        let status: PendingRequestStatus = raw
            .status
            .parse()
            .map_err(|e: hs_common::ParseEnumError| corrupt(e.to_string()))?;
        let submitted_date_time = DateTime::from_timestamp_millis(raw.submitted_date_time)
            .ok_or_else(|| corrupt("invalid submitted_date_time".to_string()))?;
        let last_tried_date_time = match raw.last_tried_date_time {
            Some(ts) => Some(
                DateTime::from_timestamp_millis(ts)
                    .ok_or_else(|| corrupt("invalid last_tried_date_time".to_string()))?,
            ),
            None => None,
        };

        Ok(PendingRequest {
            id: raw.id,
            hearing_id: raw.hearing_id,
            message_type,
            version_number: raw.version_number,
            message: raw.message,
            status,
            submitted_date_time,
            last_tried_date_time,
            retry_count: raw.retry_count,
            incident_flag: raw.incident_flag,
            deployment_id: raw.deployment_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(status: &str) -> RawPendingRequest {
        RawPendingRequest {
            id: 7,
            hearing_id: 2000000001,
            message_type: "AMEND_HEARING".to_string(),
            version_number: 2,
            message: "{}".to_string(),
            status: status.to_string(),
            submitted_date_time: 1_700_000_000_000,
            last_tried_date_time: None,
            retry_count: 1,
            incident_flag: false,
            deployment_id: Some("local".to_string()),
        }
    }

    #[test]
    fn test_raw_row_conversion() {
        let request = PendingRequest::try_from(raw("EXCEPTION")).unwrap();
        assert_eq!(request.message_type, MessageType::AmendHearing);
        assert_eq!(request.status, PendingRequestStatus::Exception);
        assert_eq!(request.submitted_date_time.timestamp_millis(), 1_700_000_000_000);
        assert!(request.last_tried_date_time.is_none());
    }

    #[test]
    fn test_unknown_status_is_corrupt() {
        let err = PendingRequest::try_from(raw("RETRYING")).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRow { id: 7, .. }));
    }

    #[test]
    fn test_cutoff_saturates() {
        let now = Utc::now();
        assert_eq!(
            cutoff_millis(now, Duration::from_secs(60)),
            now.timestamp_millis() - 60_000
        );
        assert!(cutoff_millis(now, Duration::MAX) < 0);
    }
}
