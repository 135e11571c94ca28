//! SQLite Pending Request Repository
//!
//! Timestamps are stored as epoch milliseconds. SQLite serializes writers, so
//! the single-statement claim and the conditional transitions are atomic
//! without explicit locking.

use async_trait::async_trait;
use chrono::Utc;
use hs_common::{NewPendingRequest, PendingRequest};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{is_unique_violation, Result};
use crate::repository::{cutoff_millis, PendingRequestRepository, RawPendingRequest, PENDING_REQUEST_COLUMNS};

pub struct SqlitePendingRequestRepository {
    pool: SqlitePool,
}

impl SqlitePendingRequestRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn parse_row(row: &SqliteRow) -> Result<PendingRequest> {
        PendingRequest::try_from(RawPendingRequest {
            id: row.try_get("id")?,
            hearing_id: row.try_get("hearing_id")?,
            message_type: row.try_get("message_type")?,
            version_number: row.try_get("version_number")?,
            message: row.try_get("message")?,
            status: row.try_get("status")?,
            submitted_date_time: row.try_get("submitted_date_time")?,
            last_tried_date_time: row.try_get("last_tried_date_time")?,
            retry_count: row.try_get("retry_count")?,
            incident_flag: row.try_get("incident_flag")?,
            deployment_id: row.try_get("deployment_id")?,
        })
    }

    fn parse_rows(rows: &[SqliteRow]) -> Result<Vec<PendingRequest>> {
        rows.iter().map(Self::parse_row).collect()
    }

    /// Run a single-row conditional transition, reporting whether it applied
    async fn transition(&self, query: &str, id: i64, deployment_id: &str) -> Result<bool> {
        let result = sqlx::query(query)
            .bind(Utc::now().timestamp_millis())
            .bind(deployment_id)
            .bind(id)
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl PendingRequestRepository for SqlitePendingRequestRepository {
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hearing_id INTEGER NOT NULL,
                message_type TEXT NOT NULL,
                version_number INTEGER NOT NULL,
                message TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                submitted_date_time INTEGER NOT NULL,
                last_tried_date_time INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                incident_flag BOOLEAN NOT NULL DEFAULT 0,
                deployment_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_requests_status_submitted \
             ON pending_requests (status, submitted_date_time)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_requests_hearing \
             ON pending_requests (hearing_id, version_number)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS uq_pending_requests_hearing_processing \
             ON pending_requests (hearing_id) WHERE status = 'PROCESSING'",
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite pending_requests schema initialized");
        Ok(())
    }

    async fn create(&self, request: NewPendingRequest) -> Result<PendingRequest> {
        let now = Utc::now().timestamp_millis();
        let query = format!(
            "INSERT INTO pending_requests \
                 (hearing_id, message_type, version_number, message, status, submitted_date_time, retry_count, incident_flag, deployment_id) \
             SELECT ?, ?, COALESCE(MAX(version_number), 0) + 1, ?, 'PENDING', ?, 0, 0, ? \
             FROM pending_requests WHERE hearing_id = ? \
             RETURNING {PENDING_REQUEST_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(request.hearing_id)
            .bind(request.message_type.as_str())
            .bind(&request.message)
            .bind(now)
            .bind(&request.deployment_id)
            .bind(request.hearing_id)
            .fetch_one(&self.pool)
            .await?;

        let created = Self::parse_row(&row)?;
        debug!(
            pending_request_id = created.id,
            hearing_id = created.hearing_id,
            version_number = created.version_number,
            "Created pending request"
        );
        Ok(created)
    }

    async fn claim_oldest_eligible_pending(
        &self,
        pending_wait: Duration,
        deployment_id: &str,
    ) -> Result<Option<PendingRequest>> {
        let now = Utc::now();
        let query = format!(
            "UPDATE pending_requests \
             SET status = 'PROCESSING', last_tried_date_time = ?, deployment_id = ? \
             WHERE status = 'PENDING' AND id = ( \
                 SELECT p.id FROM pending_requests p \
                 WHERE p.status = 'PENDING' \
                   AND (p.last_tried_date_time IS NULL OR p.last_tried_date_time < ?) \
                   AND NOT EXISTS ( \
                       SELECT 1 FROM pending_requests q \
                       WHERE q.hearing_id = p.hearing_id \
                         AND (q.status = 'PROCESSING' \
                              OR (q.status = 'PENDING' AND q.version_number < p.version_number))) \
                 ORDER BY p.submitted_date_time ASC, p.id ASC \
                 LIMIT 1) \
             RETURNING {PENDING_REQUEST_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(now.timestamp_millis())
            .bind(deployment_id)
            .bind(cutoff_millis(now, pending_wait))
            .fetch_optional(&self.pool)
            .await;

        let row = match row {
            Ok(row) => row,
            Err(e) if is_unique_violation(&e) => None,
            Err(e) => return Err(e.into()),
        };

        let claimed = row.as_ref().map(Self::parse_row).transpose()?;
        if let Some(request) = &claimed {
            debug!(
                pending_request_id = request.id,
                hearing_id = request.hearing_id,
                "Claimed pending request"
            );
        }
        Ok(claimed)
    }

    async fn mark_processing(&self, id: i64, deployment_id: &str) -> Result<bool> {
        self.transition(
            "UPDATE pending_requests \
             SET status = 'PROCESSING', last_tried_date_time = ?, deployment_id = ? \
             WHERE id = ? AND status = 'PENDING' \
               AND NOT EXISTS ( \
                   SELECT 1 FROM pending_requests q \
                   WHERE q.hearing_id = pending_requests.hearing_id \
                     AND (q.status = 'PROCESSING' \
                          OR (q.status = 'PENDING' AND q.version_number < pending_requests.version_number)))",
            id,
            deployment_id,
        )
        .await
    }

    async fn mark_completed(&self, id: i64, deployment_id: &str) -> Result<bool> {
        self.transition(
            "UPDATE pending_requests SET status = 'COMPLETED', last_tried_date_time = MAX(COALESCE(last_tried_date_time, 0), ?), deployment_id = ? \
             WHERE id = ? AND status = 'PROCESSING'",
            id,
            deployment_id,
        )
        .await
    }

    async fn mark_exception(&self, id: i64, deployment_id: &str) -> Result<bool> {
        self.transition(
            "UPDATE pending_requests SET status = 'EXCEPTION', last_tried_date_time = MAX(COALESCE(last_tried_date_time, 0), ?), deployment_id = ? \
             WHERE id = ? AND status = 'PROCESSING'",
            id,
            deployment_id,
        )
        .await
    }

    async fn mark_pending_with_retry(&self, id: i64, deployment_id: &str) -> Result<bool> {
        self.transition(
            "UPDATE pending_requests \
             SET status = 'PENDING', retry_count = retry_count + 1, \
                 last_tried_date_time = MAX(COALESCE(last_tried_date_time, 0), ?), deployment_id = ? \
             WHERE id = ? AND status = 'PROCESSING'",
            id,
            deployment_id,
        )
        .await
    }

    async fn requeue_exception(&self, id: i64, deployment_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pending_requests SET status = 'PENDING', deployment_id = ? \
             WHERE id = ? AND status = 'EXCEPTION'",
        )
        .bind(deployment_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<PendingRequest>> {
        let query = format!("SELECT {PENDING_REQUEST_COLUMNS} FROM pending_requests WHERE id = ?");
        let row = sqlx::query(&query).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn find_latest_by_hearing_id(&self, hearing_id: i64) -> Result<Option<PendingRequest>> {
        let query = format!(
            "SELECT {PENDING_REQUEST_COLUMNS} FROM pending_requests \
             WHERE hearing_id = ? ORDER BY version_number DESC, id DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(hearing_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_row).transpose()
    }

    async fn find_by_hearing_id_locked(&self, hearing_id: i64) -> Result<Vec<PendingRequest>> {
        let query = format!(
            "SELECT {PENDING_REQUEST_COLUMNS} FROM pending_requests \
             WHERE hearing_id = ? ORDER BY version_number ASC"
        );
        let rows = sqlx::query(&query)
            .bind(hearing_id)
            .fetch_all(&self.pool)
            .await?;
        Self::parse_rows(&rows)
    }

    async fn find_for_escalation(&self, threshold: Duration) -> Result<Vec<PendingRequest>> {
        let query = format!(
            "SELECT {PENDING_REQUEST_COLUMNS} FROM pending_requests \
             WHERE incident_flag = 0 AND submitted_date_time < ? \
             ORDER BY submitted_date_time ASC"
        );
        let rows = sqlx::query(&query)
            .bind(cutoff_millis(Utc::now(), threshold))
            .fetch_all(&self.pool)
            .await?;
        Self::parse_rows(&rows)
    }

    async fn mark_for_escalation(&self, threshold: Duration, deployment_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE pending_requests SET incident_flag = 1, deployment_id = ? \
             WHERE incident_flag = 0 AND submitted_date_time < ?",
        )
        .bind(deployment_id)
        .bind(cutoff_millis(Utc::now(), threshold))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_completed_older_than(&self, threshold: Duration) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM pending_requests WHERE status = 'COMPLETED' AND submitted_date_time <= ?",
        )
        .bind(cutoff_millis(Utc::now(), threshold))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reclaim_stuck_processing(&self, timeout: Duration, deployment_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE pending_requests \
             SET status = 'PENDING', retry_count = retry_count + 1, deployment_id = ? \
             WHERE status = 'PROCESSING' AND last_tried_date_time < ?",
        )
        .bind(deployment_id)
        .bind(cutoff_millis(Utc::now(), timeout))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
