use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::{EmbeddedQueue, QueueConsumer, QueueError, QueueMetrics, QueuePublisher, Result};
use hs_common::{Message, QueuedMessage};

/// A message parked in the dead-letter table
#[derive(Debug, Clone)]
pub struct DeadLetteredMessage {
    pub message: Message,
    pub reason: String,
    pub description: String,
    pub delivery_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// SQLite-backed queue with broker-like lease semantics for local development.
///
/// Polling leases a message for `visibility_timeout_seconds` and bumps its
/// delivery count; an unsettled lease expires and the message is redelivered.
pub struct SqliteQueue {
    pool: Pool<Sqlite>,
    queue_name: String,
    visibility_timeout_seconds: u32,
    running: AtomicBool,
}

impl SqliteQueue {
    pub fn new(pool: Pool<Sqlite>, queue_name: String, visibility_timeout_seconds: u32) -> Self {
        Self {
            pool,
            queue_name,
            visibility_timeout_seconds,
            running: AtomicBool::new(true),
        }
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id TEXT NOT NULL,
                queue_name TEXT NOT NULL,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                receive_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (queue_name, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_visible
            ON queue_messages (queue_name, visible_at, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_dead_letters (
                id TEXT NOT NULL,
                queue_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                reason TEXT NOT NULL,
                description TEXT NOT NULL,
                delivery_count INTEGER NOT NULL,
                dead_lettered_at INTEGER NOT NULL,
                PRIMARY KEY (queue_name, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "SQLite queue schema initialized");
        Ok(())
    }

    fn generate_receipt_handle(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Messages dead-lettered from this queue, oldest first
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetteredMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT payload, reason, description, delivery_count, dead_lettered_at
            FROM queue_dead_letters
            WHERE queue_name = ?
            ORDER BY dead_lettered_at ASC
            "#,
        )
        .bind(&self.queue_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let payload: String = row.get("payload");
                let dead_lettered_at: i64 = row.get("dead_lettered_at");
                Ok(DeadLetteredMessage {
                    message: serde_json::from_str(&payload)?,
                    reason: row.get("reason"),
                    description: row.get("description"),
                    delivery_count: row.get::<i64, _>("delivery_count") as u32,
                    dead_lettered_at: DateTime::from_timestamp_millis(dead_lettered_at)
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }
}

#[async_trait]
impl QueueConsumer for SqliteQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<QueuedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let now = Utc::now().timestamp_millis();
        let new_visible_at = now + i64::from(self.visibility_timeout_seconds) * 1000;

        let rows = sqlx::query(
            r#"
            SELECT id, payload, receive_count
            FROM queue_messages
            WHERE queue_name = ? AND visible_at <= ?
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .bind(i64::from(max_messages))
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());

        for row in rows {
            let id: String = row.get("id");
            let payload: String = row.get("payload");
            let receive_count: i64 = row.get("receive_count");

            let receipt_handle = self.generate_receipt_handle();

            // Conditional on visibility so two pollers cannot lease the same message
            let updated = sqlx::query(
                r#"
                UPDATE queue_messages
                SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE id = ? AND queue_name = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(new_visible_at)
            .bind(&id)
            .bind(&self.queue_name)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if updated.rows_affected() == 0 {
                continue;
            }

            let message: Message = serde_json::from_str(&payload)?;

            messages.push(QueuedMessage {
                message,
                receipt_handle,
                broker_message_id: Some(id),
                queue_identifier: self.queue_name.clone(),
                delivery_count: (receive_count + 1) as u32,
            });
        }

        if !messages.is_empty() {
            debug!(
                queue = %self.queue_name,
                count = messages.len(),
                "Polled messages from SQLite queue"
            );
        }

        Ok(messages)
    }

    async fn complete(&self, receipt_handle: &str) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM queue_messages WHERE receipt_handle = ? AND queue_name = ?",
        )
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                receipt_handle = %receipt_handle,
                queue = %self.queue_name,
                "Complete failed - message not found or lease lost"
            );
            return Err(QueueError::LeaseLost(receipt_handle.to_string()));
        }

        debug!(receipt_handle = %receipt_handle, queue = %self.queue_name, "Message completed");
        Ok(())
    }

    async fn abandon(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let delay_ms = i64::from(delay_seconds.unwrap_or(0)) * 1000;
        let new_visible_at = Utc::now().timestamp_millis() + delay_ms;

        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?, receipt_handle = NULL
            WHERE receipt_handle = ? AND queue_name = ?
            "#,
        )
        .bind(new_visible_at)
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                receipt_handle = %receipt_handle,
                queue = %self.queue_name,
                "Abandon failed - message not found"
            );
            return Err(QueueError::LeaseLost(receipt_handle.to_string()));
        }

        debug!(
            receipt_handle = %receipt_handle,
            queue = %self.queue_name,
            delay_ms,
            "Message abandoned"
        );
        Ok(())
    }

    async fn dead_letter(&self, message: &QueuedMessage, reason: &str, description: &str) -> Result<()> {
        let receipt_handle = message.receipt_handle.as_str();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, payload, receive_count FROM queue_messages WHERE receipt_handle = ? AND queue_name = ?",
        )
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| QueueError::LeaseLost(receipt_handle.to_string()))?;

        let id: String = row.get("id");
        let payload: String = row.get("payload");
        let receive_count: i64 = row.get("receive_count");

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO queue_dead_letters
                (id, queue_name, payload, reason, description, delivery_count, dead_lettered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&self.queue_name)
        .bind(&payload)
        .bind(reason)
        .bind(description)
        .bind(receive_count)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM queue_messages WHERE id = ? AND queue_name = ?")
            .bind(&id)
            .bind(&self.queue_name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        warn!(
            message_id = %id,
            queue = %self.queue_name,
            reason = %reason,
            "Message dead-lettered"
        );
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQLite queue consumer stopped");
    }

    async fn get_metrics(&self) -> Result<Option<QueueMetrics>> {
        let now = Utc::now().timestamp_millis();

        let pending: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM queue_messages WHERE queue_name = ? AND visible_at <= ?",
        )
        .bind(&self.queue_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?
        .get("count");

        let in_flight: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM queue_messages WHERE queue_name = ? AND visible_at > ? AND receipt_handle IS NOT NULL",
        )
        .bind(&self.queue_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?
        .get("count");

        let dead_lettered: i64 = sqlx::query(
            "SELECT COUNT(*) AS count FROM queue_dead_letters WHERE queue_name = ?",
        )
        .bind(&self.queue_name)
        .fetch_one(&self.pool)
        .await?
        .get("count");

        Ok(Some(QueueMetrics {
            pending_messages: pending as u64,
            in_flight_messages: in_flight as u64,
            dead_lettered_messages: dead_lettered as u64,
            queue_identifier: self.queue_name.clone(),
        }))
    }
}

#[async_trait]
impl QueuePublisher for SqliteQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn publish(&self, message: Message) -> Result<String> {
        let now = Utc::now().timestamp_millis();
        let payload = serde_json::to_string(&message)?;

        // Same id published twice is a duplicate send, keep the first
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO queue_messages (id, queue_name, visible_at, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&self.queue_name)
        .bind(now)
        .bind(&payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            debug!(message_id = %message.id, queue = %self.queue_name, "Duplicate message detected, skipping");
        } else {
            debug!(message_id = %message.id, queue = %self.queue_name, "Message published to SQLite queue");
        }

        Ok(message.id)
    }
}

#[async_trait]
impl EmbeddedQueue for SqliteQueue {
    async fn init_schema(&self) -> Result<()> {
        self.create_schema().await
    }
}
