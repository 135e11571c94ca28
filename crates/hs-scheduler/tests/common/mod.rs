#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hs_common::{Message, MessageType, NewPendingRequest, PendingRequest};
use hs_queue::QueuePublisher;
use hs_router::{AccessToken, DownstreamError, HearingApiClient, HearingDelivery, HearingResponse};
use hs_scheduler::{EscalationScheduler, SchedulerConfig};
use hs_store::{PendingRequestRepository, SqlitePendingRequestRepository};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEPLOYMENT: &str = "scheduler-test";

/// Hearing API double: replays scripted results and counts calls per hearing
#[derive(Default)]
pub struct ScriptedHearingApiClient {
    responses: Mutex<VecDeque<Result<HearingResponse, DownstreamError>>>,
    calls: Mutex<Vec<i64>>,
    delay: Option<Duration>,
}

impl ScriptedHearingApiClient {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn respond(&self, result: Result<HearingResponse, DownstreamError>) {
        self.responses.lock().unwrap().push_back(result);
    }

    /// Payloads carry `hearingId`, so create calls can be attributed too
    pub fn calls(&self) -> Vec<i64> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, hearing_id: i64) -> Result<HearingResponse, DownstreamError> {
        self.calls.lock().unwrap().push(hearing_id);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(HearingResponse {
                status: 200,
                description: None,
            }))
    }
}

#[async_trait]
impl HearingApiClient for ScriptedHearingApiClient {
    async fn authenticate(&self) -> Result<AccessToken, DownstreamError> {
        Ok(AccessToken {
            access_token: "test-token".to_string(),
            token_type: None,
            expires_in: None,
        })
    }

    async fn create_hearing(&self, payload: &Value) -> Result<HearingResponse, DownstreamError> {
        self.record(payload["hearingId"].as_i64().unwrap_or_default()).await
    }

    async fn amend_hearing(
        &self,
        _payload: &Value,
        hearing_id: i64,
    ) -> Result<HearingResponse, DownstreamError> {
        self.record(hearing_id).await
    }

    async fn delete_hearing(
        &self,
        _payload: &Value,
        hearing_id: i64,
    ) -> Result<HearingResponse, DownstreamError> {
        self.record(hearing_id).await
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Message>>,
}

impl RecordingPublisher {
    pub fn published_bodies(&self) -> Vec<Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|m| serde_json::from_str(&m.body).unwrap())
            .collect()
    }
}

#[async_trait]
impl QueuePublisher for RecordingPublisher {
    fn identifier(&self) -> &str {
        "recording-outbound"
    }

    async fn publish(&self, message: Message) -> hs_queue::Result<String> {
        let id = message.id.clone();
        self.published.lock().unwrap().push(message);
        Ok(id)
    }
}

pub struct Harness {
    pub api: Arc<ScriptedHearingApiClient>,
    pub publisher: Arc<RecordingPublisher>,
    pub repository: Arc<SqlitePendingRequestRepository>,
    pub delivery: Arc<HearingDelivery>,
    pub config: SchedulerConfig,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_api(ScriptedHearingApiClient::default()).await
    }

    pub async fn with_api(api: ScriptedHearingApiClient) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repository = Arc::new(SqlitePendingRequestRepository::new(pool));
        repository.init_schema().await.unwrap();

        let api = Arc::new(api);
        let publisher = Arc::new(RecordingPublisher::default());
        let delivery = Arc::new(HearingDelivery::new(
            api.clone(),
            publisher.clone(),
            Duration::from_secs(5),
        ));
        let config = SchedulerConfig {
            run_interval: Duration::from_millis(50),
            deployment_id: DEPLOYMENT.to_string(),
            ..SchedulerConfig::default()
        };

        Self {
            api,
            publisher,
            repository,
            delivery,
            config,
        }
    }

    pub fn scheduler(&self) -> EscalationScheduler {
        EscalationScheduler::new(
            self.config.clone(),
            self.repository.clone(),
            self.delivery.clone(),
        )
    }

    pub async fn pending(&self, hearing_id: i64, message_type: MessageType) -> PendingRequest {
        self.pending_with_body(
            hearing_id,
            message_type,
            &format!(r#"{{"hearingId":{hearing_id}}}"#),
        )
        .await
    }

    pub async fn pending_with_body(
        &self,
        hearing_id: i64,
        message_type: MessageType,
        body: &str,
    ) -> PendingRequest {
        self.repository
            .create(NewPendingRequest {
                hearing_id,
                message_type,
                message: body.to_string(),
                deployment_id: DEPLOYMENT.to_string(),
            })
            .await
            .unwrap()
    }

    pub async fn reload(&self, id: i64) -> Option<PendingRequest> {
        self.repository.find_by_id(id).await.unwrap()
    }

    pub async fn set_submitted(&self, id: i64, at: DateTime<Utc>) {
        self.set_column("submitted_date_time", id, at).await;
    }

    pub async fn set_last_tried(&self, id: i64, at: DateTime<Utc>) {
        self.set_column("last_tried_date_time", id, at).await;
    }

    async fn set_column(&self, column: &str, id: i64, at: DateTime<Utc>) {
        sqlx::query(&format!("UPDATE pending_requests SET {column} = ? WHERE id = ?"))
            .bind(at.timestamp_millis())
            .bind(id)
            .execute(self.repository.pool())
            .await
            .unwrap();
    }

    pub async fn set_status(&self, id: i64, status: &str) {
        sqlx::query("UPDATE pending_requests SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.repository.pool())
            .await
            .unwrap();
    }
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::hours(hours)
}
