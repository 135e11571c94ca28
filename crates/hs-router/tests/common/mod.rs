#![allow(dead_code)]

use async_trait::async_trait;
use hs_common::{Message, QueuedMessage, HEARING_ID_PROPERTY, MESSAGE_TYPE_PROPERTY};
use hs_queue::QueuePublisher;
use hs_router::{
    AccessToken, DispatcherConfig, DownstreamError, HearingApiClient, HearingDelivery,
    HearingResponse, MessageDispatcher,
};
use hs_store::{PendingRequestRepository, SqlitePendingRequestRepository};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEPLOYMENT: &str = "test-deployment";
pub const MAX_DELIVERY_COUNT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Create,
    Amend(i64),
    Delete(i64),
}

/// Hearing API double that replays scripted results and records every call
pub struct ScriptedHearingApiClient {
    responses: Mutex<VecDeque<Result<HearingResponse, DownstreamError>>>,
    calls: Mutex<Vec<(ApiCall, Value)>>,
    delay: Option<Duration>,
}

impl ScriptedHearingApiClient {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn respond(&self, result: Result<HearingResponse, DownstreamError>) {
        self.responses.lock().unwrap().push_back(result);
    }

    pub fn respond_ok(&self, status: u16) {
        self.respond(Ok(HearingResponse {
            status,
            description: None,
        }));
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    async fn record(
        &self,
        call: ApiCall,
        payload: &Value,
    ) -> Result<HearingResponse, DownstreamError> {
        self.calls.lock().unwrap().push((call, payload.clone()));
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
            token_type: Some("Bearer".to_string()),
            expires_in: Some(3600),
        })
    }

    async fn create_hearing(&self, payload: &Value) -> Result<HearingResponse, DownstreamError> {
        self.record(ApiCall::Create, payload).await
    }

    async fn amend_hearing(
        &self,
        payload: &Value,
        hearing_id: i64,
    ) -> Result<HearingResponse, DownstreamError> {
        self.record(ApiCall::Amend(hearing_id), payload).await
    }

    async fn delete_hearing(
        &self,
        payload: &Value,
        hearing_id: i64,
    ) -> Result<HearingResponse, DownstreamError> {
        self.record(ApiCall::Delete(hearing_id), payload).await
    }
}

/// Egress publisher double
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Message>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<Message> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_bodies(&self) -> Vec<Value> {
        self.published()
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

pub async fn sqlite_repository() -> Arc<SqlitePendingRequestRepository> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let repo = SqlitePendingRequestRepository::new(pool);
    repo.init_schema().await.unwrap();
    Arc::new(repo)
}

pub struct Harness {
    pub api: Arc<ScriptedHearingApiClient>,
    pub publisher: Arc<RecordingPublisher>,
    pub repository: Arc<SqlitePendingRequestRepository>,
    pub delivery: Arc<HearingDelivery>,
    pub dispatcher: MessageDispatcher,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_client(ScriptedHearingApiClient::new(), Duration::from_secs(5)).await
    }

    pub async fn with_client(api: ScriptedHearingApiClient, timeout: Duration) -> Self {
        let api = Arc::new(api);
        let publisher = Arc::new(RecordingPublisher::default());
        let repository = sqlite_repository().await;
        let delivery = Arc::new(HearingDelivery::new(api.clone(), publisher.clone(), timeout));
        let dispatcher = MessageDispatcher::new(
            repository.clone(),
            delivery.clone(),
            DispatcherConfig {
                max_delivery_count: MAX_DELIVERY_COUNT,
                deployment_id: DEPLOYMENT.to_string(),
            },
        );

        Self {
            api,
            publisher,
            repository,
            delivery,
            dispatcher,
        }
    }
}

pub fn hearing_message(message_type: &str, hearing_id: &str, body: &str) -> Message {
    Message::new(body)
        .with_property(MESSAGE_TYPE_PROPERTY, message_type)
        .with_property(HEARING_ID_PROPERTY, hearing_id)
}

pub fn queued(message: Message, delivery_count: u32) -> QueuedMessage {
    QueuedMessage {
        message,
        receipt_handle: "receipt-1".to_string(),
        broker_message_id: None,
        queue_identifier: "hearings-inbound".to_string(),
        delivery_count,
    }
}

pub fn rejected(status: u16, error_code: i32, description: &str) -> DownstreamError {
    DownstreamError::Rejected {
        status,
        error_code: Some(error_code),
        description: Some(description.to_string()),
    }
}
