use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod logging;

/// Application property carrying the routing key of an inbound message
pub const MESSAGE_TYPE_PROPERTY: &str = "message_type";
/// Application property carrying the hearing the message belongs to
pub const HEARING_ID_PROPERTY: &str = "hearing_id";
/// `message_type` stamped on every sync-result message put on the egress queue
pub const SYNC_RESPONSE_MESSAGE_TYPE: &str = "LA_SYNC_HEARING_RESPONSE";

// ============================================================================
// Queue Message Types
// ============================================================================

/// A message as carried by the broker.
///
/// The body is opaque to the transport; routing metadata travels in
/// `application_properties`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub application_properties: HashMap<String, String>,
    pub body: String,
}

impl Message {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            application_properties: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.application_properties.get(key).map(String::as_str)
    }
}

/// A message that has been received from a queue with tracking metadata
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    pub receipt_handle: String,
    pub broker_message_id: Option<String>,
    pub queue_identifier: String,
    /// Number of times the broker has handed this message to a consumer, including this one
    pub delivery_count: u32,
}

/// What the consumer must do with a message once the dispatcher is done with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueDisposition {
    /// Remove the message from the queue
    Complete,
    /// Release the lease so the broker redelivers the message
    Retry,
    /// Move the message to the dead-letter queue
    DeadLetter { reason: String, description: String },
}

// ============================================================================
// Hearing Routing Types
// ============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Hearing lifecycle event carried by an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    RequestHearing,
    AmendHearing,
    DeleteHearing,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::RequestHearing => "REQUEST_HEARING",
            MessageType::AmendHearing => "AMEND_HEARING",
            MessageType::DeleteHearing => "DELETE_HEARING",
        }
    }
}

impl FromStr for MessageType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUEST_HEARING" => Ok(MessageType::RequestHearing),
            "AMEND_HEARING" => Ok(MessageType::AmendHearing),
            "DELETE_HEARING" => Ok(MessageType::DeleteHearing),
            other => Err(ParseEnumError {
                kind: "message type",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Pending Request Ledger Types
// ============================================================================

/// Lifecycle of a pending request row
///
/// `PENDING -> PROCESSING -> {COMPLETED, EXCEPTION}`, with `PROCESSING -> PENDING`
/// on a retryable failure and `EXCEPTION -> PENDING` on re-queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingRequestStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Exception,
}

impl PendingRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingRequestStatus::Pending => "PENDING",
            PendingRequestStatus::Processing => "PROCESSING",
            PendingRequestStatus::Completed => "COMPLETED",
            PendingRequestStatus::Exception => "EXCEPTION",
        }
    }
}

impl FromStr for PendingRequestStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PendingRequestStatus::Pending),
            "PROCESSING" => Ok(PendingRequestStatus::Processing),
            "COMPLETED" => Ok(PendingRequestStatus::Completed),
            "EXCEPTION" => Ok(PendingRequestStatus::Exception),
            other => Err(ParseEnumError {
                kind: "pending request status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for PendingRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery attempt record in the `pending_requests` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: i64,
    pub hearing_id: i64,
    pub message_type: MessageType,
    pub version_number: i32,
    pub message: String,
    pub status: PendingRequestStatus,
    pub submitted_date_time: DateTime<Utc>,
    pub last_tried_date_time: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub incident_flag: bool,
    pub deployment_id: Option<String>,
}

impl PendingRequest {
    /// True once the row has been outstanding for longer than `limit`.
    pub fn submitted_date_time_period_elapsed(&self, limit: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(limit) {
            Ok(limit) => self.submitted_date_time < now - limit,
            // A limit too large to represent never elapses
            Err(_) => false,
        }
    }
}

/// Fields supplied by the caller when a pending request is created.
/// Everything else (id, version, timestamps, counters) is assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPendingRequest {
    pub hearing_id: i64,
    pub message_type: MessageType,
    pub message: String,
    pub deployment_id: String,
}

// ============================================================================
// Egress Sync Message
// ============================================================================

/// Outcome of a downstream call, published to the egress queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub list_assist_http_status: u16,
    pub list_assist_error_code: Option<i32>,
    pub list_assist_error_description: Option<String>,
}

impl SyncResponse {
    pub fn success(status: u16) -> Self {
        Self {
            list_assist_http_status: status,
            list_assist_error_code: None,
            list_assist_error_description: None,
        }
    }

    pub fn failure(status: u16, error_code: Option<i32>, description: Option<String>) -> Self {
        Self {
            list_assist_http_status: status,
            list_assist_error_code: error_code,
            list_assist_error_description: description,
        }
    }

    /// Wrap into a queue message tagged for the given hearing
    pub fn to_message(&self, hearing_id: i64) -> Result<Message, serde_json::Error> {
        let body = serde_json::to_string(self)?;
        Ok(Message::new(body)
            .with_property(MESSAGE_TYPE_PROPERTY, SYNC_RESPONSE_MESSAGE_TYPE)
            .with_property(HEARING_ID_PROPERTY, hearing_id.to_string()))
    }
}
