use hs_common::SyncResponse;
use hs_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by (or while talking to) the downstream scheduling API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownstreamError {
    #[error("Downstream rejected request with HTTP {status}: {}", .description.as_deref().unwrap_or("no description"))]
    Rejected {
        status: u16,
        error_code: Option<i32>,
        description: Option<String>,
    },

    #[error("Hearing not found downstream: {}", .description.as_deref().unwrap_or("no description"))]
    NotFound {
        error_code: Option<i32>,
        description: Option<String>,
    },

    #[error("Authentication failed with HTTP {status}: {}", .description.as_deref().unwrap_or("no description"))]
    AuthenticationFailed {
        status: u16,
        description: Option<String>,
    },

    #[error("Downstream call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection to downstream failed: {0}")]
    Connection(String),

    #[error("Undecodable downstream response: {0}")]
    InvalidResponse(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

impl DownstreamError {
    /// Sync-result message for failures that carry a downstream HTTP status
    pub fn sync_response(&self) -> Option<SyncResponse> {
        match self {
            DownstreamError::Rejected { status, error_code, description } => Some(
                SyncResponse::failure(*status, *error_code, description.clone()),
            ),
            DownstreamError::NotFound { error_code, description } => {
                Some(SyncResponse::failure(404, *error_code, description.clone()))
            }
            DownstreamError::AuthenticationFailed { status, description } => {
                Some(SyncResponse::failure(*status, None, description.clone()))
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DownstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DownstreamError::Connection(format!("request timed out: {e}"))
        } else if e.is_connect() {
            DownstreamError::Connection(e.to_string())
        } else if e.is_decode() {
            DownstreamError::InvalidResponse(e.to_string())
        } else {
            DownstreamError::Client(e.to_string())
        }
    }
}

/// Everything that can go wrong while handling one hearing message
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Missing {0} application property")]
    MissingProperty(&'static str),

    #[error("Invalid {name} application property: {value}")]
    InvalidProperty { name: &'static str, value: String },

    #[error("Payload is not valid JSON: {0}")]
    Payload(#[source] serde_json::Error),

    #[error(transparent)]
    Downstream(#[from] DownstreamError),

    #[error("Pending request store error: {0}")]
    Store(#[from] StoreError),
}
