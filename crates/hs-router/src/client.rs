//! Downstream scheduling API client
//!
//! `HttpHearingApiClient` acquires a client-credentials bearer token for every
//! call and maps the API's status codes and `{"errCode", "errorDesc"}` error
//! bodies onto [`DownstreamError`].

use async_trait::async_trait;
use hs_config::DownstreamConfig;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::DownstreamError;

/// Bearer token issued by the token endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Successful downstream response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HearingResponse {
    pub status: u16,
    pub description: Option<String>,
}

/// Error body returned by the scheduling API
#[derive(Debug, Default, Deserialize)]
struct ErrorDetails {
    #[serde(rename = "errCode")]
    error_code: Option<i32>,
    #[serde(rename = "errorDesc")]
    error_description: Option<String>,
}

#[async_trait]
pub trait HearingApiClient: Send + Sync {
    async fn authenticate(&self) -> Result<AccessToken, DownstreamError>;

    async fn create_hearing(&self, payload: &Value) -> Result<HearingResponse, DownstreamError>;

    async fn amend_hearing(
        &self,
        payload: &Value,
        hearing_id: i64,
    ) -> Result<HearingResponse, DownstreamError>;

    async fn delete_hearing(
        &self,
        payload: &Value,
        hearing_id: i64,
    ) -> Result<HearingResponse, DownstreamError>;
}

pub struct HttpHearingApiClient {
    client: Client,
    config: DownstreamConfig,
}

impl HttpHearingApiClient {
    pub fn new(config: DownstreamConfig) -> Result<Self, DownstreamError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| DownstreamError::Client(format!("failed to build HTTP client: {e}")))?;

        info!(
            base_url = %config.base_url,
            timeout_secs = config.timeout_secs,
            "HttpHearingApiClient initialized"
        );

        Ok(Self { client, config })
    }

    fn hearing_url(&self, hearing_id: Option<i64>) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match hearing_id {
            Some(id) => format!("{base}/hearing/{id}"),
            None => format!("{base}/hearing"),
        }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: String,
        payload: &Value,
    ) -> Result<HearingResponse, DownstreamError> {
        let token = self.authenticate().await?;

        debug!(%method, %url, "Calling scheduling API");

        let response = self
            .client
            .request(method, &url)
            .bearer_auth(&token.access_token)
            .header("Accept", "application/json")
            .json(payload)
            .send()
            .await?;

        into_hearing_response(response).await
    }
}

async fn into_hearing_response(response: Response) -> Result<HearingResponse, DownstreamError> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        return Ok(HearingResponse {
            status: status.as_u16(),
            description: Some(body).filter(|b| !b.trim().is_empty()),
        });
    }

    let details = parse_error_details(&body);
    warn!(
        status = status.as_u16(),
        error_code = ?details.error_code,
        "Scheduling API rejected request"
    );

    if status == StatusCode::NOT_FOUND {
        Err(DownstreamError::NotFound {
            error_code: details.error_code,
            description: details.error_description,
        })
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(DownstreamError::AuthenticationFailed {
            status: status.as_u16(),
            description: details.error_description,
        })
    } else {
        Err(DownstreamError::Rejected {
            status: status.as_u16(),
            error_code: details.error_code,
            description: details.error_description,
        })
    }
}

/// Structured body when present, otherwise the raw text as the description
fn parse_error_details(body: &str) -> ErrorDetails {
    if body.trim().is_empty() {
        return ErrorDetails::default();
    }
    serde_json::from_str(body).unwrap_or_else(|_| ErrorDetails {
        error_code: None,
        error_description: Some(body.to_string()),
    })
}

#[async_trait]
impl HearingApiClient for HttpHearingApiClient {
    async fn authenticate(&self) -> Result<AccessToken, DownstreamError> {
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        if !self.config.scope.is_empty() {
            form.push(("scope", self.config.scope.as_str()));
        }

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "Token request failed");
            return Err(DownstreamError::AuthenticationFailed {
                status: status.as_u16(),
                description: Some(body).filter(|b| !b.trim().is_empty()),
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| DownstreamError::InvalidResponse(format!("token response: {e}")))
    }

    async fn create_hearing(&self, payload: &Value) -> Result<HearingResponse, DownstreamError> {
        self.send(reqwest::Method::POST, self.hearing_url(None), payload)
            .await
    }

    async fn amend_hearing(
        &self,
        payload: &Value,
        hearing_id: i64,
    ) -> Result<HearingResponse, DownstreamError> {
        self.send(reqwest::Method::PUT, self.hearing_url(Some(hearing_id)), payload)
            .await
    }

    async fn delete_hearing(
        &self,
        payload: &Value,
        hearing_id: i64,
    ) -> Result<HearingResponse, DownstreamError> {
        self.send(reqwest::Method::DELETE, self.hearing_url(Some(hearing_id)), payload)
            .await
    }
}
