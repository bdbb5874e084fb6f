//! API client for submitting queued operations to the commerce backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mercato_core::errors::RemoteError;
use mercato_core::sync::{OperationKind, RemoteService, SubmitAck};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;
const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Supplies the bearer token for each request.
///
/// The host owns token storage and refresh; the client asks per submission so
/// a refreshed token is picked up without rebuilding the client.
pub type AccessTokenProvider = Arc<dyn Fn() -> Result<String, String> + Send + Sync>;

/// One submitted operation, as the backend expects it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest<'a> {
    operation: OperationKind,
    payload: &'a Value,
}

/// Acknowledgment body for an accepted submission.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    status: SubmitAck,
}

/// Error response body from the backend.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    code: String,
    message: String,
}

/// HTTP realization of [`RemoteService`] against the commerce backend.
///
/// Submissions go to `POST {base}/v1/sync/operations` with the queue entry's
/// idempotency token in the `Idempotency-Key` header; the backend dedupes on
/// that header and answers `alreadyApplied` for a token it has seen.
#[derive(Clone)]
pub struct ConnectClient {
    client: reqwest::Client,
    base_url: String,
    token_provider: AccessTokenProvider,
}

impl ConnectClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL of the commerce API (e.g., "https://api.mercato.app")
    /// * `token_provider` - Called before each request for the current bearer token
    pub fn new(base_url: &str, token_provider: AccessTokenProvider) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token_provider,
        }
    }

    /// Create headers for an API request.
    fn headers(&self, token: &str, idempotency_token: &str) -> Result<HeaderMap, RemoteError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| RemoteError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        // A token the transport cannot carry will never become sendable.
        let key_value = HeaderValue::from_str(idempotency_token)
            .map_err(|_| RemoteError::rejected("Invalid idempotency token format"))?;
        headers.insert(IDEMPOTENCY_KEY_HEADER, key_value);

        Ok(headers)
    }

    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("API response error ({}): {}", status, preview);
    }

    /// Parse the acknowledgment body, or an error response.
    async fn parse_response(response: reqwest::Response) -> Result<SubmitAck, RemoteError> {
        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;
        Self::log_response(status, &body);

        if !status.is_success() {
            // Try to parse error response
            if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
                return Err(RemoteError::api(
                    status.as_u16(),
                    format!("{}: {}", error.code, error.message),
                ));
            }
            return Err(RemoteError::api(
                status.as_u16(),
                format!("Request failed: {}", body),
            ));
        }

        serde_json::from_str::<SubmitResponse>(&body)
            .map(|ack| ack.status)
            .map_err(|e| {
                log::error!(
                    "Failed to deserialize response. Body: {}, Error: {}",
                    body,
                    e
                );
                RemoteError::api(status.as_u16(), format!("Failed to parse response: {}", e))
            })
    }
}

/// Map a transport failure onto the retry taxonomy.
fn classify_transport(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout(DEFAULT_TIMEOUT_SECS)
    } else {
        RemoteError::network(err.to_string())
    }
}

#[async_trait]
impl RemoteService for ConnectClient {
    /// Submit one queued operation.
    ///
    /// POST /v1/sync/operations
    async fn submit(
        &self,
        operation: OperationKind,
        payload: &Value,
        idempotency_token: &str,
    ) -> Result<SubmitAck, RemoteError> {
        let token = (self.token_provider)().map_err(RemoteError::auth)?;
        let url = format!("{}/v1/sync/operations", self.base_url);
        debug!(
            "submitting {} (idempotency key {})",
            operation.as_str(),
            idempotency_token
        );

        let response = self
            .client
            .post(&url)
            .headers(self.headers(&token, idempotency_token)?)
            .json(&SubmitRequest { operation, payload })
            .send()
            .await
            .map_err(classify_transport)?;

        Self::parse_response(response).await
    }
}
