//! Authorized, retrying requests against Google Cloud JSON APIs.
//!
//! Shared by the storage and Pub/Sub adapters. Tokens come from `gcp_auth`
//! (application default credentials) and are cached by the provider itself.

use gcp_auth::TokenProvider;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
pub const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";

#[derive(Debug, Error)]
pub enum GcpError {
    #[error("failed to get GCP access token: {0}")]
    Auth(#[from] gcp_auth::Error),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// 429, 5xx and transport errors are worth another try.
pub fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// One HTTP client plus credentials, owned by a single worker.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    retry: RetryPolicy,
}

impl ApiClient {
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self, GcpError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            tokens,
            retry,
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Sends the request built by `build`, retrying transient failures.
    ///
    /// Non-success answers that are not transient are returned as
    /// [`GcpError::Status`], except the statuses listed in `accept`, which are
    /// handed back as responses.
    pub async fn send<F>(
        &self,
        scope: &str,
        accept: &[StatusCode],
        build: F,
    ) -> Result<Response, GcpError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut attempt = 1;
        loop {
            let token = self.tokens.token(&[scope]).await?;
            let sent = build(&self.http).bearer_auth(token.as_str()).send().await;
            let retryable = match sent {
                Ok(response) if response.status().is_success() || accept.contains(&response.status()) => {
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "unknown error".to_string());
                    let err = GcpError::Status { status, body };
                    if !is_transient(status) {
                        return Err(err);
                    }
                    err
                }
                Err(e) => GcpError::Transport(e),
            };

            if attempt >= self.retry.attempts {
                warn!(attempt, error = %retryable, "Giving up after retries");
                return Err(retryable);
            }
            let backoff = self.retry.backoff(attempt);
            debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %retryable, "Retrying request");
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}
