//! HTTP upstream client.
//!
//! Thin reqwest wrapper implementing the capability contract a fetch
//! closure needs from an upstream market-data API: a hard request
//! timeout and a uniform failure classification —
//!
//! - 429 → [`MuninError::RateLimited`] with the parsed `Retry-After`
//!   hint, so the limiter can back off adaptively;
//! - other non-2xx → [`MuninError::Api`];
//! - transport timeout → [`MuninError::Timeout`];
//! - undecodable body → [`MuninError::InvalidPayload`];
//! - any other transport error → [`MuninError::Http`].
//!
//! All of these count as upstream failures for breaker accounting.

use std::time::Duration;

use reqwest::{Client, StatusCode, header};
use serde_json::Value;

use crate::{MuninError, Result};

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest error-body excerpt carried in an [`MuninError::Api`] message.
const MAX_ERROR_BODY: usize = 200;

/// JSON-over-HTTP client for upstream providers.
#[derive(Clone)]
pub struct UpstreamClient {
    http: Client,
    timeout: Duration,
}

impl UpstreamClient {
    /// Create a client with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a client with a custom hard timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        Self { http, timeout }
    }

    /// GET a URL and decode the JSON body.
    pub async fn get_json(&self, url: &str) -> Result<Value> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(MuninError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(MuninError::Api {
                status: status.as_u16(),
                message: truncate(&message),
            });
        }

        response.json().await.map_err(|e| self.classify(e))
    }

    /// The hard timeout in effect.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn classify(&self, e: reqwest::Error) -> MuninError {
        if e.is_timeout() {
            MuninError::Timeout(self.timeout)
        } else if e.is_decode() {
            MuninError::InvalidPayload(e.to_string())
        } else {
            MuninError::Http(e.to_string())
        }
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(message: &str) -> String {
    if message.len() <= MAX_ERROR_BODY {
        message.to_owned()
    } else {
        let mut end = MAX_ERROR_BODY;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &message[..end])
    }
}
