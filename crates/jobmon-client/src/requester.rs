//! The retrying HTTP client.

use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use jobmon_core::contracts::ServerTimeResponse;

use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum RequesterError {
    /// Transport-level failure that survived every retry.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("unexpected status code {status} from {route}: {message}")]
    Api {
        status: u16,
        route: String,
        message: String,
    },

    #[error("not found: {0}")]
    NotFound(String),
}

/// Retrying HTTP wire to the state server.
///
/// 5xx responses and transport errors are retried per the [`RetryPolicy`];
/// 4xx responses surface immediately since re-sending the same bad request
/// cannot succeed.
#[derive(Debug, Clone)]
pub struct Requester {
    base_url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl Requester {
    pub fn new(base_url: &str) -> Self {
        Self::with_retry(base_url, RetryPolicy::default())
    }

    pub fn with_retry(base_url: &str, retry: RetryPolicy) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            retry,
        }
    }

    /// Build a requester from `JOBMON_SERVICE_URL`.
    pub fn from_defaults() -> Self {
        Self::new(&jobmon_core::config::ServiceConfig::from_env().url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, route: &str) -> Result<T, RequesterError> {
        self.send::<T, ()>(Method::GET, route, None).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        route: &str,
        body: &B,
    ) -> Result<T, RequesterError> {
        self.send(Method::POST, route, Some(body)).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        route: &str,
        body: &B,
    ) -> Result<T, RequesterError> {
        self.send(Method::PUT, route, Some(body)).await
    }

    /// The server clock, authoritative for sync timestamps.
    pub async fn server_time(&self) -> Result<DateTime<Utc>, RequesterError> {
        let response: ServerTimeResponse = self.get("/time").await?;
        Ok(response.time)
    }

    async fn send<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        route: &str,
        body: Option<&B>,
    ) -> Result<T, RequesterError> {
        let url = format!("{}{}", self.base_url, route);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let mut request = self.http.request(method.clone(), &url);
            if let Some(body) = body {
                request = request.json(body);
            }

            let error = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(RequesterError::NotFound(route.to_string()));
                    }
                    let message = response.text().await.unwrap_or_default();
                    let error = RequesterError::Api {
                        status: status.as_u16(),
                        route: route.to_string(),
                        message,
                    };
                    if status.is_client_error() {
                        // Re-sending the same bad request cannot succeed.
                        return Err(error);
                    }
                    error
                }
                Err(e) => RequesterError::Http(e),
            };

            if attempt < self.retry.max_attempts {
                let delay = self.retry.delay_for_attempt(attempt);
                warn!(
                    %url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "request failed, retrying: {error}"
                );
                tokio::time::sleep(delay).await;
            } else {
                debug!(%url, attempt, "request failed permanently");
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let requester = Requester::new("http://localhost:8070/");
        assert_eq!(requester.base_url(), "http://localhost:8070");
    }
}
