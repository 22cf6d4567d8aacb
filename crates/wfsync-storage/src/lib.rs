//! HTTP transport for portal REST calls: retrying JSON GET/POST with backoff.

use std::time::Duration;

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "wfsync-storage";

/// Parameter names whose values never reach the logs.
const SECRET_PARAMS: [&str; 3] = ["password", "token", "text"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("portal error {code} for {url}: {message}")]
    Remote {
        code: i64,
        message: String,
        url: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Which failures a request may be re-sent after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryScope {
    /// Reads: transient statuses and transport errors.
    Idempotent,
    /// Writes: only failures to connect, where nothing reached the server.
    ConnectOnly,
}

/// JSON-over-HTTP client for portal and feature service endpoints.
///
/// Every request carries `f=json`. Responses are parsed as JSON and a
/// `{"error": {...}}` envelope is surfaced as [`TransportError::Remote`],
/// since the portal reports most failures with a 200 status.
#[derive(Debug, Clone)]
pub struct PortalHttp {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl PortalHttp {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_json(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<JsonValue, TransportError> {
        let query = with_format(params);
        let span = info_span!("portal_request", method = "GET", url);
        async {
            debug!(params = %redacted(&query), "sending request");
            self.send(url, RetryScope::Idempotent, || {
                self.client.get(url).query(&query)
            })
            .await
        }
        .instrument(span)
        .await
    }

    pub async fn post_form(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<JsonValue, TransportError> {
        let form = with_format(params);
        let span = info_span!("portal_request", method = "POST", url);
        async {
            debug!(params = %redacted(&form), "sending request");
            self.send(url, RetryScope::ConnectOnly, || {
                self.client.post(url).form(&form)
            })
            .await
        }
        .instrument(span)
        .await
    }

    async fn send<F>(
        &self,
        url: &str,
        scope: RetryScope,
        build: F,
    ) -> Result<JsonValue, TransportError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?;
                        let value: JsonValue =
                            serde_json::from_slice(&body).map_err(|source| {
                                TransportError::Decode {
                                    url: url.to_string(),
                                    source,
                                }
                            })?;
                        return check_remote_error(url, value);
                    }

                    if scope == RetryScope::Idempotent
                        && classify_status(status) == RetryDisposition::Retryable
                        && can_retry
                    {
                        debug!(status = status.as_u16(), attempt, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(TransportError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    let retryable = match scope {
                        RetryScope::Idempotent => {
                            classify_reqwest_error(&err) == RetryDisposition::Retryable
                        }
                        RetryScope::ConnectOnly => err.is_connect(),
                    };
                    if retryable && can_retry {
                        debug!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(TransportError::Request(err));
                }
            }
        }
    }
}

/// Turn a `{"error": {"code", "message", "details"}}` body into an error.
pub fn check_remote_error(url: &str, value: JsonValue) -> Result<JsonValue, TransportError> {
    let Some(error) = value.get("error") else {
        return Ok(value);
    };
    let code = error.get("code").and_then(JsonValue::as_i64).unwrap_or(0);
    let mut message = error
        .get("message")
        .and_then(JsonValue::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let details: Vec<&str> = error
        .get("details")
        .and_then(JsonValue::as_array)
        .map(|d| d.iter().filter_map(JsonValue::as_str).collect())
        .unwrap_or_default();
    if !details.is_empty() {
        message = format!("{message} ({})", details.join("; "));
    }
    Err(TransportError::Remote {
        code,
        message,
        url: url.to_string(),
    })
}

fn with_format<'a>(params: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    let mut out = params.to_vec();
    if !out.iter().any(|(k, _)| *k == "f") {
        out.push(("f", "json"));
    }
    out
}

fn redacted(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| {
            if SECRET_PARAMS.contains(k) {
                format!("{k}=***")
            } else {
                format!("{k}={v}")
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}
