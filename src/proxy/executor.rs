//! Proxied request execution with rate-limit aware retries
//!
//! Provider error statuses are relayed to the caller; only transport-level
//! failures surface as broker errors. Retryable responses are re-sent after
//! a wait chosen in priority order: the caller-named response header, the
//! provider's retry hint headers from the catalog, then exponential backoff
//! with jitter.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;

use crate::catalog::RetryHeaderHints;
use crate::config::ProxyRetryConfig;
use crate::error::BrokerError;
use crate::proxy::builder::{BuiltRequest, ProxyBody};

/// Per-request retry parameters, resolved from caller headers and the
/// provider's catalog entry.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt.
    pub max_retries: u32,
    /// Extra status codes the caller wants retried.
    pub retry_on: Vec<u16>,
    /// Response header the caller nominated as the wait source.
    pub retry_header: Option<String>,
    /// Provider rate-limit hint headers.
    pub hints: RetryHeaderHints,
}

/// Provider response relayed to the caller as-is.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub struct ProxyExecutor {
    http: reqwest::Client,
    config: ProxyRetryConfig,
}

impl ProxyExecutor {
    pub fn new(config: ProxyRetryConfig) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("http client build: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn with_client(http: reqwest::Client, config: ProxyRetryConfig) -> Self {
        Self { http, config }
    }

    pub async fn execute(
        &self,
        request: &BuiltRequest,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<UpstreamResponse, BrokerError> {
        let max_retries = policy.max_retries.min(self.config.max_retries);
        let headers = header_map(&request.headers)?;
        let mut last_transport_error = None;

        for attempt in 0..=max_retries {
            let mut req = self
                .http
                .request(request.method.clone(), &request.url)
                .headers(headers.clone());
            req = attach_body(req, &request.body)?;

            match req.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let response_headers: Vec<(String, String)> = response
                        .headers()
                        .iter()
                        .map(|(name, value)| {
                            (
                                name.as_str().to_string(),
                                String::from_utf8_lossy(value.as_bytes()).into_owned(),
                            )
                        })
                        .collect();

                    if !should_retry(status, &response_headers, &policy.retry_on)
                        || attempt == max_retries
                    {
                        let body = response
                            .bytes()
                            .await
                            .map_err(|e| transport(attempt + 1, &e))?;
                        return Ok(UpstreamResponse {
                            status,
                            headers: response_headers,
                            body: body.to_vec(),
                        });
                    }

                    let wait = self.compute_wait(attempt, &response_headers, policy);
                    tracing::warn!(
                        url = %request.url,
                        status,
                        attempt,
                        wait_secs = wait.as_secs(),
                        "retrying proxied request"
                    );
                    metrics::counter!("keybridge_proxy_retries_total").increment(1);
                    if !self.sleep(wait, cancel).await {
                        return Err(BrokerError::Transport {
                            attempts: attempt + 1,
                            message: "request cancelled while waiting to retry".to_string(),
                        });
                    }
                }
                Err(error) => {
                    if attempt == max_retries {
                        return Err(transport(attempt + 1, &error));
                    }
                    let wait = self.backoff(attempt);
                    tracing::warn!(
                        url = %request.url,
                        attempt,
                        wait_secs = wait.as_secs(),
                        "proxied request failed in transit, retrying"
                    );
                    last_transport_error = Some(error.to_string());
                    if !self.sleep(wait, cancel).await {
                        return Err(BrokerError::Transport {
                            attempts: attempt + 1,
                            message: "request cancelled while waiting to retry".to_string(),
                        });
                    }
                }
            }
        }

        // Loop always returns; reachable only with max_retries == 0 overflow.
        Err(BrokerError::Transport {
            attempts: max_retries + 1,
            message: last_transport_error.unwrap_or_else(|| "request not attempted".to_string()),
        })
    }

    /// False when cancelled before the wait elapsed.
    async fn sleep(&self, wait: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(wait) => true,
            _ = cancel.cancelled() => false,
        }
    }

    fn compute_wait(
        &self,
        attempt: u32,
        headers: &[(String, String)],
        policy: &RetryPolicy,
    ) -> Duration {
        let from_headers = policy
            .retry_header
            .as_deref()
            .and_then(|name| header_value(headers, name))
            .and_then(parse_wait_value)
            .or_else(|| {
                policy
                    .hints
                    .at
                    .as_deref()
                    .and_then(|name| header_value(headers, name))
                    .and_then(parse_epoch_wait)
            })
            .or_else(|| {
                policy
                    .hints
                    .after
                    .as_deref()
                    .and_then(|name| header_value(headers, name))
                    .and_then(parse_seconds_wait)
            });

        match from_headers {
            Some(wait) => wait.min(Duration::from_secs(self.config.max_seconds)),
            None => self.backoff(attempt),
        }
    }

    /// base * 2^attempt capped at max, with multiplicative jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_seconds
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.config.max_seconds);
        let jitter = if self.config.jitter_factor > 0.0 {
            let spread = self.config.jitter_factor;
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        let secs = (exp as f64 * (1.0 + jitter)).max(0.0);
        Duration::from_secs_f64(secs.min(self.config.max_seconds as f64))
    }
}

/// Whether a response status warrants another attempt: server errors,
/// throttling, a depleted rate-limit window, or a caller-listed status.
pub fn should_retry(status: u16, headers: &[(String, String)], retry_on: &[u16]) -> bool {
    if retry_on.contains(&status) {
        return true;
    }
    if status >= 500 || status == 429 {
        return true;
    }
    if status == 403 {
        return header_value(headers, "x-ratelimit-remaining")
            .map(str::trim)
            .is_some_and(|v| v == "0");
    }
    false
}

/// Replace credential material in header values before they reach a log
/// line. Exact matches and `Bearer <token>` forms are both covered.
pub fn strip_sensitive_headers(
    headers: &[(String, String)],
    secrets: &[String],
) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let mut value = value.clone();
            for secret in secrets.iter().filter(|s| !s.is_empty()) {
                let bearer = format!("Bearer {secret}");
                if value.contains(&bearer) {
                    value = value.replace(&bearer, "Bearer xxxx");
                }
                if value.contains(secret.as_str()) {
                    value = value.replace(secret.as_str(), "xxxx");
                }
            }
            (name.clone(), value)
        })
        .collect()
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// A caller-nominated header can carry either a relative wait in seconds or
/// an absolute epoch timestamp; epoch values are far larger.
fn parse_wait_value(value: &str) -> Option<Duration> {
    let n: i64 = value.trim().parse().ok()?;
    if n > 1_000_000_000 {
        epoch_to_wait(n)
    } else {
        Some(Duration::from_secs(n.max(0) as u64))
    }
}

fn parse_epoch_wait(value: &str) -> Option<Duration> {
    epoch_to_wait(value.trim().parse().ok()?)
}

fn parse_seconds_wait(value: &str) -> Option<Duration> {
    let n: i64 = value.trim().parse().ok()?;
    Some(Duration::from_secs(n.max(0) as u64))
}

fn epoch_to_wait(epoch: i64) -> Option<Duration> {
    let wait = epoch - Utc::now().timestamp();
    Some(Duration::from_secs(wait.max(0) as u64))
}

/// Multipart forms are rebuilt per attempt; reqwest forms are single-use.
fn attach_body(
    req: reqwest::RequestBuilder,
    body: &ProxyBody,
) -> Result<reqwest::RequestBuilder, BrokerError> {
    match body {
        ProxyBody::Empty => Ok(req),
        ProxyBody::Raw(bytes) => Ok(req.body(bytes.clone())),
        ProxyBody::Multipart { fields, files } => {
            let mut form = reqwest::multipart::Form::new();
            for (name, value) in fields {
                form = form.text(name.clone(), value.clone());
            }
            for file in files {
                let mut part = reqwest::multipart::Part::bytes(file.bytes.clone());
                if let Some(file_name) = &file.file_name {
                    part = part.file_name(file_name.clone());
                }
                if let Some(content_type) = &file.content_type {
                    part = part.mime_str(content_type).map_err(|e| {
                        BrokerError::Internal(anyhow::anyhow!("invalid part content type: {e}"))
                    })?;
                }
                form = form.part(file.field.clone(), part);
            }
            Ok(req.multipart(form))
        }
    }
}

fn header_map(headers: &[(String, String)]) -> Result<HeaderMap, BrokerError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| BrokerError::Internal(anyhow::anyhow!("invalid header name: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| BrokerError::Internal(anyhow::anyhow!("invalid header value")))?;
        map.append(name, value);
    }
    Ok(map)
}

fn transport(attempts: u32, error: &reqwest::Error) -> BrokerError {
    BrokerError::Transport {
        attempts,
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    fn executor(jitter: f64) -> ProxyExecutor {
        ProxyExecutor::with_client(
            reqwest::Client::new(),
            ProxyRetryConfig {
                base_seconds: 3,
                max_seconds: 900,
                jitter_factor: jitter,
                max_retries: 10,
            },
        )
    }

    #[test]
    fn retry_predicate() {
        let none = headers(&[]);
        assert!(should_retry(500, &none, &[]));
        assert!(should_retry(503, &none, &[]));
        assert!(should_retry(429, &none, &[]));
        assert!(!should_retry(403, &none, &[]));
        assert!(should_retry(
            403,
            &headers(&[("x-ratelimit-remaining", "0")]),
            &[]
        ));
        assert!(!should_retry(
            403,
            &headers(&[("x-ratelimit-remaining", "12")]),
            &[]
        ));
        assert!(!should_retry(404, &none, &[]));
        assert!(should_retry(404, &none, &[404]));
        assert!(!should_retry(200, &none, &[]));
    }

    #[test]
    fn caller_retry_header_takes_priority() {
        let exec = executor(0.0);
        let policy = RetryPolicy {
            retry_header: Some("retry-after".into()),
            hints: RetryHeaderHints {
                at: Some("x-ratelimit-reset".into()),
                after: None,
            },
            ..Default::default()
        };
        let hs = headers(&[
            ("retry-after", "3"),
            ("x-ratelimit-reset", "9999999999"),
        ]);
        assert_eq!(exec.compute_wait(0, &hs, &policy), Duration::from_secs(3));
    }

    #[test]
    fn template_epoch_hint_converts_to_relative_wait() {
        let exec = executor(0.0);
        let policy = RetryPolicy {
            hints: RetryHeaderHints {
                at: Some("x-ratelimit-reset".into()),
                after: None,
            },
            ..Default::default()
        };
        let reset = (Utc::now().timestamp() + 40).to_string();
        let hs = headers(&[("x-ratelimit-reset", reset.as_str())]);
        let wait = exec.compute_wait(0, &hs, &policy);
        assert!(wait >= Duration::from_secs(38) && wait <= Duration::from_secs(41));
    }

    #[test]
    fn template_after_hint_is_relative_seconds() {
        let exec = executor(0.0);
        let policy = RetryPolicy {
            hints: RetryHeaderHints {
                at: None,
                after: Some("retry-after".into()),
            },
            ..Default::default()
        };
        let hs = headers(&[("retry-after", "7")]);
        assert_eq!(exec.compute_wait(0, &hs, &policy), Duration::from_secs(7));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let exec = executor(0.0);
        let policy = RetryPolicy::default();
        let none = headers(&[]);
        assert_eq!(exec.compute_wait(0, &none, &policy), Duration::from_secs(3));
        assert_eq!(exec.compute_wait(1, &none, &policy), Duration::from_secs(6));
        assert_eq!(exec.compute_wait(2, &none, &policy), Duration::from_secs(12));
        assert_eq!(
            exec.compute_wait(30, &none, &policy),
            Duration::from_secs(900)
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let exec = executor(0.1);
        let policy = RetryPolicy::default();
        let none = headers(&[]);
        for _ in 0..50 {
            let wait = exec.compute_wait(1, &none, &policy);
            assert!(wait >= Duration::from_secs_f64(5.4));
            assert!(wait <= Duration::from_secs_f64(6.6));
        }
    }

    #[test]
    fn header_hints_are_clamped_to_max() {
        let exec = executor(0.0);
        let policy = RetryPolicy {
            retry_header: Some("retry-after".into()),
            ..Default::default()
        };
        let hs = headers(&[("retry-after", "86400")]);
        assert_eq!(exec.compute_wait(0, &hs, &policy), Duration::from_secs(900));
    }

    #[test]
    fn negative_epoch_waits_are_zero() {
        let past = (Utc::now().timestamp() - 100).to_string();
        assert_eq!(parse_epoch_wait(&past), Some(Duration::ZERO));
    }

    #[test]
    fn redaction_masks_tokens_and_bearer_forms() {
        let hs = headers(&[
            ("authorization", "Bearer secret-token"),
            ("x-api-key", "secret-token"),
            ("accept", "application/json"),
        ]);
        let redacted = strip_sensitive_headers(&hs, &["secret-token".to_string()]);
        assert_eq!(redacted[0].1, "Bearer xxxx");
        assert_eq!(redacted[1].1, "xxxx");
        assert_eq!(redacted[2].1, "application/json");
    }

    #[test]
    fn redaction_ignores_empty_secrets() {
        let hs = headers(&[("accept", "application/json")]);
        let redacted = strip_sensitive_headers(&hs, &[String::new()]);
        assert_eq!(redacted[0].1, "application/json");
    }
}
