//! HTTP plumbing shared by the source and destination clients: retry
//! classification, backoff, request pacing and client construction.

use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::Instant;

pub const CRATE_NAME: &str = "gscsync-http";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Rate-limit response from the remote API.
    Throttled,
    /// Server-side or network failure that may succeed on a later attempt.
    Transient,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Throttled
    } else if status.is_server_error() {
        RetryDisposition::Transient
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Transient
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limited by {url}")]
    Throttled {
        url: String,
        retry_after: Option<Duration>,
    },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected response shape from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("cannot build request url from {0}")]
    InvalidUrl(String),
}

impl ApiError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            ApiError::Throttled { .. } => RetryDisposition::Throttled,
            ApiError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            ApiError::Request(err) => classify_reqwest_error(err),
            ApiError::Decode { .. } | ApiError::InvalidUrl(_) => RetryDisposition::NonRetryable,
        }
    }

    /// Server-supplied delay, only present on throttle responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Pass successful responses through; turn anything else into an [`ApiError`].
pub async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let url = resp.url().to_string();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        return Err(ApiError::Throttled { url, retry_after });
    }

    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::HttpStatus {
        status: status.as_u16(),
        url,
        body: truncate_for_log(&body, 512),
    })
}

/// Longest server-requested wait we honour; larger hints are clamped.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// `Retry-After` in its delay-seconds form, clamped to [`MAX_RETRY_AFTER`].
/// HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    let delay = Duration::try_from_secs_f64(secs).unwrap_or(MAX_RETRY_AFTER);
    Some(delay.min(MAX_RETRY_AFTER))
}

fn truncate_for_log(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
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
            max_retries: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Exponential delay plus up to 25% random extra, so clients throttled
    /// together do not retry in lockstep.
    pub fn jittered_delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        let spread = delay.as_millis() as u64 / 4;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=spread))
    }

    /// Wait before retry `attempt_index`; a server hint longer than our own
    /// backoff wins.
    pub fn retry_delay(&self, attempt_index: usize, server_hint: Option<Duration>) -> Duration {
        let ours = self.jittered_delay_for_attempt(attempt_index);
        match server_hint {
            Some(hint) if hint > ours => hint,
            _ => ours,
        }
    }
}

/// Cooperative request pacing: consecutive dispatches are spaced at least
/// `1 / rate` seconds apart. There is no burst credit.
#[derive(Debug)]
pub struct Pacer {
    min_interval: Duration,
    last_dispatch: Option<Instant>,
}

pub const MIN_RATE_PER_SEC: f64 = 0.1;

impl Pacer {
    pub fn per_second(rate: f64) -> Self {
        let rate = if rate.is_finite() { rate.max(MIN_RATE_PER_SEC) } else { MIN_RATE_PER_SEC };
        Self {
            min_interval: Duration::from_secs_f64(1.0 / rate),
            last_dispatch: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Suspend until the next dispatch is allowed, then claim the slot.
    /// Returns how long the caller was held back.
    pub async fn wait(&mut self) -> Duration {
        let mut waited = Duration::ZERO;
        if let Some(last) = self.last_dispatch {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                waited = self.min_interval - elapsed;
                tracing::trace!(wait_ms = waited.as_millis() as u64, "pacing request");
                tokio::time::sleep(waited).await;
            }
        }
        self.last_dispatch = Some(Instant::now());
        waited
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("gscsync/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

pub fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_a_quarter_above_the_base_delay() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(10),
        };
        for attempt in 0..4 {
            let base = policy.delay_for_attempt(attempt);
            for _ in 0..50 {
                let jittered = policy.jittered_delay_for_attempt(attempt);
                assert!(jittered >= base);
                assert!(jittered <= base + base / 4);
            }
        }
    }

    #[test]
    fn longer_server_hint_overrides_backoff() {
        let policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(
            policy.retry_delay(0, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert!(policy.retry_delay(0, Some(Duration::from_millis(1))) >= Duration::from_millis(100));
    }

    #[test]
    fn statuses_are_classified() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Throttled
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Transient
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
        let err = ApiError::HttpStatus {
            status: 503,
            url: "https://example.test".into(),
            body: String::new(),
        };
        assert_eq!(err.disposition(), RetryDisposition::Transient);
    }

    #[test]
    fn retry_after_accepts_delay_seconds_only() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 0.5 "), Some(Duration::from_millis(500)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after("-1"), None);
    }

    #[test]
    fn oversized_retry_after_is_clamped() {
        assert_eq!(parse_retry_after("1e30"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("inf"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("86400"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("NaN"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_dispatches_by_min_interval() {
        let mut pacer = Pacer::per_second(4.0);
        let started = Instant::now();

        assert_eq!(pacer.wait().await, Duration::ZERO);
        for _ in 0..4 {
            pacer.wait().await;
        }

        assert!(started.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_does_not_wait_after_idle_gap() {
        let mut pacer = Pacer::per_second(2.0);
        pacer.wait().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pacer.wait().await, Duration::ZERO);
    }

    #[test]
    fn pacer_clamps_tiny_rates() {
        let pacer = Pacer::per_second(0.0);
        assert_eq!(pacer.min_interval(), Duration::from_secs(10));
    }
}
