//! Rate-limit-aware HTTP JSON retrieval.
//!
//! All provider calls go through [`RateLimitedFetcher::get_json`], which
//! retries timeouts and 5xx responses on a capped exponential backoff with
//! jitter, and honors a numeric `Retry-After` hint on 429. Exhausting every
//! attempt is a hard failure — callers never see a silent empty result.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::warn;

use crate::config::HTTP_TIMEOUT_SECS;
use crate::error::{AppError, Result};

/// Time source abstraction so retry behavior is testable without real delays.
pub trait Clock: Send + Sync {
    fn sleep(&self, d: Duration) -> impl std::future::Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

/// Explicit retry policy: attempts, backoff schedule bounds, and whether a
/// provider-supplied rate-limit hint overrides the schedule.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Backoff for attempt `n` is `base_secs * 2^n` seconds plus jitter.
    pub base_secs: f64,
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to each backoff, in seconds.
    pub jitter_secs: f64,
    pub honor_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_secs: 1.0,
            max_delay: Duration::from_secs(60),
            jitter_secs: 1.0,
            honor_retry_after: true,
        }
    }
}

impl RetryPolicy {
    /// Capped exponential backoff with uniform jitter for the given attempt
    /// (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_secs > 0.0 {
            rand::random::<f64>() * self.jitter_secs
        } else {
            0.0
        };
        let secs = self.base_secs * f64::from(2u32.saturating_pow(attempt.min(30))) + jitter;
        Duration::from_secs_f64(secs).min(self.max_delay)
    }

    /// Delay before retrying a rate-limited request. A numeric provider hint
    /// wins exactly as given (capping would under-wait and re-trip the limit);
    /// otherwise the normal backoff schedule applies.
    pub fn rate_limit_delay(&self, attempt: u32, retry_after: Option<u64>) -> Duration {
        match retry_after {
            Some(secs) if self.honor_retry_after => Duration::from_secs(secs),
            _ => self.backoff_delay(attempt),
        }
    }
}

pub struct RateLimitedFetcher<C: Clock = TokioClock> {
    client: reqwest::Client,
    policy: RetryPolicy,
    clock: C,
}

impl RateLimitedFetcher<TokioClock> {
    pub fn new(policy: RetryPolicy) -> Result<Self> {
        Self::with_clock(policy, TokioClock)
    }
}

impl<C: Clock> RateLimitedFetcher<C> {
    pub fn with_clock(policy: RetryPolicy, clock: C) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, policy, clock })
    }

    /// Deliberate pacing between extraction units (backpressure toward the
    /// provider, not error recovery).
    pub async fn throttle(&self, secs: f64) {
        if secs > 0.0 {
            self.clock.sleep(Duration::from_secs_f64(secs)).await;
        }
    }

    /// GET a JSON document, retrying transient failures per the policy.
    pub async fn get_json(&self, url: &str, params: &[(&str, String)]) -> Result<serde_json::Value> {
        let mut last_err = String::new();

        for attempt in 1..=self.policy.max_attempts {
            let resp = match self.client.get(url).query(params).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    last_err = e.to_string();
                    let wait = self.policy.backoff_delay(attempt);
                    warn!(
                        "Request error: {e}. Retry {attempt}/{} in {:.1}s",
                        self.policy.max_attempts,
                        wait.as_secs_f64(),
                    );
                    self.clock.sleep(wait).await;
                    continue;
                }
            };

            let status = resp.status();

            if status.is_success() {
                // Body reads can still time out or decode badly mid-stream;
                // treat that like any other transient request error.
                match resp.json::<serde_json::Value>().await {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        last_err = e.to_string();
                        let wait = self.policy.backoff_delay(attempt);
                        warn!(
                            "Response body error: {e}. Retry {attempt}/{} in {:.1}s",
                            self.policy.max_attempts,
                            wait.as_secs_f64(),
                        );
                        self.clock.sleep(wait).await;
                        continue;
                    }
                }
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok());
                let wait = self.policy.rate_limit_delay(attempt, retry_after);
                last_err = format!("HTTP 429 from {url}");
                warn!(
                    "HTTP 429 (rate limit). Retry {attempt}/{} in {:.1}s",
                    self.policy.max_attempts,
                    wait.as_secs_f64(),
                );
                self.clock.sleep(wait).await;
                continue;
            }

            if status.is_server_error() {
                let wait = self.policy.backoff_delay(attempt);
                last_err = format!("HTTP {status} from {url}");
                warn!(
                    "HTTP {status}. Retry {attempt}/{} in {:.1}s",
                    self.policy.max_attempts,
                    wait.as_secs_f64(),
                );
                self.clock.sleep(wait).await;
                continue;
            }

            // Remaining 4xx statuses are not retryable
            return Err(AppError::Provider(format!("HTTP {status} from {url}")));
        }

        Err(AppError::Provider(format!(
            "failed to GET {url} after {} attempts. Last error: {last_err}",
            self.policy.max_attempts,
        )))
    }
}
