//! Scheduling of capability calls: per-minute spacing, a daily budget,
//! bounded concurrency, and exponential backoff on transient failures.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, warn};

use crate::config::{RateLimitConfig, RetryConfig};
use crate::error::{CapabilityError, TransientExternalError};
use crate::extract::capability::{CapabilityRequest, CapabilityResponse, ExtractionCapability};
use crate::TARGET_LLM_REQUEST;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// How a capability call ended, after retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    /// Transient failures outlasted the retry cap, or the daily budget ran out.
    SoftFailure,
    HardFailure,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::SoftFailure => "soft_failure",
            CallOutcome::HardFailure => "hard_failure",
        }
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(CallOutcome::Success),
            "soft_failure" => Ok(CallOutcome::SoftFailure),
            "hard_failure" => Ok(CallOutcome::HardFailure),
            other => Err(format!("unknown call outcome '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallReport {
    pub outcome: CallOutcome,
    pub retries: u32,
    pub response: Option<CapabilityResponse>,
    pub error: Option<CapabilityError>,
}

impl CallReport {
    pub fn detail(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

struct LimiterState {
    next_slot: Instant,
    day_start: Instant,
    used_today: u32,
}

/// Spaces calls evenly across the minute and enforces a rolling daily budget.
pub struct RateLimiter {
    state: Mutex<LimiterState>,
    min_interval: Duration,
    per_day: u32,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, requests_per_day: u32) -> Self {
        let min_interval = if requests_per_minute == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(60) / requests_per_minute
        };
        let now = Instant::now();
        Self {
            state: Mutex::new(LimiterState {
                next_slot: now,
                day_start: now,
                used_today: 0,
            }),
            min_interval,
            per_day: requests_per_day,
        }
    }

    /// Waits for the next free slot. Fails without waiting once the daily
    /// budget is spent.
    pub async fn acquire(&self) -> Result<(), TransientExternalError> {
        let wait = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            if now.duration_since(state.day_start) >= DAY {
                state.day_start = now;
                state.used_today = 0;
            }
            if state.used_today >= self.per_day {
                return Err(TransientExternalError::BudgetExhausted(self.per_day));
            }
            state.used_today += 1;

            let slot = state.next_slot.max(now);
            state.next_slot = slot + self.min_interval;
            slot.duration_since(now)
        };

        if !wait.is_zero() {
            debug!(target: TARGET_LLM_REQUEST, "Rate limiter: waiting {:?}", wait);
            sleep(wait).await;
        }
        Ok(())
    }
}

/// Runs capability calls through the rate limiter and a concurrency limit,
/// retrying transient failures with exponential backoff.
pub struct CallScheduler {
    capability: Arc<dyn ExtractionCapability>,
    limiter: RateLimiter,
    permits: Semaphore,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl CallScheduler {
    pub fn new(
        capability: Arc<dyn ExtractionCapability>,
        rate_limit: &RateLimitConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            capability,
            limiter: RateLimiter::new(rate_limit.requests_per_minute, rate_limit.requests_per_day),
            permits: Semaphore::new(rate_limit.max_concurrent.max(1)),
            retry,
            call_timeout: rate_limit.call_timeout,
        }
    }

    pub async fn call(&self, request: &CapabilityRequest) -> CallReport {
        let mut retries = 0;

        loop {
            match self.attempt(request).await {
                Ok(response) => {
                    debug!(
                        target: TARGET_LLM_REQUEST,
                        "{} call for article {} succeeded after {} retries",
                        request.kind, request.article_id, retries
                    );
                    return CallReport {
                        outcome: CallOutcome::Success,
                        retries,
                        response: Some(response),
                        error: None,
                    };
                }
                Err(err @ CapabilityError::Hard(_)) => {
                    error!(
                        target: TARGET_LLM_REQUEST,
                        "{} call for article {} failed: {}", request.kind, request.article_id, err
                    );
                    return CallReport {
                        outcome: CallOutcome::HardFailure,
                        retries,
                        response: None,
                        error: Some(err),
                    };
                }
                Err(err @ CapabilityError::Transient(TransientExternalError::BudgetExhausted(_))) => {
                    warn!(
                        target: TARGET_LLM_REQUEST,
                        "{} call for article {} skipped: {}", request.kind, request.article_id, err
                    );
                    return CallReport {
                        outcome: CallOutcome::SoftFailure,
                        retries,
                        response: None,
                        error: Some(err),
                    };
                }
                Err(err) => {
                    if retries >= self.retry.max_retries {
                        warn!(
                            target: TARGET_LLM_REQUEST,
                            "{} call for article {} gave up after {} retries: {}",
                            request.kind, request.article_id, retries, err
                        );
                        return CallReport {
                            outcome: CallOutcome::SoftFailure,
                            retries,
                            response: None,
                            error: Some(err),
                        };
                    }
                    let delay = self.backoff(retries);
                    warn!(
                        target: TARGET_LLM_REQUEST,
                        "{} call for article {} failed ({}), retrying in {:?} ({}/{})",
                        request.kind, request.article_id, err, delay, retries + 1, self.retry.max_retries
                    );
                    sleep(delay).await;
                    retries += 1;
                }
            }
        }
    }

    async fn attempt(&self, request: &CapabilityRequest) -> Result<CapabilityResponse, CapabilityError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CapabilityError::Hard("call scheduler closed".into()))?;
        self.limiter.acquire().await?;

        match timeout(self.call_timeout, self.capability.extract(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransientExternalError::Timeout(self.call_timeout).into()),
        }
    }

    /// Delay before retry number `retry + 1`.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.retry.backoff(retry)
    }
}

impl RetryConfig {
    /// Exponential delay before retry number `retry + 1`, capped at
    /// `max_backoff` before jitter is added. Never panics, whatever the
    /// configured values; a delay that cannot be represented becomes
    /// `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if base.is_nan() {
            self.max_backoff.as_secs_f64()
        } else {
            base.min(self.max_backoff.as_secs_f64())
        };
        let jitter = if self.jitter.is_finite() && self.jitter > 0.0 {
            rand::rng().random_range(0.0..=self.jitter.min(1.0))
        } else {
            0.0
        };
        Duration::try_from_secs_f64(capped * (1.0 + jitter)).unwrap_or(self.max_backoff)
    }
}
