//! Rate-limit governor
//!
//! Turns a raw [`PushResult`] into one of three outcomes and computes how
//! long the work loop should stay paused after the destination throttles.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{Rng, thread_rng};
use regex::{Regex, RegexBuilder};

use super::push::{PushError, PushResult};
use crate::config::{ConfigError, RateLimitPolicyConfig};
use crate::models::ItemError;

/// Error codes the destination uses for throttling.
const RATE_LIMIT_CODES: &[&str] = &["RATE_LIMITED", "TOO_MANY_REQUESTS", "THROTTLED"];

/// Classified push outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Ok,
    /// The item must be retried after a pause; it is not failed
    RateLimited {
        retry_after_secs: Option<u64>,
        code: String,
        message: String,
    },
    /// Non-throttling failure; the item is marked failed and the job moves on
    HardFailure(ItemError),
}

/// Decides whether a push failure is throttling.
pub trait ThrottleDetector: Send + Sync {
    fn is_rate_limited(&self, error: &PushError) -> bool;
}

/// Default detection: HTTP 429, a throttling error code or a message matching
/// one of the configured patterns. Transport failures never count.
#[derive(Debug, Clone)]
pub struct PatternThrottleDetector {
    patterns: Vec<Regex>,
}

impl PatternThrottleDetector {
    pub fn new(patterns: &[String]) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| ConfigError::InvalidRateLimitPattern {
                        pattern: pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }
}

impl ThrottleDetector for PatternThrottleDetector {
    fn is_rate_limited(&self, error: &PushError) -> bool {
        if matches!(error, PushError::Network { .. }) {
            return false;
        }
        if error.status() == Some(429) {
            return true;
        }
        if let Some(code) = error.code()
            && RATE_LIMIT_CODES
                .iter()
                .any(|known| known.eq_ignore_ascii_case(code))
        {
            return true;
        }
        let message = error.message();
        self.patterns.iter().any(|pattern| pattern.is_match(message))
    }
}

/// Classification plus resume-time policy.
#[derive(Clone)]
pub struct RateLimitGovernor {
    policy: RateLimitPolicyConfig,
    detector: Arc<dyn ThrottleDetector>,
}

impl std::fmt::Debug for RateLimitGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitGovernor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RateLimitGovernor {
    pub fn new(policy: RateLimitPolicyConfig) -> Result<Self, ConfigError> {
        let detector = PatternThrottleDetector::new(&policy.message_patterns)?;
        Ok(Self::with_detector(policy, Arc::new(detector)))
    }

    /// Governor with a custom throttling detector.
    pub fn with_detector(
        policy: RateLimitPolicyConfig,
        detector: Arc<dyn ThrottleDetector>,
    ) -> Self {
        Self { policy, detector }
    }

    pub fn classify(&self, result: &PushResult) -> PushOutcome {
        let error = match result {
            Ok(_) => return PushOutcome::Ok,
            Err(error) => error,
        };

        if self.detector.is_rate_limited(error) {
            return PushOutcome::RateLimited {
                retry_after_secs: error.retry_after_secs(),
                code: error.code().unwrap_or("RATE_LIMITED").to_string(),
                message: error.message().to_string(),
            };
        }

        PushOutcome::HardFailure(ItemError {
            code: error.code().map(str::to_string),
            message: error.message().to_string(),
            status: error.status(),
        })
    }

    /// Pause length for a throttled push.
    ///
    /// A server hint is honoured as given (clamped to the policy bounds);
    /// otherwise `base * 2^previous_pauses` plus jitter. Never shorter than
    /// `min_seconds`, so a zero hint cannot spin.
    pub fn resume_delay(&self, retry_after_secs: Option<u64>, previous_pauses: u32) -> Duration {
        let min_seconds = self.policy.min_seconds.max(1) as f64;
        let max_seconds = (self.policy.max_seconds as f64).max(min_seconds);

        let seconds = match retry_after_secs {
            Some(hint) => hint as f64,
            None => {
                let backoff = (self.policy.base_seconds as f64
                    * 2_f64.powi(previous_pauses.min(30) as i32))
                .min(max_seconds);
                let jitter_range = self.policy.jitter_factor * backoff;
                let jitter = if jitter_range > 0.0 {
                    thread_rng().gen_range(0.0..jitter_range)
                } else {
                    0.0
                };
                backoff + jitter
            }
        };

        Duration::from_secs_f64(seconds.clamp(min_seconds, max_seconds))
    }

    /// Absolute resume time for a pause starting at `now`.
    pub fn retry_at(
        &self,
        now: DateTime<Utc>,
        retry_after_secs: Option<u64>,
        previous_pauses: u32,
    ) -> (DateTime<Utc>, Duration) {
        let delay = self.resume_delay(retry_after_secs, previous_pauses);
        let at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        (at, delay)
    }
}
