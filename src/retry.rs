//! Retry policy: exponential backoff with jitter and failure classification
//!
//! The policy decides two things for the sink workers: how long to wait
//! before attempt `n + 1`, and whether an error is worth retrying at all.

use crate::config::RetryConfig;
use crate::error::SinkError;
use crate::{Sleeper, TokioSleeper};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Keywords that mark a sink error as transient when they appear anywhere in
/// the error chain's messages.
const TRANSIENT_KEYWORDS: [&str; 5] =
    ["timeout", "temporary", "unavailable", "connection", "deadlock"];

/// Default retryability classifier.
///
/// Walks the error's `source()` chain; an error is retryable when any link is
/// an `std::io::Error` with a transient kind, or any link's message contains
/// one of the transient keywords (case-insensitive). Everything else is
/// treated as permanent.
pub fn default_classifier(error: &SinkError) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> =
        Some(&**error as &(dyn std::error::Error + 'static));
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            if matches!(
                io.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::Interrupted
                    | ErrorKind::WouldBlock
            ) {
                return true;
            }
        }
        let message = err.to_string().to_ascii_lowercase();
        if TRANSIENT_KEYWORDS.iter().any(|kw| message.contains(kw)) {
            return true;
        }
        current = err.source();
    }
    false
}

/// Backoff and classification policy for sink writes.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter: bool,
    classifier: Arc<dyn Fn(&SinkError) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("multiplier", &self.multiplier)
            .field("jitter", &self.jitter)
            .field("classifier", &"<classifier>")
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Build a policy from configuration; classifier and sleeper stay default.
    pub fn from_config(config: &RetryConfig) -> Result<Self, RetryBuildError> {
        Self::builder()
            .max_attempts(config.max_attempts)
            .initial_backoff(config.initial_backoff)
            .max_backoff(config.max_backoff)
            .multiplier(config.backoff_multiplier)
            .jitter(config.jitter)
            .build()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Delay before retrying after the given 0-indexed attempt:
    /// `min(max_backoff, initial_backoff * multiplier^attempt)`, scaled by a
    /// uniform factor in `[0.5, 1.0]` when jitter is enabled.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let raw = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_backoff.as_secs_f64());
        let mut delay = Duration::from_secs_f64(capped);
        if self.jitter {
            delay = delay.mul_f64(rand::rng().random_range(0.5..=1.0));
        }
        delay
    }

    /// Whether the configured classifier considers this error transient.
    pub fn is_retryable(&self, error: &SinkError) -> bool {
        (self.classifier)(error)
    }

    pub(crate) async fn sleep_backoff(&self, attempt: usize) {
        self.sleeper.sleep(self.backoff(attempt)).await;
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::new().build().expect("default retry policy is valid")
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RetryBuildError {
    #[error("max_attempts must be > 0")]
    ZeroAttempts,
    #[error("backoff_multiplier must be >= 1.0 (got {0})")]
    MultiplierBelowOne(f64),
    #[error("initial backoff {initial:?} exceeds max backoff {max:?}")]
    BackoffRange { initial: Duration, max: Duration },
}

pub struct RetryPolicyBuilder {
    max_attempts: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    jitter: bool,
    classifier: Arc<dyn Fn(&SinkError) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_backoff: defaults.initial_backoff,
            max_backoff: defaults.max_backoff,
            multiplier: defaults.backoff_multiplier,
            jitter: defaults.jitter,
            classifier: Arc::new(default_classifier),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    pub fn max_backoff(mut self, cap: Duration) -> Self {
        self.max_backoff = cap;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Replace the retryability classifier.
    pub fn classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&SinkError) -> bool + Send + Sync + 'static,
    {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Replace the sleeper (useful for deterministic tests).
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub(crate) fn with_arc_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> Result<RetryPolicy, RetryBuildError> {
        if self.max_attempts == 0 {
            return Err(RetryBuildError::ZeroAttempts);
        }
        if !(self.multiplier >= 1.0) {
            return Err(RetryBuildError::MultiplierBelowOne(self.multiplier));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(RetryBuildError::BackoffRange {
                initial: self.initial_backoff,
                max: self.max_backoff,
            });
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            multiplier: self.multiplier,
            jitter: self.jitter,
            classifier: self.classifier,
            sleeper: self.sleeper,
        })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
