//! Error types for the write coordinator

use std::fmt;
use thiserror::Error;

/// Boxed error produced by a [`Sink`](crate::Sink) write.
///
/// The coordinator never inspects the concrete type beyond what the retry
/// classifier needs, so any store error passes through unmodified.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Error returned from [`WriteCoordinator::submit`](crate::WriteCoordinator::submit).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The queue is at capacity and the overflow strategy is `error`.
    #[error("queue is full ({capacity} items)")]
    QueueFull { capacity: usize },
    /// Shutdown has begun; the submission was not accepted.
    #[error("coordinator is shutting down")]
    ShuttingDown,
}

/// Partial-progress error from [`WriteCoordinator::submit_many`](crate::WriteCoordinator::submit_many).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("submitted {submitted} items before failing: {source}")]
pub struct SubmitManyError {
    /// Items accepted before the failure.
    pub submitted: usize,
    #[source]
    pub source: SubmitError,
}

/// Error returned from [`BoundedQueue::put`](crate::BoundedQueue::put).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnqueueError {
    /// At capacity under the `error` overflow strategy.
    #[error("queue is full ({capacity} items)")]
    Full { capacity: usize },
    /// The queue was stopped.
    #[error("queue is stopped")]
    Closed,
}

/// The circuit breaker refused the call.
///
/// Internal to the write path: workers route the batch to the dead-letter
/// queue instead of surfacing this to submitters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit breaker open ({consecutive_failures} consecutive failures)")]
pub struct CircuitOpen {
    pub consecutive_failures: usize,
}

/// Invalid configuration, rejected eagerly at construction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid { key, reason: reason.into() }
    }
}

/// Why a batch (or item) failed its write and where it ended up.
///
/// Used as the `error_kind` of dead-letter records and as the `error_kind`
/// label on `write_errors_total` / `items_dropped_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Classified non-retryable on first sight.
    Terminal,
    /// Retryable, but every attempt failed.
    RetryExhausted,
    /// The breaker was open; the sink was never called.
    CircuitOpen,
    /// The sink panicked; converted to a terminal failure.
    Panic,
    /// Shutdown interrupted the write before it could complete.
    Shutdown,
    /// Evicted from the queue under the `drop_oldest` strategy.
    Overflow,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::RetryExhausted => "retry_exhausted",
            Self::CircuitOpen => "circuit_open",
            Self::Panic => "panic",
            Self::Shutdown => "shutdown",
            Self::Overflow => "overflow",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
