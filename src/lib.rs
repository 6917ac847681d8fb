#![forbid(unsafe_code)]

//! # Floodgate
//!
//! Backpressure-aware write coordination for async Rust: absorb bursts of
//! typed records, batch them, persist them through a pluggable [`Sink`], and
//! push backpressure feedback to producers.
//!
//! ## Features
//!
//! - **Bounded queue** with high/low watermarks that publish
//!   [`FeedbackEvent`]s on boundary crossings only
//! - **Batching worker pool** with size- and time-bounded flushes
//! - **Retry policy** with exponential backoff, jitter, and pluggable
//!   failure classification
//! - **Circuit breaker** with single-trial half-open recovery
//! - **Dead-letter queue**: append-only JSONL capture of failed batches
//! - **Webhook broadcaster** (feature `webhook`) forwarding feedback events
//!   over HTTP
//!
//! ## Quick Start
//!
//! ```rust
//! use async_trait::async_trait;
//! use floodgate::{CoordinatorConfig, Sink, SinkError, WriteCoordinator};
//! use std::sync::Mutex;
//! use std::time::Duration;
//!
//! #[derive(Default)]
//! struct VecSink {
//!     rows: Mutex<Vec<u64>>,
//! }
//!
//! #[async_trait]
//! impl Sink<u64> for VecSink {
//!     async fn write(&self, batch: &[u64]) -> Result<(), SinkError> {
//!         self.rows.lock().unwrap().extend_from_slice(batch);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoordinatorConfig {
//!         capacity: 1_000,
//!         workers: 2,
//!         batch_size: 100,
//!         flush_interval: Duration::from_millis(50),
//!         ..Default::default()
//!     };
//!     let coordinator = WriteCoordinator::new(VecSink::default(), config)?;
//!
//!     for tick in 0..500u64 {
//!         coordinator.submit(tick).await?;
//!     }
//!     coordinator.stop(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

mod breaker;
mod config;
mod coordinator;
mod dlq;
mod error;
mod feedback;
mod queue;
mod retry;
mod sink;
mod sleeper;
mod worker;

pub mod metrics;
#[cfg(feature = "webhook")]
mod webhook;

// Re-exports
pub use breaker::{CircuitBreaker, CircuitState};
pub use config::{BreakerConfig, CoordinatorConfig, RetryConfig, WebhookConfig};
pub use coordinator::{CoordinatorBuilder, CoordinatorHealth, WriteCoordinator};
pub use dlq::{DeadLetterQueue, DlqError, DlqRecord};
pub use error::{
    CircuitOpen, ConfigError, EnqueueError, FailureKind, SinkError, SubmitError, SubmitManyError,
};
pub use feedback::{
    BackpressureLevel, FeedbackBus, FeedbackEvent, FeedbackSubscriber, SubscriptionId,
    FEEDBACK_SOURCE,
};
pub use queue::{BoundedQueue, OverflowStrategy, QueueOptions};
pub use retry::{default_classifier, RetryBuildError, RetryPolicy, RetryPolicyBuilder};
pub use sink::Sink;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
#[cfg(feature = "webhook")]
pub use webhook::HttpBroadcaster;

pub mod prelude;
