//! Convenient re-exports for common Floodgate types.
pub use crate::{
    BackpressureLevel, BoundedQueue, BreakerConfig, CircuitBreaker, CircuitState,
    ConfigError, CoordinatorConfig, CoordinatorHealth, DeadLetterQueue, DlqRecord,
    FailureKind, FeedbackBus, FeedbackEvent, FeedbackSubscriber, OverflowStrategy,
    RetryConfig, RetryPolicy, Sink, SinkError, SubmitError, SubmitManyError,
    WriteCoordinator,
};

#[cfg(feature = "webhook")]
pub use crate::HttpBroadcaster;
