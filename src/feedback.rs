//! Backpressure feedback: events, levels, and the in-process pub/sub bus
//!
//! The queue publishes a [`FeedbackEvent`] on every watermark boundary
//! crossing; producers (or a webhook broadcaster) subscribe and modulate
//! their rate. Delivery is best-effort: a failing subscriber never affects
//! the publisher or the other subscribers.

use crate::error::SinkError;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Source tag stamped on every event emitted by this crate.
pub const FEEDBACK_SOURCE: &str = "store";

/// Backpressure severity, totally ordered: `ok < soft < hard`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureLevel {
    Ok,
    Soft,
    Hard,
}

impl BackpressureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Soft => "soft",
            Self::Hard => "hard",
        }
    }
}

impl fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a coordinator's backpressure state at emission time.
///
/// The wire format is forward-compatible JSON: consumers must ignore fields
/// they do not recognize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    pub coordinator_id: String,
    pub queue_size: usize,
    pub capacity: usize,
    pub level: BackpressureLevel,
    pub source: String,
    /// Seconds since the Unix epoch.
    pub ts: f64,
    #[serde(default)]
    pub reason: Option<String>,
}

impl FeedbackEvent {
    pub fn new(
        coordinator_id: impl Into<String>,
        queue_size: usize,
        capacity: usize,
        level: BackpressureLevel,
        reason: Option<&str>,
    ) -> Self {
        Self {
            coordinator_id: coordinator_id.into(),
            queue_size,
            capacity,
            level,
            source: FEEDBACK_SOURCE.to_string(),
            ts: unix_now(),
            reason: reason.map(str::to_string),
        }
    }

    /// Queue fill ratio; 0 when the capacity is 0.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.queue_size as f64 / self.capacity as f64
        }
    }
}

pub(crate) fn unix_now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// A feedback consumer registered on the bus.
///
/// Implementations must not acquire locks held by the publisher; they run on
/// the publisher's task.
#[async_trait]
pub trait FeedbackSubscriber: Send + Sync {
    async fn on_event(&self, event: &FeedbackEvent) -> Result<(), SinkError>;
}

/// Handle returned by [`FeedbackBus::subscribe`]; pass to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    subscriber: Arc<dyn FeedbackSubscriber>,
}

struct BusInner {
    subscribers: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

/// In-process pub/sub bus for [`FeedbackEvent`]s.
///
/// Subscribers are invoked sequentially in registration order. Errors and
/// panics from a subscriber are logged at debug level and otherwise
/// swallowed; `publish` never fails the publisher.
#[derive(Clone)]
pub struct FeedbackBus {
    inner: Arc<BusInner>,
}

impl Default for FeedbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FeedbackBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedbackBus").finish_non_exhaustive()
    }
}

impl FeedbackBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Process-wide default instance, initialized lazily.
    pub fn global() -> &'static FeedbackBus {
        static GLOBAL: OnceLock<FeedbackBus> = OnceLock::new();
        GLOBAL.get_or_init(FeedbackBus::new)
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn FeedbackSubscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.write().await.push(Registration { id, subscriber });
        id
    }

    /// Convenience wrapper for plain closures.
    pub async fn subscribe_fn<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&FeedbackEvent) + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnSubscriber(callback))).await
    }

    /// Remove a subscriber; returns false if the handle was already gone.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write().await;
        let before = subscribers.len();
        subscribers.retain(|registration| registration.id != id);
        subscribers.len() != before
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().await.len()
    }

    /// Deliver an event to every subscriber, isolating failures.
    pub async fn publish(&self, event: FeedbackEvent) {
        let snapshot: Vec<(SubscriptionId, Arc<dyn FeedbackSubscriber>)> = {
            let subscribers = self.inner.subscribers.read().await;
            subscribers
                .iter()
                .map(|registration| (registration.id, registration.subscriber.clone()))
                .collect()
        };
        for (id, subscriber) in snapshot {
            match AssertUnwindSafe(subscriber.on_event(&event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::debug!(subscription = id.0, error = %error, "feedback subscriber failed");
                }
                Err(_) => {
                    tracing::debug!(subscription = id.0, "feedback subscriber panicked");
                }
            }
        }
    }
}

struct FnSubscriber<F>(F);

#[async_trait]
impl<F> FeedbackSubscriber for FnSubscriber<F>
where
    F: Fn(&FeedbackEvent) + Send + Sync,
{
    async fn on_event(&self, event: &FeedbackEvent) -> Result<(), SinkError> {
        (self.0)(event);
        Ok(())
    }
}
