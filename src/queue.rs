//! Capacity-limited FIFO with watermark-driven backpressure feedback

use crate::error::EnqueueError;
use crate::feedback::{BackpressureLevel, FeedbackBus, FeedbackEvent};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// What `put` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowStrategy {
    /// Suspend the producer until space frees up. Preserves every item.
    #[default]
    Block,
    /// Evict the oldest item to make room, handing it to the on-drop callback.
    DropOldest,
    /// Fail fast with [`EnqueueError::Full`].
    Error,
}

impl OverflowStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::DropOldest => "drop_oldest",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for OverflowStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(Self::Block),
            "drop_oldest" => Ok(Self::DropOldest),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown overflow strategy {other:?}")),
        }
    }
}

/// Construction parameters for [`BoundedQueue`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub capacity: usize,
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub strategy: OverflowStrategy,
    pub coord_id: String,
}

struct QueueState<T> {
    items: VecDeque<T>,
    stopped: bool,
    soft_fired: bool,
    hard_fired: bool,
}

enum PutOutcome<T> {
    Stored(Option<FeedbackEvent>),
    Displaced { evicted: T, event: Option<FeedbackEvent> },
    Rejected,
    Closed,
    MustWait,
}

enum GetOutcome<T> {
    Item(T, Option<FeedbackEvent>),
    Drained,
    MustWait,
}

/// Bounded FIFO with high/low watermarks.
///
/// Feedback events are emitted on watermark *transitions* only: entering
/// soft, entering hard, and recovering to ok once the depth falls back to
/// the low watermark. The decision is made while holding the state lock, so
/// at most one event fires per boundary crossing; publication happens after
/// the lock is released.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_full: Notify,
    not_empty: Notify,
    capacity: usize,
    high_watermark: usize,
    low_watermark: usize,
    strategy: OverflowStrategy,
    coord_id: String,
    bus: FeedbackBus,
    on_drop: Option<Arc<dyn Fn(T) + Send + Sync>>,
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("high_watermark", &self.high_watermark)
            .field("low_watermark", &self.low_watermark)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl<T> BoundedQueue<T> {
    pub fn new(options: QueueOptions, bus: FeedbackBus) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                stopped: false,
                soft_fired: false,
                hard_fired: false,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
            capacity: options.capacity,
            high_watermark: options.high_watermark,
            low_watermark: options.low_watermark,
            strategy: options.strategy,
            coord_id: options.coord_id,
            bus,
            on_drop: None,
        }
    }

    /// Install the callback invoked with each item evicted under
    /// `drop_oldest`. Must be set before the queue is shared.
    pub fn with_on_drop<F>(mut self, callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on_drop = Some(Arc::new(callback));
        self
    }

    /// Enqueue one item, honoring the overflow strategy.
    pub async fn put(&self, item: T) -> Result<(), EnqueueError> {
        let mut pending = Some(item);
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);

            let outcome = {
                let mut state = self.state.lock().expect("queue state poisoned");
                if state.stopped {
                    PutOutcome::Closed
                } else if state.items.len() < self.capacity {
                    state.items.push_back(pending.take().expect("pending item"));
                    PutOutcome::Stored(self.check_transition(&mut state))
                } else {
                    match self.strategy {
                        OverflowStrategy::Error => PutOutcome::Rejected,
                        OverflowStrategy::DropOldest => {
                            let evicted =
                                state.items.pop_front().expect("non-empty at capacity");
                            state.items.push_back(pending.take().expect("pending item"));
                            PutOutcome::Displaced {
                                evicted,
                                event: self.check_transition(&mut state),
                            }
                        }
                        OverflowStrategy::Block => {
                            // Register for a wakeup before releasing the lock
                            // so a concurrent dequeue cannot be missed.
                            notified.as_mut().enable();
                            PutOutcome::MustWait
                        }
                    }
                }
            };

            match outcome {
                PutOutcome::Stored(event) => {
                    self.not_empty.notify_one();
                    if let Some(event) = event {
                        self.bus.publish(event).await;
                    }
                    return Ok(());
                }
                PutOutcome::Displaced { evicted, event } => {
                    self.not_empty.notify_one();
                    if let Some(callback) = &self.on_drop {
                        callback(evicted);
                    }
                    if let Some(event) = event {
                        self.bus.publish(event).await;
                    }
                    return Ok(());
                }
                PutOutcome::Rejected => {
                    return Err(EnqueueError::Full { capacity: self.capacity })
                }
                PutOutcome::Closed => return Err(EnqueueError::Closed),
                PutOutcome::MustWait => notified.await,
            }
        }
    }

    /// Dequeue one item, suspending while the queue is empty.
    ///
    /// Returns `None` only once the queue is stopped *and* drained, so
    /// consumers can finish outstanding work during shutdown.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);

            let outcome = {
                let mut state = self.state.lock().expect("queue state poisoned");
                if let Some(item) = state.items.pop_front() {
                    GetOutcome::Item(item, self.check_transition(&mut state))
                } else if state.stopped {
                    GetOutcome::Drained
                } else {
                    notified.as_mut().enable();
                    GetOutcome::MustWait
                }
            };

            match outcome {
                GetOutcome::Item(item, event) => {
                    self.not_full.notify_one();
                    if let Some(event) = event {
                        self.bus.publish(event).await;
                    }
                    return Some(item);
                }
                GetOutcome::Drained => return None,
                GetOutcome::MustWait => notified.await,
            }
        }
    }

    /// Stop the queue: subsequent `put`s fail, blocked producers and
    /// consumers wake, and `get` drains the remaining items before
    /// returning `None`.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().expect("queue state poisoned");
            state.stopped = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Take everything still queued. Intended for shutdown salvage after
    /// consumers have exited; emits no feedback.
    pub fn drain_remaining(&self) -> Vec<T> {
        let mut state = self.state.lock().expect("queue state poisoned");
        state.soft_fired = false;
        state.hard_fired = false;
        state.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue state poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().expect("queue state poisoned").stopped
    }

    /// Latched watermark transition check; call with the state lock held.
    fn check_transition(&self, state: &mut QueueState<T>) -> Option<FeedbackEvent> {
        let size = state.items.len();
        if size >= self.high_watermark && !state.hard_fired {
            state.hard_fired = true;
            // Hard implies soft: no separate soft event on the same crossing.
            state.soft_fired = true;
            Some(self.event(size, BackpressureLevel::Hard, None))
        } else if size > self.low_watermark
            && size < self.high_watermark
            && !state.soft_fired
            && !state.hard_fired
        {
            state.soft_fired = true;
            Some(self.event(size, BackpressureLevel::Soft, None))
        } else if size <= self.low_watermark && (state.hard_fired || state.soft_fired) {
            state.hard_fired = false;
            state.soft_fired = false;
            Some(self.event(size, BackpressureLevel::Ok, Some("queue_recovered")))
        } else {
            None
        }
    }

    fn event(
        &self,
        size: usize,
        level: BackpressureLevel,
        reason: Option<&str>,
    ) -> FeedbackEvent {
        FeedbackEvent::new(&self.coord_id, size, self.capacity, level, reason)
    }
}
