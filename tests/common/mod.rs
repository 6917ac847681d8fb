#![allow(dead_code)]

use async_trait::async_trait;
use floodgate::{FeedbackBus, FeedbackEvent, Sink, SinkError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Scriptable in-memory sink shared between the test and the coordinator.
#[derive(Clone, Default)]
pub struct MockSink {
    inner: Arc<MockSinkInner>,
}

#[derive(Default)]
struct MockSinkInner {
    batches: Mutex<Vec<Vec<u64>>>,
    calls: AtomicUsize,
    fail_first: AtomicUsize,
    transient_error: Mutex<String>,
    fail_always: Mutex<Option<String>>,
    latency: Mutex<Duration>,
    gate: Mutex<Option<watch::Receiver<bool>>>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write sleeps this long before completing.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.lock().unwrap() = latency;
        self
    }

    /// The first `n` writes fail with `message`; later writes succeed.
    pub fn failing_first(self, n: usize, message: &str) -> Self {
        self.inner.fail_first.store(n, Ordering::SeqCst);
        *self.inner.transient_error.lock().unwrap() = message.to_string();
        self
    }

    /// Block every write until the returned sender flips to `true`.
    pub fn gated(self) -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        *self.inner.gate.lock().unwrap() = Some(rx);
        (self, tx)
    }

    /// Fail every write with `message` until [`MockSink::succeed`].
    pub fn fail_with(&self, message: &str) {
        *self.inner.fail_always.lock().unwrap() = Some(message.to_string());
    }

    pub fn succeed(&self) {
        *self.inner.fail_always.lock().unwrap() = None;
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<u64>> {
        self.inner.batches.lock().unwrap().clone()
    }

    pub fn items(&self) -> Vec<u64> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl Sink<u64> for MockSink {
    async fn write(&self, batch: &[u64]) -> Result<(), SinkError> {
        let call = self.inner.calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.inner.gate.lock().unwrap().clone();
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }

        let latency = *self.inner.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if call < self.inner.fail_first.load(Ordering::SeqCst) {
            return Err(self.inner.transient_error.lock().unwrap().clone().into());
        }
        if let Some(message) = self.inner.fail_always.lock().unwrap().clone() {
            return Err(message.into());
        }

        self.inner.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

/// Subscribe a collector to the bus and return the shared event log.
pub async fn watch_bus(bus: &FeedbackBus) -> Arc<Mutex<Vec<FeedbackEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    bus.subscribe_fn(move |event| sink.lock().unwrap().push(event.clone())).await;
    events
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if condition() {
            return;
        }
        if std::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll a dead-letter file until it holds `expected` records.
pub async fn wait_for_dlq(
    dlq: &floodgate::DeadLetterQueue<u64>,
    expected: usize,
    timeout: Duration,
) {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if dlq.replay(usize::MAX).await.unwrap().len() >= expected {
            return;
        }
        if std::time::Instant::now() >= deadline {
            panic!("dead-letter queue never reached {expected} records");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
