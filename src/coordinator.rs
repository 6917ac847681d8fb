//! The write coordinator: public façade and lifecycle owner
//!
//! Owns the queue, the worker pool, the breaker, the dead-letter queue, and
//! the metrics sampler. Producers only ever see `submit`/`health`/`stop`.

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::CoordinatorConfig;
use crate::dlq::DeadLetterQueue;
use crate::error::{ConfigError, EnqueueError, FailureKind, SubmitError, SubmitManyError};
use crate::feedback::{BackpressureLevel, FeedbackBus, FeedbackEvent};
use crate::metrics;
use crate::queue::{BoundedQueue, QueueOptions};
use crate::retry::{RetryBuildError, RetryPolicy};
use crate::sink::Sink;
use crate::sleeper::Sleeper;
use crate::worker::SinkWorker;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[cfg(feature = "webhook")]
use crate::webhook::HttpBroadcaster;

/// Non-blocking snapshot of coordinator state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorHealth {
    pub workers_alive: usize,
    pub queue_size: usize,
    pub capacity: usize,
    pub circuit_state: CircuitState,
}

struct CoordinatorInner<T> {
    coord_id: Arc<str>,
    config: CoordinatorConfig,
    sink: Arc<dyn Sink<T>>,
    queue: Arc<BoundedQueue<T>>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    dlq: Option<Arc<DeadLetterQueue<T>>>,
    bus: FeedbackBus,
    started: AtomicBool,
    stopping: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    sampler: Mutex<Option<JoinHandle<()>>>,
    #[cfg(feature = "webhook")]
    broadcaster: Mutex<Option<Arc<HttpBroadcaster>>>,
}

impl<T> Drop for CoordinatorInner<T> {
    fn drop(&mut self) {
        // Let workers drain and exit if the coordinator is dropped without
        // an explicit stop.
        self.queue.stop();
        let _ = self.shutdown_tx.send(true);
    }
}

/// High-throughput write coordinator between producers and a [`Sink`].
///
/// Cheap to clone; all clones share the same queue and worker pool.
pub struct WriteCoordinator<T> {
    inner: Arc<CoordinatorInner<T>>,
}

impl<T> Clone for WriteCoordinator<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> std::fmt::Debug for WriteCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCoordinator")
            .field("coord_id", &self.inner.coord_id)
            .field("queue_size", &self.inner.queue.len())
            .field("circuit_state", &self.inner.breaker.state())
            .finish_non_exhaustive()
    }
}

impl<T> WriteCoordinator<T>
where
    T: Serialize + Send + Sync + 'static,
{
    pub fn builder(sink: impl Sink<T> + 'static) -> CoordinatorBuilder<T> {
        CoordinatorBuilder {
            sink: Arc::new(sink),
            config: CoordinatorConfig::default(),
            coord_id: None,
            bus: None,
            sleeper: None,
        }
    }

    /// Build with defaults for everything but the sink and config.
    pub fn new(
        sink: impl Sink<T> + 'static,
        config: CoordinatorConfig,
    ) -> Result<Self, ConfigError> {
        Self::builder(sink).config(config).build()
    }

    pub fn coord_id(&self) -> &str {
        &self.inner.coord_id
    }

    pub fn feedback_bus(&self) -> &FeedbackBus {
        &self.inner.bus
    }

    /// Start workers and the metrics sampler. Idempotent; also implied by
    /// the first `submit`.
    pub async fn start(&self) {
        let inner = &self.inner;
        if inner.started.load(Ordering::SeqCst) || inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(
            coord_id = %inner.coord_id,
            workers = inner.config.workers,
            capacity = inner.config.capacity,
            "starting write coordinator"
        );

        if let Err(error) = inner.sink.open().await {
            tracing::warn!(coord_id = %inner.coord_id, %error, "sink open hook failed");
        }

        let mut handles = Vec::with_capacity(inner.config.workers);
        for id in 0..inner.config.workers {
            let worker = SinkWorker {
                id,
                coord_id: inner.coord_id.clone(),
                queue: inner.queue.clone(),
                sink: inner.sink.clone(),
                breaker: inner.breaker.clone(),
                retry: inner.retry.clone(),
                dlq: inner.dlq.clone(),
                batch_size: inner.config.batch_size,
                flush_interval: inner.config.flush_interval,
                shutdown: inner.shutdown_rx.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        *inner.workers.lock().expect("workers lock poisoned") = handles;

        let sampler = spawn_sampler(
            inner.coord_id.clone(),
            inner.queue.clone(),
            inner.breaker.clone(),
            inner.workers.clone(),
            inner.shutdown_rx.clone(),
            inner.config.metrics_poll_interval,
        );
        *inner.sampler.lock().expect("sampler lock poisoned") = Some(sampler);

        if inner.config.feedback_http.enabled {
            #[cfg(feature = "webhook")]
            {
                let broadcaster = Arc::new(HttpBroadcaster::new(
                    inner.config.feedback_http.clone(),
                    inner.bus.clone(),
                ));
                broadcaster.start().await;
                *inner.broadcaster.lock().expect("broadcaster lock poisoned") =
                    Some(broadcaster);
            }
            #[cfg(not(feature = "webhook"))]
            tracing::warn!(
                coord_id = %inner.coord_id,
                "feedback webhook enabled but the `webhook` feature is compiled out"
            );
        }
    }

    /// Enqueue one item, honoring the configured overflow strategy.
    pub async fn submit(&self, item: T) -> Result<(), SubmitError> {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(SubmitError::ShuttingDown);
        }
        self.start().await;

        match self.inner.queue.put(item).await {
            Ok(()) => {
                metrics::submitted(&self.inner.coord_id, 1);
                Ok(())
            }
            Err(EnqueueError::Full { capacity }) => {
                metrics::dropped(&self.inner.coord_id, "queue_full", 1);
                Err(SubmitError::QueueFull { capacity })
            }
            Err(EnqueueError::Closed) => Err(SubmitError::ShuttingDown),
        }
    }

    /// Enqueue a sequence of items, stopping at the first failure.
    pub async fn submit_many<I>(&self, items: I) -> Result<usize, SubmitManyError>
    where
        I: IntoIterator<Item = T>,
    {
        let mut submitted = 0;
        for item in items {
            if let Err(source) = self.submit(item).await {
                return Err(SubmitManyError { submitted, source });
            }
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Snapshot of queue depth, live workers, and breaker state. Safe to
    /// call concurrently with `submit`.
    pub fn health(&self) -> CoordinatorHealth {
        let workers_alive = self
            .inner
            .workers
            .lock()
            .expect("workers lock poisoned")
            .iter()
            .filter(|handle| !handle.is_finished())
            .count();
        CoordinatorHealth {
            workers_alive,
            queue_size: self.inner.queue.len(),
            capacity: self.inner.queue.capacity(),
            circuit_state: self.inner.breaker.state(),
        }
    }

    /// Graceful shutdown: reject new submissions, drain the queue within
    /// `deadline`, then abort stragglers and salvage whatever is still
    /// queued into the dead-letter queue.
    pub async fn stop(&self, deadline: Duration) {
        let inner = &self.inner;
        if inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(coord_id = %inner.coord_id, ?deadline, "stopping write coordinator");

        inner.queue.stop();
        let _ = inner.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *inner.workers.lock().expect("workers lock poisoned"));
        let aborts: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();
        if tokio::time::timeout(deadline, futures::future::join_all(handles)).await.is_err() {
            tracing::warn!(
                coord_id = %inner.coord_id,
                "drain deadline exceeded; aborting remaining workers"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        let leftovers = inner.queue.drain_remaining();
        if !leftovers.is_empty() {
            tracing::warn!(
                coord_id = %inner.coord_id,
                items = leftovers.len(),
                "queue not drained by deadline"
            );
            match &inner.dlq {
                Some(dlq) => {
                    let mut metadata = BTreeMap::new();
                    metadata.insert("attempts".to_string(), "0".to_string());
                    metadata.insert(
                        "error_kind".to_string(),
                        FailureKind::Shutdown.as_str().to_string(),
                    );
                    if let Err(error) = dlq
                        .save(
                            &leftovers,
                            "coordinator stopped before items were written",
                            FailureKind::Shutdown,
                            metadata,
                        )
                        .await
                    {
                        tracing::warn!(coord_id = %inner.coord_id, %error, "dead-letter write failed during shutdown");
                        metrics::dropped(&inner.coord_id, "dlq_write_failed", leftovers.len() as u64);
                    }
                }
                None => {
                    metrics::dropped(&inner.coord_id, "shutdown", leftovers.len() as u64);
                }
            }
        }

        let sampler = inner.sampler.lock().expect("sampler lock poisoned").take();
        if let Some(sampler) = sampler {
            let _ = sampler.await;
        }

        #[cfg(feature = "webhook")]
        {
            let broadcaster =
                inner.broadcaster.lock().expect("broadcaster lock poisoned").take();
            if let Some(broadcaster) = broadcaster {
                broadcaster.stop().await;
            }
        }

        if inner.started.load(Ordering::SeqCst) {
            if let Err(error) = inner.sink.close().await {
                tracing::warn!(coord_id = %inner.coord_id, %error, "sink close hook failed");
            }
        }

        // Final recovery signal for downstream rate controllers.
        inner
            .bus
            .publish(FeedbackEvent::new(
                inner.coord_id.as_ref(),
                inner.queue.len(),
                inner.queue.capacity(),
                BackpressureLevel::Ok,
                Some("coordinator_stopped"),
            ))
            .await;
        tracing::info!(coord_id = %inner.coord_id, "write coordinator stopped");
    }
}

fn spawn_sampler<T: Send + Sync + 'static>(
    coord_id: Arc<str>,
    queue: Arc<BoundedQueue<T>>,
    breaker: CircuitBreaker,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    mut shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    metrics::queue_depth(&coord_id, queue.len());
                    let alive = workers
                        .lock()
                        .expect("workers lock poisoned")
                        .iter()
                        .filter(|handle| !handle.is_finished())
                        .count();
                    metrics::workers_alive(&coord_id, alive);
                    metrics::circuit_state(&coord_id, breaker.state());
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }
    })
}

/// Builder for [`WriteCoordinator`]; validates configuration eagerly.
pub struct CoordinatorBuilder<T> {
    sink: Arc<dyn Sink<T>>,
    config: CoordinatorConfig,
    coord_id: Option<String>,
    bus: Option<FeedbackBus>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl<T> CoordinatorBuilder<T>
where
    T: Serialize + Send + Sync + 'static,
{
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides `config.coord_id`.
    pub fn coord_id(mut self, coord_id: impl Into<String>) -> Self {
        self.coord_id = Some(coord_id.into());
        self
    }

    /// Inject a bus instead of the process-wide default.
    pub fn feedback_bus(mut self, bus: FeedbackBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Replace the retry sleeper (useful for deterministic tests).
    pub fn retry_sleeper(mut self, sleeper: impl Sleeper + 'static) -> Self {
        self.sleeper = Some(Arc::new(sleeper));
        self
    }

    pub fn build(self) -> Result<WriteCoordinator<T>, ConfigError> {
        self.config.validate()?;

        let coord_id: Arc<str> = self
            .coord_id
            .or_else(|| self.config.coord_id.clone())
            .unwrap_or_else(|| "default".to_string())
            .into();
        let bus = self.bus.unwrap_or_else(|| FeedbackBus::global().clone());
        let dlq = self.config.dlq_path.clone().map(|path| Arc::new(DeadLetterQueue::new(path)));

        let mut retry_builder = RetryPolicy::builder()
            .max_attempts(self.config.retry.max_attempts)
            .initial_backoff(self.config.retry.initial_backoff)
            .max_backoff(self.config.retry.max_backoff)
            .multiplier(self.config.retry.backoff_multiplier)
            .jitter(self.config.retry.jitter);
        if let Some(sleeper) = self.sleeper {
            retry_builder = retry_builder.with_arc_sleeper(sleeper);
        }
        let retry = retry_builder.build().map_err(retry_config_error)?;

        let breaker = CircuitBreaker::new(
            self.config.breaker.failure_threshold,
            self.config.breaker.half_open_after,
        );

        let queue = BoundedQueue::new(
            QueueOptions {
                capacity: self.config.capacity,
                high_watermark: self.config.resolved_high_watermark(),
                low_watermark: self.config.resolved_low_watermark(),
                strategy: self.config.overflow,
                coord_id: coord_id.to_string(),
            },
            bus.clone(),
        );
        let queue = {
            let coord_id = coord_id.clone();
            let dlq = dlq.clone();
            queue.with_on_drop(move |item: T| {
                // Eviction is counted even when the dead-letter write fails;
                // the save itself is best-effort and off the submit path.
                metrics::dropped(&coord_id, "overflow", 1);
                if let Some(dlq) = dlq.clone() {
                    tokio::spawn(async move {
                        let mut metadata = BTreeMap::new();
                        metadata.insert(
                            "error_kind".to_string(),
                            FailureKind::Overflow.as_str().to_string(),
                        );
                        if let Err(error) = dlq
                            .save(
                                std::slice::from_ref(&item),
                                "evicted under drop_oldest overflow",
                                FailureKind::Overflow,
                                metadata,
                            )
                            .await
                        {
                            tracing::warn!(%error, "dead-letter write failed for evicted item");
                        }
                    });
                }
            })
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(WriteCoordinator {
            inner: Arc::new(CoordinatorInner {
                coord_id,
                config: self.config,
                sink: self.sink,
                queue: Arc::new(queue),
                breaker,
                retry,
                dlq,
                bus,
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                shutdown_tx,
                shutdown_rx,
                workers: Arc::new(Mutex::new(Vec::new())),
                sampler: Mutex::new(None),
                #[cfg(feature = "webhook")]
                broadcaster: Mutex::new(None),
            }),
        })
    }
}

fn retry_config_error(error: RetryBuildError) -> ConfigError {
    let key = match error {
        RetryBuildError::ZeroAttempts => "RETRY_MAX_ATTEMPTS",
        RetryBuildError::MultiplierBelowOne(_) => "RETRY_BACKOFF_MULTIPLIER",
        RetryBuildError::BackoffRange { .. } => "RETRY_INITIAL_BACKOFF_MS",
    };
    ConfigError::invalid(key, error.to_string())
}
