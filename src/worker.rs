//! Sink workers: batch accumulation and write-through with retry
//!
//! Each worker pulls from the shared queue, accumulates a batch bounded by
//! size and flush interval, and writes it through the circuit breaker with
//! the retry policy. A batch has exactly one fate: written by the sink, or
//! recorded once in the dead-letter queue.

use crate::breaker::CircuitBreaker;
use crate::dlq::DeadLetterQueue;
use crate::error::FailureKind;
use crate::metrics;
use crate::queue::BoundedQueue;
use crate::retry::RetryPolicy;
use crate::sink::Sink;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub(crate) struct SinkWorker<T> {
    pub id: usize,
    pub coord_id: Arc<str>,
    pub queue: Arc<BoundedQueue<T>>,
    pub sink: Arc<dyn Sink<T>>,
    pub breaker: CircuitBreaker,
    pub retry: RetryPolicy,
    pub dlq: Option<Arc<DeadLetterQueue<T>>>,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub shutdown: watch::Receiver<bool>,
}

impl<T> SinkWorker<T>
where
    T: Serialize + Send + Sync + 'static,
{
    pub(crate) async fn run(mut self) {
        tracing::debug!(worker = self.id, "sink worker started");
        loop {
            let Some(first) = self.queue.get().await else { break };

            let mut batch = Vec::with_capacity(self.batch_size);
            batch.push(first);
            let deadline = Instant::now() + self.flush_interval;
            while batch.len() < self.batch_size {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, self.queue.get()).await {
                    Ok(Some(item)) => batch.push(item),
                    // Stopped and drained; flush what we have and exit after.
                    Ok(None) => break,
                    Err(_elapsed) => break,
                }
            }

            self.write_with_retry(batch).await;
        }
        tracing::debug!(worker = self.id, "sink worker exiting");
    }

    async fn write_with_retry(&mut self, batch: Vec<T>) {
        if let Err(open) = self.breaker.before_call() {
            tracing::debug!(
                worker = self.id,
                failures = open.consecutive_failures,
                "circuit open, routing batch to dead-letter queue"
            );
            metrics::write_error(&self.coord_id, self.id, FailureKind::CircuitOpen.as_str());
            self.dead_letter(&batch, open.to_string(), FailureKind::CircuitOpen, 0).await;
            return;
        }

        let max_attempts = self.retry.max_attempts();
        let mut attempts = 0;
        let mut failure: (String, FailureKind) =
            ("sink write failed".to_string(), FailureKind::Terminal);

        for attempt in 0..max_attempts {
            attempts = attempt + 1;
            let started = Instant::now();
            match AssertUnwindSafe(self.sink.write(&batch)).catch_unwind().await {
                Ok(Ok(())) => {
                    self.breaker.record_success();
                    metrics::batch_written(&self.coord_id, self.id);
                    metrics::write_latency(
                        &self.coord_id,
                        self.id,
                        started.elapsed().as_secs_f64(),
                    );
                    tracing::debug!(worker = self.id, items = batch.len(), "batch written");
                    return;
                }
                Ok(Err(error)) => {
                    let retryable = self.retry.is_retryable(&error);
                    tracing::debug!(
                        worker = self.id,
                        attempt = attempts,
                        retryable,
                        error = %error,
                        "sink write failed"
                    );
                    if !retryable {
                        failure = (error.to_string(), FailureKind::Terminal);
                        break;
                    }
                    if attempts >= max_attempts {
                        failure = (error.to_string(), FailureKind::RetryExhausted);
                        break;
                    }
                    let interrupted = tokio::select! {
                        _ = self.retry.sleep_backoff(attempt) => false,
                        _ = self.shutdown.wait_for(|stop| *stop) => true,
                    };
                    if interrupted {
                        failure = (error.to_string(), FailureKind::Shutdown);
                        break;
                    }
                }
                Err(payload) => {
                    failure = (panic_message(payload), FailureKind::Panic);
                    break;
                }
            }
        }

        let (message, kind) = failure;
        self.breaker.record_failure();
        metrics::write_error(&self.coord_id, self.id, kind.as_str());
        tracing::warn!(
            worker = self.id,
            attempts,
            kind = %kind,
            error = %message,
            items = batch.len(),
            "batch failed permanently"
        );
        self.dead_letter(&batch, message, kind, attempts).await;
    }

    async fn dead_letter(&self, batch: &[T], error: String, kind: FailureKind, attempts: usize) {
        let Some(dlq) = &self.dlq else {
            tracing::warn!(
                worker = self.id,
                items = batch.len(),
                kind = %kind,
                "no dead-letter queue configured; batch lost"
            );
            metrics::dropped(&self.coord_id, "no_dlq", batch.len() as u64);
            return;
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("worker_id".to_string(), self.id.to_string());
        metadata.insert("attempts".to_string(), attempts.to_string());
        metadata.insert("error_kind".to_string(), kind.as_str().to_string());

        if let Err(err) = dlq.save(batch, &error, kind, metadata).await {
            // Losing a record beats blocking the write path.
            tracing::warn!(
                worker = self.id,
                error = %err,
                items = batch.len(),
                "dead-letter write failed; batch lost"
            );
            metrics::dropped(&self.coord_id, "dlq_write_failed", batch.len() as u64);
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("sink panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("sink panicked: {message}")
    } else {
        "sink panicked".to_string()
    }
}
