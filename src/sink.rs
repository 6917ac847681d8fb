//! The sink contract consumed by the write path

use crate::error::SinkError;
use async_trait::async_trait;

/// Destination for batched writes.
///
/// Workers call `write` concurrently from multiple tasks; sinks that cannot
/// tolerate reentrancy must serialize internally. Because failed batches are
/// retried, `write` must accept the same batch more than once without
/// corruption (upsert semantics keyed on a natural primary key are the usual
/// answer).
#[async_trait]
pub trait Sink<T>: Send + Sync {
    async fn write(&self, batch: &[T]) -> Result<(), SinkError>;

    /// Invoked once when the coordinator starts.
    async fn open(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Invoked once when the coordinator stops.
    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
