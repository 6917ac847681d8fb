//! Dead-letter queue: append-only JSONL persistence of failed batches
//!
//! One record per line. Writes are serialized through an async mutex and the
//! file is opened in append mode per save, so concurrent workers never
//! interleave partial lines. `replay` is advisory: it reads records without
//! deleting or rewriting anything.

use crate::error::FailureKind;
use crate::feedback::unix_now;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// A persisted failure entry. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqRecord<T> {
    /// Seconds since the Unix epoch at save time.
    pub ts: f64,
    pub items: Vec<T>,
    pub error: String,
    pub error_kind: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct BorrowedRecord<'a, T> {
    ts: f64,
    items: &'a [T],
    error: &'a str,
    error_kind: &'a str,
    metadata: &'a BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("failed to encode dead-letter record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Append-only store of failed batches.
pub struct DeadLetterQueue<T> {
    path: PathBuf,
    writer: tokio::sync::Mutex<()>,
    _items: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for DeadLetterQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue").field("path", &self.path).finish()
    }
}

impl<T> DeadLetterQueue<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), writer: tokio::sync::Mutex::new(()), _items: PhantomData }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record.
    ///
    /// Safe under concurrent callers; each record lands on its own line.
    pub async fn save(
        &self,
        items: &[T],
        error: &str,
        kind: FailureKind,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), DlqError>
    where
        T: Serialize,
    {
        let mut line = serde_json::to_string(&BorrowedRecord {
            ts: unix_now(),
            items,
            error,
            error_kind: kind.as_str(),
            metadata: &metadata,
        })?;
        line.push('\n');

        let _guard = self.writer.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read up to `max_records` records from the start of the file.
    ///
    /// Corrupt lines are logged and skipped; a missing file reads as empty.
    pub async fn replay(&self, max_records: usize) -> Result<Vec<DlqRecord<T>>, DlqError>
    where
        T: DeserializeOwned,
    {
        let file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        while records.len() < max_records {
            let Some(line) = lines.next_line().await? else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), error = %err, "skipping corrupt dead-letter record");
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Bar {
        symbol: String,
        close: f64,
    }

    fn bar(symbol: &str, close: f64) -> Bar {
        Bar { symbol: symbol.to_string(), close }
    }

    fn temp_dlq() -> (tempfile::TempDir, DeadLetterQueue<Bar>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let dlq = DeadLetterQueue::new(dir.path().join("failed.jsonl"));
        (dir, dlq)
    }

    fn metadata(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn save_then_replay_round_trips() {
        let (_dir, dlq) = temp_dlq();
        let items = vec![bar("AAPL", 191.2), bar("MSFT", 402.5)];
        let meta = metadata(&[("worker_id", "2"), ("attempts", "3")]);

        dlq.save(&items, "connection timeout", FailureKind::RetryExhausted, meta.clone())
            .await
            .unwrap();

        let records = dlq.replay(10).await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.items, items);
        assert_eq!(record.error, "connection timeout");
        assert_eq!(record.error_kind, "retry_exhausted");
        assert_eq!(record.metadata, meta);
        assert!(record.ts > 0.0);
    }

    #[tokio::test]
    async fn replay_missing_file_is_empty() {
        let (_dir, dlq) = temp_dlq();
        assert!(dlq.replay(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_honors_max_records_and_preserves_order() {
        let (_dir, dlq) = temp_dlq();
        for i in 0..5 {
            dlq.save(&[bar("SPY", i as f64)], "permanent", FailureKind::Terminal, BTreeMap::new())
                .await
                .unwrap();
        }

        let records = dlq.replay(3).await.unwrap();
        assert_eq!(records.len(), 3);
        let closes: Vec<f64> = records.iter().map(|r| r.items[0].close).collect();
        assert_eq!(closes, vec![0.0, 1.0, 2.0]);
    }

    #[tokio::test]
    async fn concurrent_saves_produce_parseable_lines() {
        let (_dir, dlq) = temp_dlq();
        let dlq = Arc::new(dlq);

        let mut writers = Vec::new();
        for i in 0..16 {
            let dlq = dlq.clone();
            writers.push(tokio::spawn(async move {
                dlq.save(
                    &[bar("QQQ", i as f64)],
                    "unavailable",
                    FailureKind::CircuitOpen,
                    metadata(&[("worker_id", &i.to_string())]),
                )
                .await
            }));
        }
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let records = dlq.replay(100).await.unwrap();
        assert_eq!(records.len(), 16);
        assert!(records.iter().all(|r| r.error_kind == "circuit_open"));
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let (_dir, dlq) = temp_dlq();
        dlq.save(&[bar("IWM", 1.0)], "boom", FailureKind::Terminal, BTreeMap::new())
            .await
            .unwrap();

        // Inject garbage between two valid records.
        {
            use std::io::Write;
            let mut file =
                std::fs::OpenOptions::new().append(true).open(dlq.path()).unwrap();
            writeln!(file, "{{not json").unwrap();
        }
        dlq.save(&[bar("IWM", 2.0)], "boom", FailureKind::Terminal, BTreeMap::new())
            .await
            .unwrap();

        let records = dlq.replay(10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].items[0].close, 1.0);
        assert_eq!(records[1].items[0].close, 2.0);
    }
}
