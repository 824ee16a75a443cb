//! Ingest pipeline: payload normalization, shard persistence, and the
//! optional coalescing write queue.
//!
//! Accepted records land in `logs/ingest/<producerId>/<date>.ndjson`,
//! one JSON document per line, then an incremental index pass picks
//! them up. In queue mode a single flusher task drains a channel; the
//! flush timer resets on each arrival so bursts coalesce into one
//! write + one index pass.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use mikroscope_index::{now_iso, IndexMode, Indexer};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::state::{run_index_pass, IndexStatus};

const QUEUE_CAPACITY: usize = 1024;

/// Response body for `/api/ingest`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub accepted: u64,
    pub rejected: u64,
    pub queued: bool,
    pub producer_id: String,
    pub received_at: String,
}

/// Queue state surfaced through `/health`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending_batches: u64,
    pub pending_records: u64,
    pub flushed_batches: u64,
    pub flushed_records: u64,
    pub draining: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_flush_at: Option<String>,
}

#[derive(Debug)]
struct QueueBatch {
    producer_id: String,
    records: Vec<Value>,
}

struct QueueHandle {
    tx: StdMutex<Option<mpsc::Sender<QueueBatch>>>,
    stats: Arc<StdMutex<QueueStats>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

struct PipelineInner {
    logs_root: PathBuf,
    indexer: Arc<Indexer>,
    index_status: IndexStatus,
    queue: Option<QueueHandle>,
}

/// Ingest pipeline, synchronous or queued depending on configuration.
#[derive(Clone)]
pub struct IngestPipeline {
    inner: Arc<PipelineInner>,
}

impl IngestPipeline {
    pub fn new(
        logs_root: impl Into<PathBuf>,
        indexer: Arc<Indexer>,
        index_status: IndexStatus,
        async_queue: bool,
        flush_ms: u64,
    ) -> Self {
        let logs_root = logs_root.into();
        let queue = if async_queue {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            let stats = Arc::new(StdMutex::new(QueueStats::default()));
            let task = tokio::spawn(flusher_loop(
                rx,
                logs_root.clone(),
                Arc::clone(&indexer),
                index_status.clone(),
                Arc::clone(&stats),
                flush_ms.max(1),
            ));
            Some(QueueHandle {
                tx: StdMutex::new(Some(tx)),
                stats,
                task: StdMutex::new(Some(task)),
            })
        } else {
            None
        };

        Self {
            inner: Arc::new(PipelineInner {
                logs_root,
                indexer,
                index_status,
                queue,
            }),
        }
    }

    pub fn queued_mode(&self) -> bool {
        self.inner.queue.is_some()
    }

    pub fn queue_stats(&self) -> Option<QueueStats> {
        let queue = self.inner.queue.as_ref()?;
        queue.stats.lock().ok().map(|stats| stats.clone())
    }

    /// Normalize and persist (or enqueue) one producer batch.
    pub async fn submit(&self, producer_id: &str, records: Vec<Value>) -> AppResult<IngestOutcome> {
        let received_at = now_iso();
        let (accepted, rejected) = normalize_batch(records, producer_id, &received_at);
        let accepted_count = accepted.len() as u64;

        match &self.inner.queue {
            Some(queue) => {
                if !accepted.is_empty() {
                    let tx = queue
                        .tx
                        .lock()
                        .ok()
                        .and_then(|guard| guard.clone())
                        .ok_or_else(|| AppError::internal("ingest queue is closed"))?;
                    tx.send(QueueBatch {
                        producer_id: producer_id.to_string(),
                        records: accepted,
                    })
                    .await
                    .map_err(|_| AppError::internal("ingest queue is closed"))?;
                }
                Ok(IngestOutcome {
                    accepted: accepted_count,
                    rejected,
                    queued: true,
                    producer_id: producer_id.to_string(),
                    received_at,
                })
            }
            None => {
                if !accepted.is_empty() {
                    append_batch(&self.inner.logs_root, producer_id, &accepted)
                        .map_err(|err| AppError::internal(format!("failed to persist batch: {err}")))?;
                    if let Err(err) = run_index_pass(
                        &self.inner.indexer,
                        &self.inner.index_status,
                        IndexMode::Incremental,
                    )
                    .await
                    {
                        warn!(error = %err, "post-ingest index pass failed");
                    }
                }
                Ok(IngestOutcome {
                    accepted: accepted_count,
                    rejected,
                    queued: false,
                    producer_id: producer_id.to_string(),
                    received_at,
                })
            }
        }
    }

    /// Drain the queue once and stop the flusher. Idempotent; errors
    /// are logged, not raised.
    pub async fn shutdown(&self) {
        let Some(queue) = &self.inner.queue else {
            return;
        };
        let tx = queue.tx.lock().ok().and_then(|mut guard| guard.take());
        drop(tx);
        let task = queue.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "ingest flusher task did not stop cleanly");
            }
        }
    }
}

/// Parse the request payload: a JSON array, an object with a `logs`
/// array, or an empty body (treated as an empty array).
pub fn parse_payload(bytes: &[u8]) -> AppResult<Vec<Value>> {
    if bytes.iter().all(|byte| byte.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|err| AppError::bad_request(format!("invalid JSON body: {err}")))?;
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut object) => match object.remove("logs") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(AppError::bad_request(
                "expected an array of records or an object with a logs array",
            )),
        },
        _ => Err(AppError::bad_request(
            "expected an array of records or an object with a logs array",
        )),
    }
}

/// Stamp every object with the server-resolved producer id and the
/// batch-wide ingest timestamp. Non-objects are rejected.
pub fn normalize_batch(
    records: Vec<Value>,
    producer_id: &str,
    ingested_at: &str,
) -> (Vec<Value>, u64) {
    let mut accepted = Vec::with_capacity(records.len());
    let mut rejected = 0u64;
    for record in records {
        match record {
            Value::Object(mut object) => {
                object.insert("producerId".to_string(), json!(producer_id));
                object.insert("ingestedAt".to_string(), json!(ingested_at));
                accepted.push(Value::Object(object));
            }
            _ => rejected += 1,
        }
    }
    (accepted, rejected)
}

/// Shard path for a producer batch: `ingest/<producerId>/<date>.ndjson`
/// under the logs root, UTC date.
fn shard_path(logs_root: &Path, producer_id: &str) -> PathBuf {
    let date = Utc::now().format("%Y-%m-%d").to_string();
    logs_root
        .join("ingest")
        .join(producer_id)
        .join(format!("{date}.ndjson"))
}

/// Append a whole batch as one write to the producer's daily shard.
pub fn append_batch(
    logs_root: &Path,
    producer_id: &str,
    records: &[Value],
) -> std::io::Result<PathBuf> {
    let path = shard_path(logs_root, producer_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut buffer = String::new();
    for record in records {
        buffer.push_str(&record.to_string());
        buffer.push('\n');
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    file.write_all(buffer.as_bytes())?;
    Ok(path)
}

/// Single receiver draining the queue. The flush deadline resets on
/// each arrival; one flush writes every pending producer batch and
/// runs one index pass.
async fn flusher_loop(
    mut rx: mpsc::Receiver<QueueBatch>,
    logs_root: PathBuf,
    indexer: Arc<Indexer>,
    index_status: IndexStatus,
    stats: Arc<StdMutex<QueueStats>>,
    flush_ms: u64,
) {
    let mut pending: Vec<QueueBatch> = Vec::new();
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let sleep_target = deadline
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            item = rx.recv() => match item {
                Some(batch) => {
                    if let Ok(mut stats) = stats.lock() {
                        stats.pending_batches += 1;
                        stats.pending_records += batch.records.len() as u64;
                    }
                    pending.push(batch);
                    deadline =
                        Some(tokio::time::Instant::now() + Duration::from_millis(flush_ms));
                }
                None => {
                    // Channel closed: final drain, then stop.
                    flush_pending(&mut pending, &logs_root, &indexer, &index_status, &stats).await;
                    break;
                }
            },
            _ = tokio::time::sleep_until(sleep_target), if deadline.is_some() => {
                flush_pending(&mut pending, &logs_root, &indexer, &index_status, &stats).await;
                deadline = if pending.is_empty() {
                    None
                } else {
                    Some(tokio::time::Instant::now() + Duration::from_millis(flush_ms))
                };
            }
        }
    }
    debug!("ingest flusher stopped");
}

async fn flush_pending(
    pending: &mut Vec<QueueBatch>,
    logs_root: &Path,
    indexer: &Arc<Indexer>,
    index_status: &IndexStatus,
    stats: &Arc<StdMutex<QueueStats>>,
) {
    if pending.is_empty() {
        return;
    }
    if let Ok(mut stats) = stats.lock() {
        stats.draining = true;
    }

    // Merge batches of the same producer, preserving arrival order.
    let batches = std::mem::take(pending);
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<(String, Vec<Value>)> = Vec::new();
    for batch in batches {
        match slots.get(&batch.producer_id) {
            Some(&slot) => merged[slot].1.extend(batch.records),
            None => {
                slots.insert(batch.producer_id.clone(), merged.len());
                merged.push((batch.producer_id, batch.records));
            }
        }
    }

    let mut written_records = 0u64;
    let mut written_batches = 0u64;
    for position in 0..merged.len() {
        let (producer_id, records) = &merged[position];
        if let Err(err) = append_batch(logs_root, producer_id, records) {
            warn!(producer = %producer_id, error = %err, "queue flush failed, rescheduling");
            let failed_producer = producer_id.clone();
            // Re-prepend everything not yet written, this producer included.
            let mut restored: Vec<QueueBatch> = merged
                .split_off(position)
                .into_iter()
                .map(|(producer_id, records)| QueueBatch {
                    producer_id,
                    records,
                })
                .collect();
            restored.append(pending);
            *pending = restored;

            if let Ok(mut stats) = stats.lock() {
                stats.last_error = Some(format!("flush failed for {failed_producer}: {err}"));
                stats.draining = false;
                stats.pending_batches = pending.len() as u64;
                stats.pending_records =
                    pending.iter().map(|batch| batch.records.len() as u64).sum();
            }
            return;
        }
        written_records += records.len() as u64;
        written_batches += 1;
    }

    if let Err(err) = run_index_pass(indexer, index_status, IndexMode::Incremental).await {
        // The shards are on disk; the next pass will index them.
        warn!(error = %err, "post-flush index pass failed");
        if let Ok(mut stats) = stats.lock() {
            stats.last_error = Some(format!("post-flush index pass failed: {err}"));
        }
    }

    if let Ok(mut stats) = stats.lock() {
        stats.flushed_batches += written_batches;
        stats.flushed_records += written_records;
        stats.pending_batches = pending.len() as u64;
        stats.pending_records = pending.iter().map(|batch| batch.records.len() as u64).sum();
        stats.last_flush_at = Some(now_iso());
        stats.draining = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mikroscope_index::{EntryFilter, IndexStore};
    use tempfile::TempDir;

    #[test]
    fn payload_accepts_array_object_and_empty() {
        assert!(parse_payload(b"").expect("empty").is_empty());
        assert!(parse_payload(b"  \n ").expect("whitespace").is_empty());

        let items = parse_payload(br#"[{"event":"a"},{"event":"b"}]"#).expect("array");
        assert_eq!(items.len(), 2);

        let items = parse_payload(br#"{"logs": [{"event":"a"}]}"#).expect("logs object");
        assert_eq!(items.len(), 1);

        assert!(parse_payload(br#""just a string""#).is_err());
        assert!(parse_payload(br#"{"records": []}"#).is_err());
        assert!(parse_payload(b"not json").is_err());
    }

    #[test]
    fn normalize_overwrites_producer_id() {
        let records = vec![
            json!({"event": "a", "producerId": "spoofed"}),
            json!("not an object"),
            json!(17),
        ];
        let (accepted, rejected) = normalize_batch(records, "frontend-web", "2026-01-01T00:00:00.000Z");
        assert_eq!(accepted.len(), 1);
        assert_eq!(rejected, 2);
        assert_eq!(accepted[0]["producerId"], json!("frontend-web"));
        assert_eq!(accepted[0]["ingestedAt"], json!("2026-01-01T00:00:00.000Z"));
    }

    #[tokio::test]
    async fn sync_submit_writes_shard_and_indexes() {
        let dir = TempDir::new().expect("tempdir");
        let store = IndexStore::open_in_memory().await.expect("store");
        let indexer = Arc::new(Indexer::new(store.clone(), dir.path()));
        let pipeline = IngestPipeline::new(
            dir.path(),
            Arc::clone(&indexer),
            IndexStatus::default(),
            false,
            50,
        );

        let outcome = pipeline
            .submit("frontend-web", vec![json!({"event": "x", "level": "INFO"})])
            .await
            .expect("submit");
        assert_eq!(outcome.accepted, 1);
        assert!(!outcome.queued);

        let filter = EntryFilter {
            field: Some(("producerId".to_string(), "frontend-web".to_string())),
            ..Default::default()
        };
        assert_eq!(store.count(&filter).await.expect("count"), 1);

        let shard_dir = dir.path().join("ingest").join("frontend-web");
        assert_eq!(std::fs::read_dir(shard_dir).expect("dir").count(), 1);
    }

    #[tokio::test]
    async fn queued_submit_coalesces_same_producer() {
        let dir = TempDir::new().expect("tempdir");
        let store = IndexStore::open_in_memory().await.expect("store");
        let indexer = Arc::new(Indexer::new(store.clone(), dir.path()));
        let pipeline = IngestPipeline::new(
            dir.path(),
            Arc::clone(&indexer),
            IndexStatus::default(),
            true,
            25,
        );

        let first = pipeline
            .submit("api", vec![json!({"event": "one"})])
            .await
            .expect("submit");
        assert!(first.queued);
        pipeline
            .submit("api", vec![json!({"event": "two"})])
            .await
            .expect("submit");

        // Wait past the coalescing window for the flush to land.
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(store.count(&EntryFilter::default()).await.expect("count"), 2);
        let stats = pipeline.queue_stats().expect("stats");
        assert_eq!(stats.flushed_records, 2);
        assert_eq!(stats.flushed_batches, 1, "same producer merges to one write");
        assert!(stats.last_error.is_none());
    }

    #[tokio::test]
    async fn failed_flush_keeps_items_and_records_the_error() {
        let dir = TempDir::new().expect("tempdir");
        // A file where the ingest directory should be makes every
        // shard write fail.
        std::fs::write(dir.path().join("ingest"), "obstruction").expect("write");

        let store = IndexStore::open_in_memory().await.expect("store");
        let indexer = Arc::new(Indexer::new(store.clone(), dir.path()));
        let pipeline = IngestPipeline::new(
            dir.path(),
            Arc::clone(&indexer),
            IndexStatus::default(),
            true,
            25,
        );

        pipeline
            .submit("api", vec![json!({"event": "stuck"})])
            .await
            .expect("submit");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stats = pipeline.queue_stats().expect("stats");
        assert!(stats.last_error.is_some(), "failure must be recorded");
        assert_eq!(stats.pending_records, 1, "unflushed items stay queued");
        assert_eq!(stats.flushed_records, 0);
        assert_eq!(store.count(&EntryFilter::default()).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_remaining_items() {
        let dir = TempDir::new().expect("tempdir");
        let store = IndexStore::open_in_memory().await.expect("store");
        let indexer = Arc::new(Indexer::new(store.clone(), dir.path()));
        // Long window: only the shutdown drain can flush in time.
        let pipeline = IngestPipeline::new(
            dir.path(),
            Arc::clone(&indexer),
            IndexStatus::default(),
            true,
            60_000,
        );

        pipeline
            .submit("api", vec![json!({"event": "pending"})])
            .await
            .expect("submit");
        pipeline.shutdown().await;

        assert_eq!(store.count(&EntryFilter::default()).await.expect("count"), 1);
    }
}
