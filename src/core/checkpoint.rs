//! Durable progress: the block watermark and the retry queue. Both are small
//! JSON documents rewritten whole on every change.

use alloy_primitives::B256;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

use crate::core::error::OracleError;
use crate::core::events::{EventKind, ObservedEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPosition {
    pub transaction_index: u64,
    pub log_index: u64,
}

/// Highest fully-handled point of the chain. Without a position the whole
/// block counts as done (documents written before positions were tracked).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watermark {
    pub last_processed_block: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_position: Option<LogPosition>,
}

impl Watermark {
    pub fn block(block: u64) -> Self {
        Self {
            last_processed_block: block,
            last_processed_position: None,
        }
    }

    pub fn at(event: &ObservedEvent) -> Self {
        Self {
            last_processed_block: event.block_number,
            last_processed_position: Some(LogPosition {
                transaction_index: event.transaction_index,
                log_index: event.log_index,
            }),
        }
    }

    fn key(&self) -> (u64, u64, u64) {
        match self.last_processed_position {
            Some(p) => (self.last_processed_block, p.transaction_index, p.log_index),
            None => (self.last_processed_block, u64::MAX, u64::MAX),
        }
    }

    /// Whether `event` sits at or before this watermark.
    pub fn covers(&self, event: &ObservedEvent) -> bool {
        event.position() <= self.key()
    }

    /// Move forward to `event`, never backward.
    pub fn advanced_to(self, event: &ObservedEvent) -> Self {
        let candidate = Self::at(event);
        if candidate.key() > self.key() {
            candidate
        } else {
            self
        }
    }
}

/// A request whose handler failed with a retryable error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub event_name: String,
    pub event_args: serde_json::Value,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub retry_count: u32,
    /// Epoch milliseconds.
    pub next_attempt_at: u64,
}

impl FailedJob {
    pub fn new(event: &ObservedEvent, next_attempt_at: u64) -> Self {
        Self {
            event_name: event.kind().name().to_string(),
            event_args: event.request.args(),
            block_number: event.block_number,
            transaction_hash: event.transaction_hash,
            retry_count: 0,
            next_attempt_at,
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_name(&self.event_name)
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.next_attempt_at
    }
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load(&self) -> Result<Option<Watermark>, OracleError>;
    async fn save(&self, watermark: &Watermark) -> Result<(), OracleError>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load(&self) -> Result<Vec<FailedJob>, OracleError>;
    async fn save(&self, jobs: &[FailedJob]) -> Result<(), OracleError>;

    async fn append(&self, job: FailedJob) -> Result<(), OracleError> {
        let mut jobs = self.load().await?;
        jobs.push(job);
        self.save(&jobs).await
    }
}

fn checkpoint_error(path: &Path, err: impl std::fmt::Display) -> OracleError {
    OracleError::Checkpoint(format!("{}: {}", path.display(), err))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, OracleError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| checkpoint_error(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(checkpoint_error(path, e)),
    }
}

/// Write to a sibling `.tmp` file, sync, then rename over the target.
async fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), OracleError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| checkpoint_error(parent, e))?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| checkpoint_error(path, e))?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| checkpoint_error(&tmp, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| checkpoint_error(&tmp, e))?;
        file.sync_all().await.map_err(|e| checkpoint_error(&tmp, e))?;
    }
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| checkpoint_error(path, e))
}

pub struct JsonWatermarkStore {
    path: PathBuf,
}

impl JsonWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl WatermarkStore for JsonWatermarkStore {
    async fn load(&self) -> Result<Option<Watermark>, OracleError> {
        read_json(&self.path).await
    }

    async fn save(&self, watermark: &Watermark) -> Result<(), OracleError> {
        write_atomic(&self.path, watermark).await
    }
}

pub struct JsonQueueStore {
    path: PathBuf,
}

impl JsonQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl QueueStore for JsonQueueStore {
    async fn load(&self) -> Result<Vec<FailedJob>, OracleError> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    async fn save(&self, jobs: &[FailedJob]) -> Result<(), OracleError> {
        write_atomic(&self.path, jobs).await
    }
}

#[derive(Default)]
pub struct MemoryWatermarkStore {
    inner: Mutex<Option<Watermark>>,
}

impl MemoryWatermarkStore {
    pub fn new(initial: Option<Watermark>) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    pub fn current(&self) -> Option<Watermark> {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn load(&self) -> Result<Option<Watermark>, OracleError> {
        Ok(self.current())
    }

    async fn save(&self, watermark: &Watermark) -> Result<(), OracleError> {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = Some(*watermark);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryQueueStore {
    inner: Mutex<Vec<FailedJob>>,
}

impl MemoryQueueStore {
    pub fn new(jobs: Vec<FailedJob>) -> Self {
        Self {
            inner: Mutex::new(jobs),
        }
    }

    pub fn snapshot(&self) -> Vec<FailedJob> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self) -> Result<Vec<FailedJob>, OracleError> {
        Ok(self.snapshot())
    }

    async fn save(&self, jobs: &[FailedJob]) -> Result<(), OracleError> {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = jobs.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::{JobRequest, RequestEvent};
    use alloy_primitives::{Address, Bytes, U256};

    fn event(block: u64, tx: u64, log: u64) -> ObservedEvent {
        ObservedEvent {
            request: RequestEvent::Prompt(JobRequest {
                user: Address::repeat_byte(1),
                conversation_id: U256::from(1u64),
                job_id: U256::from(block),
                payload: Bytes::new(),
            }),
            block_number: block,
            transaction_index: tx,
            log_index: log,
            transaction_hash: B256::repeat_byte(block as u8),
            block_timestamp: None,
        }
    }

    #[test]
    fn watermark_never_moves_backward() {
        let w = Watermark::at(&event(10, 3, 7));
        assert_eq!(w.advanced_to(&event(9, 9, 9)), w);
        assert_eq!(w.advanced_to(&event(10, 3, 6)), w);
        let later = w.advanced_to(&event(10, 4, 0));
        assert_eq!(later.last_processed_position.unwrap().transaction_index, 4);
    }

    #[test]
    fn block_only_watermark_covers_its_whole_block() {
        let w = Watermark::block(10);
        assert!(w.covers(&event(10, 99, 99)));
        assert!(!w.covers(&event(11, 0, 0)));
        assert_eq!(w.advanced_to(&event(10, 5, 5)), w);
    }

    #[test]
    fn positioned_watermark_covers_earlier_logs_only() {
        let w = Watermark::at(&event(10, 2, 4));
        assert!(w.covers(&event(10, 2, 4)));
        assert!(w.covers(&event(10, 1, 9)));
        assert!(!w.covers(&event(10, 2, 5)));
    }

    #[test]
    fn legacy_document_parses_without_position() {
        let w: Watermark = serde_json::from_str(r#"{"lastProcessedBlock": 8500}"#).unwrap();
        assert_eq!(w, Watermark::block(8500));
        let json = serde_json::to_value(Watermark::block(1)).unwrap();
        assert!(json.get("lastProcessedPosition").is_none());
    }

    #[tokio::test]
    async fn json_watermark_store_roundtrip() {
        let tmpdir = tempfile::tempdir().unwrap();
        let store = JsonWatermarkStore::new(tmpdir.path().join("state/watermark.json"));
        assert_eq!(store.load().await.unwrap(), None);

        let w = Watermark::at(&event(12, 1, 2));
        store.save(&w).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(w));
        assert!(!tmpdir.path().join("state/watermark.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_watermark_is_a_checkpoint_error() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("watermark.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        let store = JsonWatermarkStore::new(&path);
        assert!(matches!(store.load().await, Err(OracleError::Checkpoint(_))));
    }

    #[tokio::test]
    async fn json_queue_store_appends_and_persists_camel_case() {
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("retry-queue.json");
        let store = JsonQueueStore::new(&path);
        assert!(store.load().await.unwrap().is_empty());

        store.append(FailedJob::new(&event(5, 0, 0), 1_000)).await.unwrap();
        store.append(FailedJob::new(&event(6, 0, 0), 2_000)).await.unwrap();

        let jobs = store.load().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].block_number, 6);
        assert_eq!(jobs[0].kind(), Some(EventKind::PromptSubmitted));

        let raw: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(raw[0]["eventName"], "PromptSubmitted");
        assert_eq!(raw[0]["retryCount"], 0);
        assert_eq!(raw[0]["nextAttemptAt"], 1_000);
    }

    #[test]
    fn due_check_is_inclusive() {
        let job = FailedJob::new(&event(1, 0, 0), 500);
        assert!(!job.is_due(499));
        assert!(job.is_due(500));
    }
}
