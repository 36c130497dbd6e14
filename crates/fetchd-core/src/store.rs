//! Record store contract and the in-memory implementation
//!
//! The store is the single source of truth for download state. Every mutation is
//! an atomic partial update; callers never hold a private copy of a status that
//! could drift from what is stored here.

use crate::error::{EngineError, Result, StorageError};
use async_trait::async_trait;
use fetchd_types::{
    DownloadId, DownloadRecord, DownloadStatus, ErrorKind, GroupId, PauseReason,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Partial update applied by [`RecordStore::update_status`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: DownloadStatus,
    pub error: ErrorKind,
    pub error_message: Option<String>,
    pub pause_reason: Option<PauseReason>,
}

impl StatusUpdate {
    /// A status change that clears error and pause reason
    pub fn plain(status: DownloadStatus) -> Self {
        Self {
            status,
            error: ErrorKind::None,
            error_message: None,
            pause_reason: None,
        }
    }

    pub fn paused(reason: PauseReason) -> Self {
        Self {
            pause_reason: Some(reason),
            ..Self::plain(DownloadStatus::Paused)
        }
    }

    pub fn failed(error: ErrorKind, message: Option<String>) -> Self {
        Self {
            error,
            error_message: message,
            ..Self::plain(DownloadStatus::Failed)
        }
    }

    pub fn apply(&self, record: &mut DownloadRecord) {
        record.status = self.status;
        record.error = self.error;
        record.error_message = self.error_message.clone();
        record.pause_reason = self.pause_reason;
    }
}

/// Persistence contract consumed by the engine
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Insert a new record.
    ///
    /// Fails with `AlreadyExists` when the id is taken and with
    /// `DuplicateDestination` when another id targets the same file.
    async fn insert(&self, record: &DownloadRecord) -> Result<()>;

    async fn get(&self, id: DownloadId) -> Result<Option<DownloadRecord>>;

    async fn update_status(&self, id: DownloadId, update: &StatusUpdate) -> Result<()>;

    async fn update_progress(&self, id: DownloadId, downloaded: u64, total: i64) -> Result<()>;

    /// Records in any of `statuses`, in dispatch order
    async fn query_by_status(&self, statuses: &[DownloadStatus]) -> Result<Vec<DownloadRecord>>;

    async fn query_by_group(&self, group: GroupId) -> Result<Vec<DownloadRecord>>;

    async fn query_all(&self) -> Result<Vec<DownloadRecord>>;

    /// Returns whether a record was deleted
    async fn delete(&self, id: DownloadId) -> Result<bool>;

    async fn delete_all(&self) -> Result<u64>;

    /// Re-queue records interrupted by a crash or shutdown.
    ///
    /// `Downloading` records and records paused by shutdown become `Queued`;
    /// downloaded bytes are left untouched.
    async fn recover_interrupted(&self) -> Result<u64>;

    /// Make all prior writes durable
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Dispatch order: priority descending, then creation time, then insertion order
pub(crate) fn dispatch_order(a: &(u64, DownloadRecord), b: &(u64, DownloadRecord)) -> std::cmp::Ordering {
    b.1.priority
        .cmp(&a.1.priority)
        .then_with(|| a.1.created_at.cmp(&b.1.created_at))
        .then_with(|| a.0.cmp(&b.0))
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<DownloadId, (u64, DownloadRecord)>,
    next_seq: u64,
}

/// Volatile store for tests and hosts that don't need persistence
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicBool,
    fail_flush: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later write fail with a storage error
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Make later flushes fail while writes keep working
    pub fn fail_flush(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::Release);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(injected("memory store is failing writes"));
        }
        Ok(())
    }

    fn collect<F>(&self, filter: F) -> Vec<DownloadRecord>
    where
        F: Fn(&DownloadRecord) -> bool,
    {
        let state = self.state.lock();
        let mut rows: Vec<(u64, DownloadRecord)> = state
            .records
            .values()
            .filter(|(_, record)| filter(record))
            .cloned()
            .collect();
        rows.sort_by(dispatch_order);
        rows.into_iter().map(|(_, record)| record).collect()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, record: &DownloadRecord) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        if state.records.contains_key(&record.id) {
            return Err(EngineError::AlreadyExists(record.id));
        }
        if state
            .records
            .values()
            .any(|(_, existing)| existing.destination == record.destination)
        {
            return Err(EngineError::DuplicateDestination(record.destination.clone()));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.records.insert(record.id, (seq, record.clone()));
        Ok(())
    }

    async fn get(&self, id: DownloadId) -> Result<Option<DownloadRecord>> {
        Ok(self.state.lock().records.get(&id).map(|(_, record)| record.clone()))
    }

    async fn update_status(&self, id: DownloadId, update: &StatusUpdate) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let (_, record) = state.records.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        update.apply(record);
        Ok(())
    }

    async fn update_progress(&self, id: DownloadId, downloaded: u64, total: i64) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let (_, record) = state.records.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        record.downloaded_bytes = downloaded;
        record.total_bytes = total;
        Ok(())
    }

    async fn query_by_status(&self, statuses: &[DownloadStatus]) -> Result<Vec<DownloadRecord>> {
        Ok(self.collect(|record| statuses.contains(&record.status)))
    }

    async fn query_by_group(&self, group: GroupId) -> Result<Vec<DownloadRecord>> {
        Ok(self.collect(|record| record.group == group))
    }

    async fn query_all(&self) -> Result<Vec<DownloadRecord>> {
        Ok(self.collect(|_| true))
    }

    async fn delete(&self, id: DownloadId) -> Result<bool> {
        self.check_writable()?;
        Ok(self.state.lock().records.remove(&id).is_some())
    }

    async fn delete_all(&self) -> Result<u64> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let count = state.records.len() as u64;
        state.records.clear();
        Ok(count)
    }

    async fn recover_interrupted(&self) -> Result<u64> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let mut recovered = 0;
        for (_, record) in state.records.values_mut() {
            let interrupted = record.status == DownloadStatus::Downloading
                || (record.status == DownloadStatus::Paused
                    && record.pause_reason == Some(PauseReason::Shutdown));
            if interrupted {
                record.status = DownloadStatus::Queued;
                record.pause_reason = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn flush(&self) -> Result<()> {
        if self.fail_flush.load(Ordering::Acquire) {
            return Err(injected("memory store failed to flush"));
        }
        Ok(())
    }
}

fn injected(message: &str) -> EngineError {
    StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, message.to_string())).into()
}
