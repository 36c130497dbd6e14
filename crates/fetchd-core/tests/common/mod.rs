#![allow(dead_code)]

use async_trait::async_trait;
use fetchd_core::{
    FetchEngine, MemoryStore, ProgressSink, RecordStore, TransferError, TransferExecutor,
    TransferOutcome, TransferSpec,
};
use fetchd_types::{DownloadId, DownloadRecord, DownloadStatus, EngineConfig, ErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// What the scripted executor does for a download
#[derive(Debug, Clone, Copy)]
pub enum Plan {
    /// Report `step` more bytes, then wait for a stop or `complete`
    Hold { step: u64 },
    Complete { total: u64 },
    Fail(ErrorKind),
}

#[derive(Default)]
pub struct Scripted {
    plans: Mutex<HashMap<DownloadId, Plan>>,
    starts: Mutex<Vec<(DownloadId, u64)>>,
    running: Mutex<HashMap<DownloadId, usize>>,
    max_overlap: Mutex<usize>,
    finish: Mutex<HashMap<DownloadId, Arc<Notify>>>,
}

impl Scripted {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn plan(&self, id: DownloadId, plan: Plan) {
        self.plans.lock().insert(id, plan);
    }

    /// Let a held transfer finish as completed
    pub fn complete(&self, id: DownloadId) {
        self.notify(id).notify_one();
    }

    /// `(id, resume_offset)` of every start, in order
    pub fn starts(&self) -> Vec<(DownloadId, u64)> {
        self.starts.lock().clone()
    }

    pub fn started_ids(&self) -> Vec<DownloadId> {
        self.starts().into_iter().map(|(id, _)| id).collect()
    }

    pub fn running(&self, id: DownloadId) -> usize {
        self.running.lock().get(&id).copied().unwrap_or(0)
    }

    pub fn max_overlap(&self) -> usize {
        *self.max_overlap.lock()
    }

    fn notify(&self, id: DownloadId) -> Arc<Notify> {
        self.finish.lock().entry(id).or_default().clone()
    }

    fn enter(&self, spec: &TransferSpec) {
        self.starts.lock().push((spec.id, spec.resume_offset));
        let mut running = self.running.lock();
        let count = running.entry(spec.id).or_default();
        *count += 1;
        let mut max = self.max_overlap.lock();
        *max = (*max).max(*count);
    }

    fn leave(&self, id: DownloadId) {
        if let Some(count) = self.running.lock().get_mut(&id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl TransferExecutor for Scripted {
    async fn transfer(
        &self,
        spec: TransferSpec,
        progress: ProgressSink,
        stop: CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        self.enter(&spec);
        let id = spec.id;
        let plan = self
            .plans
            .lock()
            .get(&id)
            .copied()
            .unwrap_or(Plan::Hold { step: 0 });

        let result = match plan {
            Plan::Complete { total } => {
                progress.report_now(total, Some(total));
                Ok(TransferOutcome::Completed { total_bytes: total })
            }
            Plan::Fail(kind) => Err(TransferError {
                kind,
                message: "scripted failure".to_string(),
            }),
            Plan::Hold { step } => {
                let downloaded = spec.resume_offset + step;
                if step > 0 {
                    progress.report_now(downloaded, None);
                }
                let finish = self.notify(id);
                tokio::select! {
                    _ = stop.cancelled() => Ok(TransferOutcome::Stopped { downloaded_bytes: downloaded }),
                    _ = finish.notified() => Ok(TransferOutcome::Completed { total_bytes: downloaded }),
                }
            }
        };

        self.leave(id);
        result
    }
}

pub fn config(max_concurrent: usize) -> EngineConfig {
    EngineConfig {
        max_concurrent,
        progress_interval_ms: 0,
        stop_grace_ms: 500,
        reconcile_interval_ms: 50,
        ..EngineConfig::default()
    }
}

pub async fn engine(max_concurrent: usize) -> (FetchEngine, Arc<MemoryStore>, Arc<Scripted>) {
    let store = Arc::new(MemoryStore::new());
    let executor = Scripted::new();
    let engine = FetchEngine::start(store.clone(), executor.clone(), config(max_concurrent))
        .await
        .unwrap();
    (engine, store, executor)
}

/// Engine that edits records but never starts transfers
pub async fn editor() -> (FetchEngine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = FetchEngine::builder(store.clone(), Scripted::new())
        .config(config(1))
        .dispatch(false)
        .start()
        .await
        .unwrap();
    (engine, store)
}

/// Poll until `check` holds, panicking after about five seconds
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub async fn record(store: &dyn RecordStore, id: DownloadId) -> DownloadRecord {
    store.get(id).await.unwrap().expect("record exists")
}

pub async fn wait_status(store: &Arc<MemoryStore>, id: DownloadId, status: DownloadStatus) {
    eventually(&format!("{} to be {}", id, status), || async {
        store.get(id).await.unwrap().map(|r| r.status) == Some(status)
    })
    .await;
}
