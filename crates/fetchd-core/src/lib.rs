//! fetchd core - persistent download engine
//!
//! Accepts download requests, persists them, runs up to `max_concurrent`
//! transfers in priority order, and keeps every record consistent across
//! pause, resume, retry, cancel, removal, connectivity changes and restarts.

pub mod engine;
mod error;
pub mod events;
pub mod network;
pub mod queue;
mod scheduler;
pub mod storage;
pub mod store;

pub use engine::{
    HttpExecutor, ProgressSink, SqliteStore, TransferExecutor, TransferOutcome, TransferSpec,
};
pub use error::*;
pub use events::{DownloadListener, EventBus, ListenerId};
pub use scheduler::EngineHealth;
pub use storage::ConfigStore;
pub use store::{MemoryStore, RecordStore, StatusUpdate};

use engine::machine::Trigger;
use fetchd_types::{
    Connectivity, DownloadId, DownloadRecord, DownloadRequest, DownloadStatus, EngineConfig,
    EngineEvent, GroupId, PauseReason,
};
use parking_lot::Mutex;
use scheduler::{Command, Coordinator, Target};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const COMMAND_CAPACITY: usize = 256;

/// Configures and starts a [`FetchEngine`]
pub struct EngineBuilder {
    store: Arc<dyn RecordStore>,
    executor: Arc<dyn TransferExecutor>,
    config: EngineConfig,
    connectivity: Connectivity,
    dispatch: bool,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Connectivity assumed until the host reports otherwise
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// With dispatch disabled the engine only edits records and never starts
    /// transfers. Interrupted records are left alone for the process that runs
    /// them.
    pub fn dispatch(mut self, enabled: bool) -> Self {
        self.dispatch = enabled;
        self
    }

    /// Recover interrupted records and spawn the coordinator
    pub async fn start(self) -> Result<FetchEngine> {
        if self.dispatch {
            self.store.recover_interrupted().await?;
        }

        let bus = EventBus::new(self.config.event_capacity);
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (health_tx, health) = watch::channel(EngineHealth::Running);

        let coordinator = Coordinator::new(
            self.store.clone(),
            self.executor,
            &self.config,
            self.connectivity,
            bus.clone(),
            self.dispatch,
            health_tx,
            command_rx,
        );
        let task = tokio::spawn(coordinator.run());

        info!(
            "Engine started with {} slots (dispatch {})",
            self.config.max_concurrent, self.dispatch
        );

        Ok(FetchEngine {
            store: self.store,
            commands,
            bus,
            health,
            config: Arc::new(self.config),
            coordinator: Arc::new(Mutex::new(Some(task))),
        })
    }
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct FetchEngine {
    store: Arc<dyn RecordStore>,
    commands: mpsc::Sender<Command>,
    bus: EventBus,
    health: watch::Receiver<EngineHealth>,
    config: Arc<EngineConfig>,
    coordinator: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FetchEngine {
    pub fn builder(store: Arc<dyn RecordStore>, executor: Arc<dyn TransferExecutor>) -> EngineBuilder {
        EngineBuilder {
            store,
            executor,
            config: EngineConfig::default(),
            connectivity: Connectivity::unmetered(),
            dispatch: true,
        }
    }

    /// Start with `config` and default connectivity
    pub async fn start(
        store: Arc<dyn RecordStore>,
        executor: Arc<dyn TransferExecutor>,
        config: EngineConfig,
    ) -> Result<Self> {
        Self::builder(store, executor).config(config).start().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn health(&self) -> EngineHealth {
        self.health.borrow().clone()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::EngineStopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| EngineError::EngineStopped)?
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Persist a request as `Queued`.
    ///
    /// Enqueuing the same url and destination again returns the existing id.
    pub async fn enqueue(&self, request: DownloadRequest) -> Result<DownloadId> {
        self.enqueue_many(vec![request])
            .await
            .pop()
            .unwrap_or(Err(EngineError::EngineStopped))
    }

    /// Enqueue several requests, one result per request in order
    pub async fn enqueue_many(&self, requests: Vec<DownloadRequest>) -> Vec<Result<DownloadId>> {
        let mut results: Vec<Option<Result<DownloadId>>> = Vec::with_capacity(requests.len());
        let mut records = Vec::new();

        for request in requests {
            match queue::validate_request(&request) {
                Ok(()) => {
                    records.push(DownloadRecord::from_request(
                        request,
                        self.config.default_network_policy,
                    ));
                    results.push(None);
                }
                Err(e) => {
                    debug!("Rejected request for {}: {}", request.url, e);
                    results.push(Some(Err(e)));
                }
            }
        }

        let accepted: Vec<Result<DownloadId>> = if records.is_empty() {
            Vec::new()
        } else {
            let count = records.len();
            let (reply, rx) = oneshot::channel();
            let sent = self.send(Command::Enqueue { records, reply }).await;
            match (sent, rx.await) {
                (Ok(()), Ok(results)) => results,
                _ => (0..count).map(|_| Err(EngineError::EngineStopped)).collect(),
            }
        };
        let mut accepted = accepted.into_iter();

        results
            .into_iter()
            .map(|slot| match slot {
                Some(rejected) => rejected,
                None => accepted.next().unwrap_or(Err(EngineError::EngineStopped)),
            })
            .collect()
    }

    // ========================================================================
    // Single-download commands
    // ========================================================================

    async fn apply(&self, target: Target, trigger: Trigger) -> Result<()> {
        self.request(|reply| Command::Apply {
            target,
            trigger,
            reply,
        })
        .await
    }

    pub async fn pause(&self, id: DownloadId) -> Result<()> {
        self.apply(Target::One(id), Trigger::Pause(PauseReason::User)).await
    }

    pub async fn resume(&self, id: DownloadId) -> Result<()> {
        self.apply(Target::One(id), Trigger::Resume).await
    }

    /// Re-queue a failed or cancelled download, keeping its bytes
    pub async fn retry(&self, id: DownloadId) -> Result<()> {
        self.apply(Target::One(id), Trigger::Retry).await
    }

    pub async fn cancel(&self, id: DownloadId) -> Result<()> {
        self.apply(Target::One(id), Trigger::Cancel).await
    }

    /// Forget the download, leaving any file on disk
    pub async fn remove(&self, id: DownloadId) -> Result<()> {
        self.apply(Target::One(id), Trigger::Remove).await
    }

    /// Forget the download and delete its file
    pub async fn delete(&self, id: DownloadId) -> Result<()> {
        self.request(|reply| Command::Delete { id, reply }).await
    }

    // ========================================================================
    // Bulk commands
    // ========================================================================

    pub async fn pause_all(&self) -> Result<()> {
        self.apply(Target::All, Trigger::Pause(PauseReason::User)).await
    }

    pub async fn resume_all(&self) -> Result<()> {
        self.apply(Target::All, Trigger::Resume).await
    }

    pub async fn retry_all(&self) -> Result<()> {
        self.apply(Target::All, Trigger::Retry).await
    }

    pub async fn cancel_all(&self) -> Result<()> {
        self.apply(Target::All, Trigger::Cancel).await
    }

    pub async fn remove_all(&self) -> Result<()> {
        self.apply(Target::All, Trigger::Remove).await
    }

    pub async fn pause_group(&self, group: GroupId) -> Result<()> {
        self.apply(Target::Group(group), Trigger::Pause(PauseReason::User)).await
    }

    pub async fn resume_group(&self, group: GroupId) -> Result<()> {
        self.apply(Target::Group(group), Trigger::Resume).await
    }

    pub async fn retry_group(&self, group: GroupId) -> Result<()> {
        self.apply(Target::Group(group), Trigger::Retry).await
    }

    pub async fn cancel_group(&self, group: GroupId) -> Result<()> {
        self.apply(Target::Group(group), Trigger::Cancel).await
    }

    pub async fn remove_group(&self, group: GroupId) -> Result<()> {
        self.apply(Target::Group(group), Trigger::Remove).await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get(&self, id: DownloadId) -> Result<Option<DownloadRecord>> {
        self.store.get(id).await
    }

    /// Records for the given ids, skipping unknown ones
    pub async fn get_many(&self, ids: &[DownloadId]) -> Result<Vec<DownloadRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.store.get(*id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub async fn contains(&self, id: DownloadId) -> Result<bool> {
        Ok(self.store.get(id).await?.is_some())
    }

    pub async fn query_all(&self) -> Result<Vec<DownloadRecord>> {
        self.store.query_all().await
    }

    pub async fn query_by_status(&self, statuses: &[DownloadStatus]) -> Result<Vec<DownloadRecord>> {
        self.store.query_by_status(statuses).await
    }

    pub async fn query_by_group(&self, group: GroupId) -> Result<Vec<DownloadRecord>> {
        self.store.query_by_group(group).await
    }

    pub async fn query_group_by_status(
        &self,
        group: GroupId,
        statuses: &[DownloadStatus],
    ) -> Result<Vec<DownloadRecord>> {
        let records = self.store.query_by_group(group).await?;
        Ok(records
            .into_iter()
            .filter(|record| statuses.contains(&record.status))
            .collect())
    }

    /// No record is waiting or transferring
    pub async fn is_idle(&self) -> Result<bool> {
        let pending = self
            .store
            .query_by_status(&[DownloadStatus::Queued, DownloadStatus::Downloading])
            .await?;
        Ok(pending.is_empty())
    }

    // ========================================================================
    // Connectivity
    // ========================================================================

    pub async fn set_connectivity(&self, connectivity: Connectivity) -> Result<()> {
        self.send(Command::Connectivity(connectivity)).await
    }

    /// Forward every snapshot from `source` until it closes or the engine stops
    pub fn watch_connectivity(&self, mut source: watch::Receiver<Connectivity>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let current = *source.borrow_and_update();
                if engine.set_connectivity(current).await.is_err() {
                    break;
                }
                if source.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Ask the scheduler to look for work
    pub async fn wake(&self) -> Result<()> {
        self.send(Command::Wake).await
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn register(&self, listener: Arc<dyn DownloadListener>) -> ListenerId {
        self.bus.register(listener)
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        self.bus.unregister(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Stop dispatching, pause running transfers for the next start, flush the store.
    ///
    /// A storage failure during shutdown is returned and leaves the engine halted.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let result = match self.send(Command::Shutdown { reply }).await {
            Ok(()) => rx.await.unwrap_or(Ok(())),
            Err(_) => Ok(()),
        };

        let task = self.coordinator.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        match &result {
            Ok(()) => info!("Engine shut down"),
            Err(e) => error!("Engine shut down with a storage failure: {}", e),
        }
        result
    }
}
