//! Coordinator - the single task that mutates download state
//!
//! Commands from the engine handle, reports from workers, connectivity updates
//! and a periodic reconcile tick all funnel into one loop. Every state change
//! goes through the state machine and lands in the record store before any
//! event is published.

use crate::engine::executor::{TransferExecutor, TransferOutcome};
use crate::engine::machine::{transition, Change, Step, Trigger};
use crate::engine::pool::WorkerPool;
use crate::engine::transfer_task::WorkerEvent;
use crate::error::{EngineError, Result, TransferError};
use crate::events::EventBus;
use crate::network::{AdmissionController, AFFECTED};
use crate::queue::select_for_dispatch;
use crate::store::RecordStore;
use fetchd_types::{
    Connectivity, DownloadId, DownloadRecord, DownloadStatus, EngineConfig, EngineEvent,
    ErrorKind, GroupId, PauseReason,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Which records a command applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    One(DownloadId),
    Group(GroupId),
    All,
}

pub(crate) enum Command {
    Enqueue {
        records: Vec<DownloadRecord>,
        reply: oneshot::Sender<Vec<Result<DownloadId>>>,
    },
    Apply {
        target: Target,
        trigger: Trigger,
        reply: Reply<()>,
    },
    /// Remove and delete the destination file
    Delete {
        id: DownloadId,
        reply: Reply<()>,
    },
    Connectivity(Connectivity),
    Wake,
    Shutdown {
        reply: Reply<()>,
    },
}

/// Engine health as seen by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineHealth {
    Running,
    /// Storage failed; nothing is dispatched and commands are refused
    Halted { reason: String },
    Stopped,
}

pub(crate) struct Coordinator {
    store: Arc<dyn RecordStore>,
    pool: WorkerPool,
    admission: AdmissionController,
    bus: EventBus,
    dispatch_enabled: bool,
    shutting_down: bool,
    halted: Option<String>,
    health: watch::Sender<EngineHealth>,
    commands: mpsc::Receiver<Command>,
    worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
    reconcile_interval: Duration,
    stop_grace: Duration,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RecordStore>,
        executor: Arc<dyn TransferExecutor>,
        config: &EngineConfig,
        connectivity: Connectivity,
        bus: EventBus,
        dispatch_enabled: bool,
        health: watch::Sender<EngineHealth>,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let (worker_tx, worker_events) = mpsc::unbounded_channel();
        let stop_grace = Duration::from_millis(config.stop_grace_ms);
        let pool = WorkerPool::new(
            config.max_concurrent,
            executor,
            worker_tx,
            Duration::from_millis(config.progress_interval_ms),
            stop_grace,
            config.throughput_window,
        );

        Self {
            store,
            pool,
            admission: AdmissionController::new(connectivity),
            bus,
            dispatch_enabled,
            shutting_down: false,
            halted: None,
            health,
            commands,
            worker_events,
            reconcile_interval: Duration::from_millis(config.reconcile_interval_ms.max(10)),
            stop_grace,
        }
    }

    pub async fn run(mut self) {
        info!(
            "Coordinator started (dispatch {})",
            if self.dispatch_enabled { "enabled" } else { "disabled" }
        );

        let mut reconcile = tokio::time::interval(self.reconcile_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(self.shutdown().await);
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        if let Err(e) = self.shutdown().await {
                            error!("Shutdown failed: {}", e);
                        }
                        break;
                    }
                },
                Some(event) = self.worker_events.recv() => self.on_worker_event(event).await,
                _ = reconcile.tick() => self.reconcile().await,
            }
        }

        info!("Coordinator stopped");
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn handle(&mut self, command: Command) {
        if let Some(reason) = self.halted.clone() {
            refuse(command, &reason);
            return;
        }

        match command {
            Command::Enqueue { records, reply } => {
                let results = self.enqueue(records).await;
                let _ = reply.send(results);
            }
            Command::Apply {
                target,
                trigger,
                reply,
            } => {
                let result = self.apply_command(target, &trigger).await;
                let _ = reply.send(self.check(result));
            }
            Command::Delete { id, reply } => {
                let result = self.delete(id).await;
                let _ = reply.send(self.check(result));
            }
            Command::Connectivity(connectivity) => {
                let result = self.on_connectivity(connectivity).await;
                let _ = self.check(result);
            }
            Command::Wake => {}
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(Ok(()));
            }
        }

        let result = self.dispatch().await;
        let _ = self.check(result);
    }

    async fn enqueue(&mut self, records: Vec<DownloadRecord>) -> Vec<Result<DownloadId>> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            if let Some(reason) = &self.halted {
                results.push(Err(EngineError::Halted(reason.clone())));
                continue;
            }
            let result = self.insert(record).await;
            results.push(self.check(result));
        }
        results
    }

    async fn insert(&mut self, record: DownloadRecord) -> Result<DownloadId> {
        let id = record.id;
        if self.store.get(id).await?.is_some() {
            debug!("Download {} already known, keeping existing record", id);
            return Ok(id);
        }

        match self.store.insert(&record).await {
            Ok(()) => {}
            Err(EngineError::AlreadyExists(_)) => return Ok(id),
            Err(e) => return Err(e),
        }

        info!("Queued {} ({}) from {}", id, record.display_name, record.url);
        self.bus.publish(EngineEvent::Queued { record });
        Ok(id)
    }

    async fn apply_command(&mut self, target: Target, trigger: &Trigger) -> Result<()> {
        let records = match target {
            Target::One(id) => {
                let record = self.store.get(id).await?.ok_or(EngineError::NotFound(id))?;
                return self.apply(&record, trigger).await;
            }
            Target::Group(group) => self.store.query_by_group(group).await?,
            Target::All => self.store.query_all().await?,
        };

        debug!("Applying {} to {} records", trigger.name(), records.len());
        for record in records {
            let result = self.apply(&record, trigger).await;
            skip_non_fatal(record.id, trigger, result)?;
        }
        Ok(())
    }

    async fn delete(&mut self, id: DownloadId) -> Result<()> {
        let record = self.store.get(id).await?.ok_or(EngineError::NotFound(id))?;
        self.apply(&record, &Trigger::Remove).await?;
        remove_file(&record.destination).await;
        Ok(())
    }

    async fn on_connectivity(&mut self, connectivity: Connectivity) -> Result<()> {
        self.admission.update(connectivity);
        let records = self.store.query_by_status(&AFFECTED).await?;

        for (id, trigger) in self.admission.plan(&records) {
            if let Some(record) = records.iter().find(|record| record.id == id) {
                let result = self.apply(record, &trigger).await;
                skip_non_fatal(id, &trigger, result)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // State application
    // ========================================================================

    async fn apply(&mut self, record: &DownloadRecord, trigger: &Trigger) -> Result<()> {
        match transition(record, trigger) {
            Step::Unchanged => Ok(()),
            Step::Stale => {
                debug!(
                    "Ignoring stale {} for {} in state {}",
                    trigger.name(),
                    record.id,
                    record.status
                );
                Ok(())
            }
            Step::Invalid => Err(EngineError::InvalidTransition {
                id: record.id,
                status: record.status,
                command: trigger.name(),
            }),
            Step::Apply(change) => self.commit(record, change).await,
        }
    }

    async fn commit(&mut self, record: &DownloadRecord, change: Change) -> Result<()> {
        let id = record.id;

        if change.delete {
            self.store.delete(id).await?;
            if change.stop_executor {
                self.pool.stop(id);
            }
            info!("Removed {}", id);
            self.bus.publish(EngineEvent::StatusChanged {
                id,
                status: DownloadStatus::Removed,
                error: ErrorKind::None,
            });
            self.bus.publish(EngineEvent::Removed { id });
            return Ok(());
        }

        if let Some((downloaded, total)) = change.progress {
            self.store.update_progress(id, downloaded, total).await?;
            let (bytes_per_sec, eta_ms) = self.pool.sample(id, downloaded, total);
            self.bus.publish(EngineEvent::Progress {
                id,
                status: change.status.as_ref().map(|u| u.status).unwrap_or(record.status),
                downloaded_bytes: downloaded,
                total_bytes: total,
                eta_ms,
                bytes_per_sec,
            });
        }

        if let Some(update) = change.status {
            self.store.update_status(id, &update).await?;
            if change.stop_executor {
                self.pool.stop(id);
            }
            info!("Download {}: {} -> {}", id, record.status, update.status);
            self.bus.publish(EngineEvent::StatusChanged {
                id,
                status: update.status,
                error: update.error,
            });
        }

        Ok(())
    }

    async fn dispatch(&mut self) -> Result<()> {
        if !self.dispatch_enabled || self.shutting_down || self.halted.is_some() {
            return Ok(());
        }
        let free = self.pool.free_slots();
        if free == 0 {
            return Ok(());
        }

        let queued = self.store.query_by_status(&[DownloadStatus::Queued]).await?;
        let picked = {
            let admission = &self.admission;
            let pool = &self.pool;
            select_for_dispatch(queued, free, |r| admission.admits(r), |id| pool.is_busy(id))
        };

        for mut record in picked {
            self.apply(&record, &Trigger::Dispatch).await?;
            record.status = DownloadStatus::Downloading;
            self.pool.start(&record);
        }
        Ok(())
    }

    // ========================================================================
    // Worker reports
    // ========================================================================

    async fn on_worker_event(&mut self, event: WorkerEvent) {
        if self.halted.is_some() {
            if let WorkerEvent::Finished { id, epoch, .. } = event {
                self.pool.finish(id, epoch);
            }
            return;
        }

        let result = match event {
            WorkerEvent::Progress {
                id,
                epoch,
                downloaded,
                total,
            } => self.on_progress(id, epoch, downloaded, total).await,
            WorkerEvent::Finished { id, epoch, result } => self.on_finished(id, epoch, result).await,
        };

        if self.check(result).is_ok() {
            let result = self.dispatch().await;
            let _ = self.check(result);
        }
    }

    async fn on_progress(
        &mut self,
        id: DownloadId,
        epoch: u64,
        downloaded: u64,
        total: Option<u64>,
    ) -> Result<()> {
        if !self.pool.is_current(id, epoch) || !self.pool.is_running(id) {
            return Ok(());
        }
        match self.store.get(id).await? {
            Some(record) => self.apply(&record, &Trigger::Progress { downloaded, total }).await,
            None => Ok(()),
        }
    }

    async fn on_finished(
        &mut self,
        id: DownloadId,
        epoch: u64,
        result: std::result::Result<TransferOutcome, TransferError>,
    ) -> Result<()> {
        if !self.pool.finish(id, epoch) {
            warn!("Discarding result from stale epoch {} of {}", epoch, id);
            return Ok(());
        }
        let Some(record) = self.store.get(id).await? else {
            return Ok(());
        };

        let running = record.status == DownloadStatus::Downloading;
        let trigger = match result {
            Ok(TransferOutcome::Completed { total_bytes }) if running => {
                Trigger::Succeeded { total_bytes }
            }
            Ok(TransferOutcome::Completed { total_bytes }) => Trigger::Settled {
                downloaded: total_bytes,
            },
            Ok(TransferOutcome::Stopped { .. }) if running => Trigger::Failed {
                kind: ErrorKind::TransferFailed,
                message: "transfer stopped without a stop request".to_string(),
            },
            Ok(TransferOutcome::Stopped { downloaded_bytes }) => Trigger::Settled {
                downloaded: downloaded_bytes,
            },
            Err(error) => {
                if running {
                    warn!("Transfer {} failed: {}", id, error);
                }
                Trigger::Failed {
                    kind: error.kind,
                    message: error.message,
                }
            }
        };

        self.apply(&record, &trigger).await
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    /// Stop transfers whose record changed behind our back, then dispatch
    async fn reconcile(&mut self) {
        if self.halted.is_some() || self.shutting_down {
            return;
        }
        let result = self.reconcile_running().await;
        if self.check(result).is_ok() {
            let result = self.dispatch().await;
            let _ = self.check(result);
        }
    }

    async fn reconcile_running(&mut self) -> Result<()> {
        for id in self.pool.running_ids() {
            let status = self.store.get(id).await?.map(|record| record.status);
            if status != Some(DownloadStatus::Downloading) {
                warn!("Download {} changed outside the engine, stopping its transfer", id);
                self.pool.stop(id);
            }
        }
        Ok(())
    }

    /// Halt on fatal errors, pass the result through
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.halt(err);
            }
        }
        result
    }

    fn halt(&mut self, err: &EngineError) {
        if self.halted.is_some() {
            return;
        }
        error!("Storage failure, halting engine: {}", err);

        let reason = err.to_string();
        self.halted = Some(reason.clone());
        self.pool.stop_all();
        self.health.send_replace(EngineHealth::Halted {
            reason: reason.clone(),
        });
        self.bus.publish(EngineEvent::Halted { reason });
    }

    /// Pause, drain and flush. Returns the first storage failure hit on the way;
    /// a halt that happened earlier was already reported.
    async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down coordinator");
        self.shutting_down = true;
        let mut failure = None;

        if self.halted.is_none() {
            let result = self.pause_for_shutdown().await;
            keep_fatal(&mut failure, self.check(result));
        }

        self.pool.drain(self.stop_grace + Duration::from_secs(1)).await;

        // Keep the final byte counts of stopped workers
        while let Ok(event) = self.worker_events.try_recv() {
            if self.halted.is_some() {
                break;
            }
            if let WorkerEvent::Finished {
                id,
                result: Ok(outcome),
                ..
            } = event
            {
                let downloaded = match outcome {
                    TransferOutcome::Stopped { downloaded_bytes } => downloaded_bytes,
                    TransferOutcome::Completed { total_bytes } => total_bytes,
                };
                let result = self.settle(id, downloaded).await;
                keep_fatal(&mut failure, self.check(result));
            }
        }

        if self.halted.is_none() {
            let result = self.store.flush().await;
            keep_fatal(&mut failure, self.check(result));
        }
        if self.halted.is_none() {
            self.health.send_replace(EngineHealth::Stopped);
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn pause_for_shutdown(&mut self) -> Result<()> {
        for id in self.pool.running_ids() {
            if let Some(record) = self.store.get(id).await? {
                self.apply(&record, &Trigger::Pause(PauseReason::Shutdown)).await?;
            }
        }
        Ok(())
    }

    async fn settle(&mut self, id: DownloadId, downloaded: u64) -> Result<()> {
        match self.store.get(id).await? {
            Some(record) => self.apply(&record, &Trigger::Settled { downloaded }).await,
            None => Ok(()),
        }
    }
}

/// Answer a command while halted
fn refuse(command: Command, reason: &str) {
    let halted = || EngineError::Halted(reason.to_string());
    match command {
        Command::Enqueue { records, reply } => {
            let _ = reply.send(records.iter().map(|_| Err(halted())).collect());
        }
        Command::Apply { reply, .. } | Command::Delete { reply, .. } => {
            let _ = reply.send(Err(halted()));
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(Ok(()));
        }
        Command::Connectivity(_) | Command::Wake => {}
    }
}

/// Bulk operations carry on past records that moved or vanished meanwhile
fn skip_non_fatal(id: DownloadId, trigger: &Trigger, result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            debug!("Skipping {} for {}: {}", trigger.name(), id, e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

fn keep_fatal(failure: &mut Option<EngineError>, result: Result<()>) {
    if let Err(err) = result {
        if err.is_fatal() && failure.is_none() {
            *failure = Some(err);
        }
    }
}

async fn remove_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Deleted {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
    }
}
