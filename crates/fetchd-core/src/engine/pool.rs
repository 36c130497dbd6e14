//! Worker pool - slot bookkeeping for running transfers
//!
//! Owned by the coordinator, never shared. A stopped transfer keeps its entry
//! as "draining" until its worker reports back, so an id never has two
//! executor calls in flight.

use crate::engine::executor::{TransferExecutor, TransferSpec};
use crate::engine::throughput::ThroughputMeter;
use crate::engine::transfer_task::{TransferTask, WorkerEvent};
use fetchd_types::{DownloadId, DownloadRecord};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to a running transfer
struct ActiveTransfer {
    epoch: u64,
    stop: CancellationToken,
    handle: JoinHandle<()>,
    meter: ThroughputMeter,
    /// Stop requested, slot already released
    draining: bool,
}

pub(crate) struct WorkerPool {
    max_concurrent: usize,
    active: HashMap<DownloadId, ActiveTransfer>,
    next_epoch: u64,
    executor: Arc<dyn TransferExecutor>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    progress_interval: Duration,
    stop_grace: Duration,
    throughput_window: usize,
}

impl WorkerPool {
    pub fn new(
        max_concurrent: usize,
        executor: Arc<dyn TransferExecutor>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        progress_interval: Duration,
        stop_grace: Duration,
        throughput_window: usize,
    ) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            active: HashMap::new(),
            next_epoch: 1,
            executor,
            events,
            progress_interval,
            stop_grace,
            throughput_window,
        }
    }

    /// Slots not held by a running (non-draining) transfer
    pub fn free_slots(&self) -> usize {
        let running = self.active.values().filter(|t| !t.draining).count();
        self.max_concurrent.saturating_sub(running)
    }

    /// Whether `id` still has an executor call in flight
    pub fn is_busy(&self, id: DownloadId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn is_running(&self, id: DownloadId) -> bool {
        self.active.get(&id).map(|t| !t.draining).unwrap_or(false)
    }

    pub fn running_ids(&self) -> Vec<DownloadId> {
        self.active
            .iter()
            .filter(|(_, t)| !t.draining)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Spawn a worker for `record` and return its epoch
    pub fn start(&mut self, record: &DownloadRecord) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let stop = CancellationToken::new();
        let task = TransferTask {
            spec: TransferSpec::from_record(record),
            epoch,
            executor: self.executor.clone(),
            stop: stop.clone(),
            events: self.events.clone(),
            progress_interval: self.progress_interval,
            stop_grace: self.stop_grace,
        };

        let mut meter = ThroughputMeter::new(self.throughput_window);
        meter.record(Instant::now(), record.downloaded_bytes);

        let handle = task.spawn();
        self.active.insert(
            record.id,
            ActiveTransfer {
                epoch,
                stop,
                handle,
                meter,
                draining: false,
            },
        );
        debug!("Dispatched {} as epoch {}", record.id, epoch);
        epoch
    }

    /// Whether a report for `(id, epoch)` comes from the current worker
    pub fn is_current(&self, id: DownloadId, epoch: u64) -> bool {
        self.active.get(&id).map(|t| t.epoch == epoch).unwrap_or(false)
    }

    /// Fire the stop token and release the slot
    pub fn stop(&mut self, id: DownloadId) -> bool {
        match self.active.get_mut(&id) {
            Some(transfer) if !transfer.draining => {
                transfer.draining = true;
                transfer.stop.cancel();
                debug!("Stopping transfer {} (epoch {})", id, transfer.epoch);
                true
            }
            _ => false,
        }
    }

    pub fn stop_all(&mut self) -> usize {
        let ids = self.running_ids();
        for id in &ids {
            self.stop(*id);
        }
        ids.len()
    }

    /// Feed a progress sample, returning `(bytes_per_sec, eta_ms)`
    pub fn sample(&mut self, id: DownloadId, downloaded: u64, total: i64) -> (u64, i64) {
        match self.active.get_mut(&id) {
            Some(transfer) => {
                transfer.meter.record(Instant::now(), downloaded);
                (
                    transfer.meter.bytes_per_sec(),
                    transfer.meter.eta_ms(downloaded, total),
                )
            }
            None => (0, -1),
        }
    }

    /// Forget the worker for `(id, epoch)` once it has reported back
    pub fn finish(&mut self, id: DownloadId, epoch: u64) -> bool {
        if self.is_current(id, epoch) {
            self.active.remove(&id);
            true
        } else {
            false
        }
    }

    /// Stop everything and wait for workers, aborting any that outlive `timeout`
    pub async fn drain(&mut self, timeout: Duration) {
        self.stop_all();
        let transfers: Vec<_> = self.active.drain().collect();
        if transfers.is_empty() {
            return;
        }
        info!("Waiting for {} transfers to stop", transfers.len());

        for (id, transfer) in transfers {
            let abort = transfer.handle.abort_handle();
            if tokio::time::timeout(timeout, transfer.handle).await.is_err() {
                warn!("Transfer {} did not stop in time, aborting", id);
                abort.abort();
            }
        }
    }
}
