//! Worker that runs a single executor call
//!
//! The worker forwards progress and the terminal result to the coordinator,
//! tagged with the dispatch epoch. Once the stop token fires, the executor gets
//! a bounded grace period to return before it is dropped.

use crate::engine::executor::{ProgressSink, TransferExecutor, TransferOutcome, TransferSpec};
use crate::error::TransferError;
use fetchd_types::DownloadId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Report from a worker to the coordinator
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Progress {
        id: DownloadId,
        epoch: u64,
        downloaded: u64,
        total: Option<u64>,
    },
    Finished {
        id: DownloadId,
        epoch: u64,
        result: Result<TransferOutcome, TransferError>,
    },
}

pub(crate) struct TransferTask {
    pub spec: TransferSpec,
    pub epoch: u64,
    pub executor: Arc<dyn TransferExecutor>,
    pub stop: CancellationToken,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    pub progress_interval: Duration,
    pub stop_grace: Duration,
}

impl TransferTask {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let id = self.spec.id;
        let epoch = self.epoch;
        let last_reported = Arc::new(AtomicU64::new(self.spec.resume_offset));

        let sink = {
            let events = self.events.clone();
            let last_reported = last_reported.clone();
            ProgressSink::new(self.progress_interval, move |downloaded, total| {
                last_reported.fetch_max(downloaded, Ordering::AcqRel);
                let _ = events.send(WorkerEvent::Progress {
                    id,
                    epoch,
                    downloaded,
                    total,
                });
            })
        };

        info!(
            "Starting transfer {} (epoch {}) from offset {}",
            id, epoch, self.spec.resume_offset
        );

        let transfer = self.executor.transfer(self.spec, sink, self.stop.clone());
        tokio::pin!(transfer);

        let result = tokio::select! {
            biased;
            result = &mut transfer => result,
            _ = self.stop.cancelled() => {
                match tokio::time::timeout(self.stop_grace, &mut transfer).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            "Executor for {} ignored stop for {:?}, dropping it",
                            id, self.stop_grace
                        );
                        Ok(TransferOutcome::Stopped {
                            downloaded_bytes: last_reported.load(Ordering::Acquire),
                        })
                    }
                }
            }
        };

        debug!("Transfer {} (epoch {}) finished: {:?}", id, epoch, result);
        let _ = self.events.send(WorkerEvent::Finished { id, epoch, result });
    }
}
