//! Transfer executor contract
//!
//! An executor moves bytes for one download. The engine starts at most one
//! transfer per download at a time and treats the returned future as the single
//! terminal report for that start.

use crate::error::TransferError;
use async_trait::async_trait;
use fetchd_types::{DownloadId, DownloadRecord};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// What to transfer and where to resume from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSpec {
    pub id: DownloadId,
    pub url: String,
    pub destination: PathBuf,
    pub headers: BTreeMap<String, String>,
    /// Bytes already on disk
    pub resume_offset: u64,
    pub total_bytes: Option<u64>,
}

impl TransferSpec {
    pub fn from_record(record: &DownloadRecord) -> Self {
        Self {
            id: record.id,
            url: record.url.clone(),
            destination: record.destination.clone(),
            headers: record.headers.clone(),
            resume_offset: record.downloaded_bytes,
            total_bytes: record.total_known(),
        }
    }
}

/// How a transfer ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { total_bytes: u64 },
    /// The stop token fired; bytes written so far are kept
    Stopped { downloaded_bytes: u64 },
}

type ReportFn = dyn Fn(u64, Option<u64>) + Send + Sync;

struct SinkInner {
    report: Box<ReportFn>,
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

/// Progress channel handed to an executor.
///
/// `report` is throttled to the configured interval; `report_now` always goes
/// through.
#[derive(Clone)]
pub struct ProgressSink {
    inner: Arc<SinkInner>,
}

impl ProgressSink {
    pub fn new<F>(interval: Duration, report: F) -> Self
    where
        F: Fn(u64, Option<u64>) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(SinkInner {
                report: Box::new(report),
                interval,
                last: Mutex::new(None),
            }),
        }
    }

    /// A sink that drops every report
    pub fn noop() -> Self {
        Self::new(Duration::ZERO, |_, _| {})
    }

    pub fn report(&self, downloaded: u64, total: Option<u64>) {
        {
            let mut last = self.inner.last.lock();
            let now = Instant::now();
            if let Some(previous) = *last {
                if now.duration_since(previous) < self.inner.interval {
                    return;
                }
            }
            *last = Some(now);
        }
        (self.inner.report)(downloaded, total);
    }

    pub fn report_now(&self, downloaded: u64, total: Option<u64>) {
        *self.inner.last.lock() = Some(Instant::now());
        (self.inner.report)(downloaded, total);
    }
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink")
            .field("interval", &self.inner.interval)
            .finish()
    }
}

/// Pluggable byte mover
#[async_trait]
pub trait TransferExecutor: Send + Sync + 'static {
    /// Run one transfer to completion, failure or stop.
    ///
    /// Must return `Stopped` promptly once `stop` is cancelled.
    async fn transfer(
        &self,
        spec: TransferSpec,
        progress: ProgressSink,
        stop: CancellationToken,
    ) -> Result<TransferOutcome, TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_sink_throttles_reports() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let sink = ProgressSink::new(Duration::from_secs(60), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sink.report(1, None);
        sink.report(2, None);
        sink.report(3, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sink.report_now(4, Some(10));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_spec_resumes_from_stored_bytes() {
        let mut record = DownloadRecord::from_request(
            fetchd_types::DownloadRequest::new("https://example.com/a", "/tmp/a"),
            fetchd_types::NetworkPolicy::Any,
        );
        record.downloaded_bytes = 4096;
        record.total_bytes = 10_000;

        let spec = TransferSpec::from_record(&record);
        assert_eq!(spec.resume_offset, 4096);
        assert_eq!(spec.total_bytes, Some(10_000));
    }
}
