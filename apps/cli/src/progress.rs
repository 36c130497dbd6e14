//! Progress bars for `fetchd run`

use crate::output::{format_eta, format_speed};
use console::style;
use fetchd_core::DownloadListener;
use fetchd_types::{DownloadId, DownloadRecord, DownloadStatus, ErrorKind};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;

/// One bar per download, driven by engine events
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: Mutex<HashMap<DownloadId, ProgressBar>>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix:20} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  ")
    }

    /// Create a bar for a download if it doesn't have one
    pub fn track(&self, record: &DownloadRecord) {
        let mut bars = self.bars.lock();
        if bars.contains_key(&record.id) {
            return;
        }

        let pb = self
            .multi
            .add(ProgressBar::new(record.total_known().unwrap_or(0)));
        pb.set_style(Self::style());
        pb.set_prefix(crate::output::truncate(&record.display_name, 20));
        pb.set_position(record.downloaded_bytes);
        pb.set_message(record.status.to_string());
        bars.insert(record.id, pb);
    }

    pub fn clear(&self) {
        for (_, pb) in self.bars.lock().drain() {
            if !pb.is_finished() {
                pb.abandon();
            }
        }
    }
}

impl DownloadListener for DownloadProgress {
    fn on_queued(&self, record: &DownloadRecord) {
        self.track(record);
    }

    fn on_progress(
        &self,
        id: DownloadId,
        _status: DownloadStatus,
        downloaded_bytes: u64,
        total_bytes: i64,
        eta_ms: i64,
        bytes_per_sec: u64,
    ) {
        let bars = self.bars.lock();
        if let Some(pb) = bars.get(&id) {
            if let Ok(total) = u64::try_from(total_bytes) {
                pb.set_length(total);
            }
            pb.set_position(downloaded_bytes);
            pb.set_message(format!(
                "{} eta {}",
                format_speed(bytes_per_sec),
                format_eta(eta_ms)
            ));
        }
    }

    fn on_status_changed(&self, id: DownloadId, status: DownloadStatus, error: ErrorKind) {
        let bars = self.bars.lock();
        let Some(pb) = bars.get(&id) else {
            return;
        };

        match status {
            DownloadStatus::Completed => {
                pb.finish_with_message(format!("{} Complete", style("✓").green().bold()));
            }
            DownloadStatus::Failed => {
                pb.set_message(format!("{} Failed: {}", style("✗").red().bold(), error));
            }
            DownloadStatus::Paused => {
                pb.set_message(format!("{} Paused", style("⏸").yellow()));
            }
            DownloadStatus::Cancelled => {
                pb.set_message(format!("{} Cancelled", style("○").dim()));
            }
            DownloadStatus::Queued => pb.set_message("queued"),
            DownloadStatus::Downloading => pb.set_message("starting"),
            DownloadStatus::Removed => {}
        }
    }

    fn on_removed(&self, id: DownloadId) {
        if let Some(pb) = self.bars.lock().remove(&id) {
            pb.finish_and_clear();
        }
    }

    fn on_halted(&self, reason: &str) {
        let _ = self
            .multi
            .println(format!("{} Engine halted: {}", style("✗").red().bold(), reason));
    }
}
