//! Download lifecycle state machine
//!
//! Pure function from (record, trigger) to a [`Step`]. The coordinator applies
//! the resulting store updates and effects; nothing here touches I/O.

use crate::store::StatusUpdate;
use fetchd_types::{DownloadRecord, DownloadStatus, ErrorKind, PauseReason};

/// Something that can happen to a download
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// A worker slot picked the record
    Dispatch,
    Progress { downloaded: u64, total: Option<u64> },
    Succeeded { total_bytes: u64 },
    Failed { kind: ErrorKind, message: String },
    /// The executor returned after a stop request with its final byte count
    Settled { downloaded: u64 },
    Pause(PauseReason),
    Resume,
    Retry,
    Cancel,
    Remove,
    /// Connectivity now admits the record
    NetworkRestored,
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::Dispatch => "dispatch",
            Trigger::Progress { .. } => "progress",
            Trigger::Succeeded { .. } => "complete",
            Trigger::Failed { .. } => "fail",
            Trigger::Settled { .. } => "settle",
            Trigger::Pause(_) => "pause",
            Trigger::Resume => "resume",
            Trigger::Retry => "retry",
            Trigger::Cancel => "cancel",
            Trigger::Remove => "remove",
            Trigger::NetworkRestored => "restore",
        }
    }
}

/// Store writes and side effects produced by one trigger
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Change {
    pub status: Option<StatusUpdate>,
    /// New `(downloaded, total)` pair
    pub progress: Option<(u64, i64)>,
    pub stop_executor: bool,
    pub delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Trigger accepted, nothing changes
    Unchanged,
    /// Trigger arrived for a state it no longer applies to
    Stale,
    /// Command not allowed from the current state
    Invalid,
    Apply(Change),
}

impl Step {
    fn status(update: StatusUpdate) -> Self {
        Step::Apply(Change {
            status: Some(update),
            ..Change::default()
        })
    }

    fn stopping(update: StatusUpdate, delete: bool) -> Self {
        Step::Apply(Change {
            status: Some(update),
            stop_executor: true,
            delete,
            ..Change::default()
        })
    }
}

/// Compute the step for `trigger` applied to `record`
pub fn transition(record: &DownloadRecord, trigger: &Trigger) -> Step {
    use DownloadStatus::*;

    let status = record.status;
    match trigger {
        Trigger::Dispatch => match status {
            Queued => Step::status(StatusUpdate::plain(Downloading)),
            _ => Step::Stale,
        },

        Trigger::Progress { downloaded, total } => {
            if status != Downloading {
                return Step::Stale;
            }
            match merge_progress(record, *downloaded, *total) {
                Some(progress) => Step::Apply(Change {
                    progress: Some(progress),
                    ..Change::default()
                }),
                None => Step::Unchanged,
            }
        }

        Trigger::Succeeded { total_bytes } => match status {
            Downloading => {
                let size = (*total_bytes).max(record.downloaded_bytes);
                Step::Apply(Change {
                    status: Some(StatusUpdate::plain(Completed)),
                    progress: Some((size, size as i64)),
                    ..Change::default()
                })
            }
            _ => Step::Stale,
        },

        Trigger::Failed { kind, message } => match status {
            Downloading => Step::status(StatusUpdate::failed(*kind, Some(message.clone()))),
            _ => Step::Stale,
        },

        Trigger::Settled { downloaded } => match status {
            Downloading | Completed | Removed => Step::Stale,
            _ => match merge_progress(record, *downloaded, None) {
                Some(progress) => Step::Apply(Change {
                    progress: Some(progress),
                    ..Change::default()
                }),
                None => Step::Unchanged,
            },
        },

        Trigger::Pause(reason) => match status {
            Downloading => Step::stopping(StatusUpdate::paused(*reason), false),
            Queued if *reason == PauseReason::User => Step::status(StatusUpdate::paused(*reason)),
            // A user pause outranks an automatic one
            Paused if *reason == PauseReason::User && record.pause_reason != Some(PauseReason::User) => {
                Step::status(StatusUpdate::paused(PauseReason::User))
            }
            _ => Step::Unchanged,
        },

        Trigger::Resume => match status {
            Paused => Step::status(StatusUpdate::plain(Queued)),
            _ => Step::Unchanged,
        },

        Trigger::Retry => match status {
            Failed | Cancelled => Step::status(StatusUpdate::plain(Queued)),
            _ => Step::Invalid,
        },

        Trigger::Cancel => match status {
            Downloading => Step::stopping(StatusUpdate::plain(Cancelled), false),
            Queued | Paused | Failed => Step::status(StatusUpdate::plain(Cancelled)),
            _ => Step::Unchanged,
        },

        Trigger::Remove => match status {
            Removed => Step::Unchanged,
            Downloading => Step::stopping(StatusUpdate::plain(Removed), true),
            _ => Step::Apply(Change {
                status: Some(StatusUpdate::plain(Removed)),
                delete: true,
                ..Change::default()
            }),
        },

        Trigger::NetworkRestored => match status {
            Paused if record.pause_reason == Some(PauseReason::Network) => {
                Step::status(StatusUpdate::plain(Queued))
            }
            Failed if record.error == ErrorKind::NetworkUnavailable => {
                Step::status(StatusUpdate::plain(Queued))
            }
            _ => Step::Unchanged,
        },
    }
}

/// Monotonic, clamped progress. `None` when nothing changes.
///
/// A reported total below the bytes already on disk is ignored.
fn merge_progress(record: &DownloadRecord, downloaded: u64, total: Option<u64>) -> Option<(u64, i64)> {
    let mut next = downloaded.max(record.downloaded_bytes);
    let total = match total {
        Some(total) if total >= record.downloaded_bytes => total as i64,
        _ => record.total_bytes,
    };

    if let Ok(limit) = u64::try_from(total) {
        next = next.min(limit.max(record.downloaded_bytes));
    }

    if next == record.downloaded_bytes && total == record.total_bytes {
        None
    } else {
        Some((next, total))
    }
}
