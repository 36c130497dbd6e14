//! Network admission
//!
//! Tracks the latest connectivity snapshot and decides which records may run
//! on it. Recomputing a plan for the same snapshot yields the same triggers,
//! so duplicate notifications are harmless.

use crate::engine::machine::Trigger;
use fetchd_types::{Connectivity, DownloadId, DownloadRecord, DownloadStatus, ErrorKind, PauseReason};
use tracing::info;

/// Statuses the admission plan looks at
pub(crate) const AFFECTED: [DownloadStatus; 3] = [
    DownloadStatus::Downloading,
    DownloadStatus::Paused,
    DownloadStatus::Failed,
];

#[derive(Debug, Clone)]
pub struct AdmissionController {
    current: Connectivity,
}

impl AdmissionController {
    pub fn new(initial: Connectivity) -> Self {
        Self { current: initial }
    }

    /// Store a new snapshot, returns whether it differs from the last one
    pub fn update(&mut self, next: Connectivity) -> bool {
        let changed = self.current != next;
        if changed {
            info!(
                "Connectivity changed: connected={} kind={:?}",
                next.connected, next.kind
            );
        }
        self.current = next;
        changed
    }

    pub fn admits(&self, record: &DownloadRecord) -> bool {
        self.current.admits(record.network_policy)
    }

    /// Triggers to apply after a connectivity change
    pub fn plan(&self, records: &[DownloadRecord]) -> Vec<(DownloadId, Trigger)> {
        records
            .iter()
            .filter_map(|record| {
                let admitted = self.admits(record);
                match record.status {
                    DownloadStatus::Downloading if !admitted => {
                        Some((record.id, Trigger::Pause(PauseReason::Network)))
                    }
                    DownloadStatus::Paused
                        if admitted && record.pause_reason == Some(PauseReason::Network) =>
                    {
                        Some((record.id, Trigger::NetworkRestored))
                    }
                    DownloadStatus::Failed
                        if admitted && record.error == ErrorKind::NetworkUnavailable =>
                    {
                        Some((record.id, Trigger::NetworkRestored))
                    }
                    _ => None,
                }
            })
            .collect()
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(Connectivity::unmetered())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchd_types::{DownloadRequest, NetworkPolicy};

    fn record(name: &str, policy: NetworkPolicy, status: DownloadStatus) -> DownloadRecord {
        let mut record = DownloadRecord::from_request(
            DownloadRequest::new(format!("https://example.com/{}", name), format!("/tmp/{}", name))
                .with_network_policy(policy),
            NetworkPolicy::Any,
        );
        record.status = status;
        record
    }

    #[test]
    fn test_cellular_pauses_unmetered_only() {
        let mut admission = AdmissionController::default();
        assert!(admission.update(Connectivity::cellular()));

        let wifi_only = record("a", NetworkPolicy::UnmeteredOnly, DownloadStatus::Downloading);
        let any = record("b", NetworkPolicy::Any, DownloadStatus::Downloading);
        let plan = admission.plan(&[wifi_only.clone(), any]);

        assert_eq!(plan, vec![(wifi_only.id, Trigger::Pause(PauseReason::Network))]);
    }

    #[test]
    fn test_restore_skips_user_pauses() {
        let admission = AdmissionController::new(Connectivity::unmetered());

        let mut by_network = record("a", NetworkPolicy::UnmeteredOnly, DownloadStatus::Paused);
        by_network.pause_reason = Some(PauseReason::Network);
        let mut by_user = record("b", NetworkPolicy::UnmeteredOnly, DownloadStatus::Paused);
        by_user.pause_reason = Some(PauseReason::User);
        let mut offline_failure = record("c", NetworkPolicy::Any, DownloadStatus::Failed);
        offline_failure.error = ErrorKind::NetworkUnavailable;

        let plan = admission.plan(&[by_network.clone(), by_user, offline_failure.clone()]);
        assert_eq!(
            plan,
            vec![
                (by_network.id, Trigger::NetworkRestored),
                (offline_failure.id, Trigger::NetworkRestored),
            ]
        );
    }

    #[test]
    fn test_duplicate_update_is_not_a_change() {
        let mut admission = AdmissionController::new(Connectivity::offline());
        assert!(!admission.update(Connectivity::offline()));
        assert!(admission.update(Connectivity::unmetered()));
    }
}
