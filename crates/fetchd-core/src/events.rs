//! Event fan-out to listeners
//!
//! Events go out on a broadcast channel. Each registered listener gets its own
//! receiver and delivery task, so a slow listener only lags itself and
//! publishing never waits on anyone.

use fetchd_types::{DownloadId, DownloadRecord, DownloadStatus, EngineEvent, ErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Callbacks for download events. Every method defaults to a no-op.
pub trait DownloadListener: Send + Sync + 'static {
    fn on_queued(&self, _record: &DownloadRecord) {}

    fn on_progress(
        &self,
        _id: DownloadId,
        _status: DownloadStatus,
        _downloaded_bytes: u64,
        _total_bytes: i64,
        _eta_ms: i64,
        _bytes_per_sec: u64,
    ) {
    }

    fn on_status_changed(&self, _id: DownloadId, _status: DownloadStatus, _error: ErrorKind) {}

    fn on_removed(&self, _id: DownloadId) {}

    fn on_halted(&self, _reason: &str) {}
}

/// Handle returned by [`EventBus::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    listeners: Arc<Mutex<HashMap<ListenerId, JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Deliver future events to `listener` until it is unregistered
    pub fn register(&self, listener: Arc<dyn DownloadListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut rx = self.tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => deliver(listener.as_ref(), &event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Listener {:?} lagged, skipped {} events", id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.listeners.lock().insert(id, handle);
        debug!("Registered listener {:?}", id);
        id
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        match self.listeners.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

fn deliver(listener: &dyn DownloadListener, event: &EngineEvent) {
    match event {
        EngineEvent::Queued { record } => listener.on_queued(record),
        EngineEvent::Progress {
            id,
            status,
            downloaded_bytes,
            total_bytes,
            eta_ms,
            bytes_per_sec,
        } => listener.on_progress(
            *id,
            *status,
            *downloaded_bytes,
            *total_bytes,
            *eta_ms,
            *bytes_per_sec,
        ),
        EngineEvent::StatusChanged { id, status, error } => {
            listener.on_status_changed(*id, *status, *error)
        }
        EngineEvent::Removed { id } => listener.on_removed(*id),
        EngineEvent::Halted { reason } => listener.on_halted(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<(DownloadId, DownloadStatus)>);

    impl DownloadListener for Forward {
        fn on_status_changed(&self, id: DownloadId, status: DownloadStatus, _error: ErrorKind) {
            let _ = self.0.send((id, status));
        }
    }

    fn id() -> DownloadId {
        DownloadId::derive("https://example.com/a", std::path::Path::new("/tmp/a"))
    }

    #[tokio::test]
    async fn test_listener_receives_in_order() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.register(Arc::new(Forward(tx)));

        for status in [DownloadStatus::Downloading, DownloadStatus::Paused, DownloadStatus::Queued] {
            bus.publish(EngineEvent::StatusChanged {
                id: id(),
                status,
                error: ErrorKind::None,
            });
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap().1);
        }
        assert_eq!(
            seen,
            vec![DownloadStatus::Downloading, DownloadStatus::Paused, DownloadStatus::Queued]
        );
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = bus.register(Arc::new(Forward(tx)));

        assert!(bus.unregister(listener));
        assert!(!bus.unregister(listener));
        bus.publish(EngineEvent::StatusChanged {
            id: id(),
            status: DownloadStatus::Completed,
            error: ErrorKind::None,
        });

        let received = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        // Either nothing arrives or the sender was dropped with the task
        assert!(matches!(received, Err(_) | Ok(None)));
    }

    #[tokio::test]
    async fn test_publish_without_receivers_is_silent() {
        let bus = EventBus::new(1);
        bus.publish(EngineEvent::Removed { id: id() });
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::Removed { id: id() });
        tokio_test::assert_ok!(rx.recv().await);
    }
}
