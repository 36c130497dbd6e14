//! Shared types for fetchd
//!
//! This crate contains the data model shared by the engine core and its hosts:
//! download records and requests, lifecycle enums, connectivity snapshots,
//! engine events and engine configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Sentinel for "total size not known yet"
pub const UNKNOWN_TOTAL: i64 = -1;

// ============================================================================
// Identity
// ============================================================================

/// Stable identifier of a download.
///
/// Derived from `(url, destination)` as a name-based UUID (v5), so enqueuing the
/// same url to the same destination always addresses the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(Uuid);

impl DownloadId {
    /// Namespace for name-based download ids
    pub const NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2d4e_8a3b_4c7d_9e0f_1a2b_3c4d_5e6f);

    /// Derive the id for a url/destination pair
    pub fn derive(url: &str, destination: &Path) -> Self {
        let destination = destination.to_string_lossy();
        let mut name = Vec::with_capacity(url.len() + destination.len() + 1);
        name.extend_from_slice(url.as_bytes());
        // Separator keeps ("ab", "c") and ("a", "bc") apart
        name.push(0);
        name.extend_from_slice(destination.as_bytes());
        Self(Uuid::new_v5(&Self::NAMESPACE, &name))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Short prefix for tables and log lines
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DownloadId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Caller-assigned bucket for bulk operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

impl GroupId {
    pub const DEFAULT: GroupId = GroupId(0);
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Lifecycle enums
// ============================================================================

/// Scheduling priority, higher runs first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Numeric rank used for persistence and ordering
    pub fn rank(self) -> i64 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            i64::MIN..=0 => Priority::Low,
            1 => Priority::Normal,
            _ => Priority::High,
        }
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(ParseEnumError::new("priority", other)),
        }
    }
}

/// Which networks a download may run on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    #[default]
    Any,
    UnmeteredOnly,
}

impl NetworkPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkPolicy::Any => "any",
            NetworkPolicy::UnmeteredOnly => "unmetered_only",
        }
    }
}

impl FromStr for NetworkPolicy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(NetworkPolicy::Any),
            "unmetered_only" | "unmetered" => Ok(NetworkPolicy::UnmeteredOnly),
            other => Err(ParseEnumError::new("network policy", other)),
        }
    }
}

/// Status of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Cancelled,
    Failed,
    Removed,
}

impl DownloadStatus {
    pub const ALL: [DownloadStatus; 7] = [
        DownloadStatus::Queued,
        DownloadStatus::Downloading,
        DownloadStatus::Paused,
        DownloadStatus::Completed,
        DownloadStatus::Cancelled,
        DownloadStatus::Failed,
        DownloadStatus::Removed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Cancelled => "cancelled",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Removed => "removed",
        }
    }

    /// No transition leaves a terminal status
    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Removed)
    }

    /// Statuses that keep a host busy
    pub fn is_pending(self) -> bool {
        matches!(self, DownloadStatus::Queued | DownloadStatus::Downloading)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DownloadStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseEnumError::new("status", s))
    }
}

/// Error recorded on a download
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[default]
    None,
    /// The transfer failed because connectivity went away
    NetworkUnavailable,
    /// Generic I/O or protocol failure reported by the executor
    TransferFailed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::None => "none",
            ErrorKind::NetworkUnavailable => "network_unavailable",
            ErrorKind::TransferFailed => "transfer_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ErrorKind::None),
            "network_unavailable" => Ok(ErrorKind::NetworkUnavailable),
            "transfer_failed" => Ok(ErrorKind::TransferFailed),
            other => Err(ParseEnumError::new("error kind", other)),
        }
    }
}

/// Why a download is paused.
///
/// `status` alone cannot tell a user pause from an auto-pause, so the reason is
/// stored alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Explicit pause command, only an explicit resume lifts it
    User,
    /// Network became inadmissible, lifted when it is admissible again
    Network,
    /// Engine shut down mid-transfer, re-queued on next start
    Shutdown,
}

impl PauseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PauseReason::User => "user",
            PauseReason::Network => "network",
            PauseReason::Shutdown => "shutdown",
        }
    }
}

impl FromStr for PauseReason {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(PauseReason::User),
            "network" => Ok(PauseReason::Network),
            "shutdown" => Ok(PauseReason::Shutdown),
            other => Err(ParseEnumError::new("pause reason", other)),
        }
    }
}

/// Failure to parse one of the lifecycle enums from text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.what, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

// ============================================================================
// Download Types
// ============================================================================

/// A request to download `url` into `destination`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub group: GroupId,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// `None` falls back to the engine's default policy
    #[serde(default)]
    pub network_policy: Option<NetworkPolicy>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            display_name: None,
            group: GroupId::DEFAULT,
            priority: Priority::Normal,
            headers: BTreeMap::new(),
            network_policy: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_group(mut self, group: GroupId) -> Self {
        self.group = group;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_network_policy(mut self, policy: NetworkPolicy) -> Self {
        self.network_policy = Some(policy);
        self
    }

    /// The id this request will be stored under
    pub fn id(&self) -> DownloadId {
        DownloadId::derive(&self.url, &self.destination)
    }
}

/// Persisted state of a single download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: DownloadId,
    pub url: String,
    pub destination: PathBuf,
    pub display_name: String,
    pub group: GroupId,
    pub priority: Priority,
    pub headers: BTreeMap<String, String>,
    pub network_policy: NetworkPolicy,
    pub downloaded_bytes: u64,
    /// `UNKNOWN_TOTAL` until the size is known
    pub total_bytes: i64,
    pub status: DownloadStatus,
    pub error: ErrorKind,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub pause_reason: Option<PauseReason>,
    pub created_at: DateTime<Utc>,
}

impl DownloadRecord {
    /// Build a fresh `Queued` record from a request
    pub fn from_request(request: DownloadRequest, default_policy: NetworkPolicy) -> Self {
        let id = request.id();
        let display_name = request.display_name.clone().unwrap_or_else(|| {
            request
                .destination
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "download".to_string())
        });

        Self {
            id,
            url: request.url,
            destination: request.destination,
            display_name,
            group: request.group,
            priority: request.priority,
            headers: request.headers,
            network_policy: request.network_policy.unwrap_or(default_policy),
            downloaded_bytes: 0,
            total_bytes: UNKNOWN_TOTAL,
            status: DownloadStatus::Queued,
            error: ErrorKind::None,
            error_message: None,
            pause_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn total_known(&self) -> Option<u64> {
        u64::try_from(self.total_bytes).ok()
    }

    /// Percentage complete, `None` while the total is unknown
    pub fn progress(&self) -> Option<f64> {
        match self.total_known() {
            Some(0) => Some(100.0),
            Some(total) => Some((self.downloaded_bytes as f64 / total as f64) * 100.0),
            None => None,
        }
    }
}

// ============================================================================
// Connectivity
// ============================================================================

/// Kind of network currently in use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    #[default]
    None,
    Cellular,
    Unmetered,
}

/// A connectivity snapshot pushed by the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connectivity {
    pub connected: bool,
    pub kind: NetworkKind,
}

impl Connectivity {
    pub fn offline() -> Self {
        Self {
            connected: false,
            kind: NetworkKind::None,
        }
    }

    pub fn cellular() -> Self {
        Self {
            connected: true,
            kind: NetworkKind::Cellular,
        }
    }

    pub fn unmetered() -> Self {
        Self {
            connected: true,
            kind: NetworkKind::Unmetered,
        }
    }

    /// Whether a download under `policy` may run on this network
    pub fn admits(&self, policy: NetworkPolicy) -> bool {
        match policy {
            NetworkPolicy::Any => self.connected,
            NetworkPolicy::UnmeteredOnly => self.connected && self.kind == NetworkKind::Unmetered,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the engine to listeners
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    Queued {
        record: DownloadRecord,
    },
    Progress {
        id: DownloadId,
        status: DownloadStatus,
        downloaded_bytes: u64,
        total_bytes: i64,
        /// `-1` when unknown
        eta_ms: i64,
        bytes_per_sec: u64,
    },
    StatusChanged {
        id: DownloadId,
        status: DownloadStatus,
        error: ErrorKind,
    },
    Removed {
        id: DownloadId,
    },
    /// The engine stopped dispatching after a storage failure
    Halted {
        reason: String,
    },
}

impl EngineEvent {
    /// The download this event is about, if any
    pub fn download_id(&self) -> Option<DownloadId> {
        match self {
            EngineEvent::Queued { record } => Some(record.id),
            EngineEvent::Progress { id, .. }
            | EngineEvent::StatusChanged { id, .. }
            | EngineEvent::Removed { id } => Some(*id),
            EngineEvent::Halted { .. } => None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent transfer slots
    pub max_concurrent: usize,
    /// Minimum interval between executor progress reports
    pub progress_interval_ms: u64,
    /// How long a stopped executor may take to return before it is dropped
    pub stop_grace_ms: u64,
    /// Samples kept in the throughput window
    pub throughput_window: usize,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
    /// Idle time after which a host may shut the engine down
    pub idle_shutdown_ms: u64,
    /// How often running transfers are checked against the store
    pub reconcile_interval_ms: u64,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Policy applied to requests that don't set one
    pub default_network_policy: NetworkPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            progress_interval_ms: 500,
            stop_grace_ms: 5_000,
            throughput_window: 10,
            event_capacity: 1000,
            idle_shutdown_ms: 10_000,
            reconcile_interval_ms: 1_000,
            user_agent: concat!("fetchd/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: 30,
            default_network_policy: NetworkPolicy::Any,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_is_deterministic() {
        let a = DownloadId::derive("https://example.com/a.bin", Path::new("/tmp/a.bin"));
        let b = DownloadId::derive("https://example.com/a.bin", Path::new("/tmp/a.bin"));
        assert_eq!(a, b);
        assert_eq!(a, DownloadRequest::new("https://example.com/a.bin", "/tmp/a.bin").id());
    }

    #[test]
    fn test_id_separates_url_and_destination() {
        let a = DownloadId::derive("https://example.com/ab", Path::new("c"));
        let b = DownloadId::derive("https://example.com/a", Path::new("bc"));
        assert_ne!(a, b);

        let other_dest = DownloadId::derive("https://example.com/ab", Path::new("d"));
        assert_ne!(a, other_dest);
    }

    #[test]
    fn test_id_parses_back() {
        let id = DownloadId::derive("https://example.com/x", Path::new("x"));
        let parsed: DownloadId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        for p in [Priority::Low, Priority::Normal, Priority::High] {
            assert_eq!(Priority::from_rank(p.rank()), p);
        }
    }

    #[test]
    fn test_status_round_trip_text() {
        for status in DownloadStatus::ALL {
            assert_eq!(status.as_str().parse::<DownloadStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<DownloadStatus>().is_err());
    }

    #[test]
    fn test_admission() {
        assert!(Connectivity::unmetered().admits(NetworkPolicy::UnmeteredOnly));
        assert!(Connectivity::unmetered().admits(NetworkPolicy::Any));
        assert!(Connectivity::cellular().admits(NetworkPolicy::Any));
        assert!(!Connectivity::cellular().admits(NetworkPolicy::UnmeteredOnly));
        assert!(!Connectivity::offline().admits(NetworkPolicy::Any));
        // Connected flag wins over a stale kind
        let odd = Connectivity {
            connected: false,
            kind: NetworkKind::Unmetered,
        };
        assert!(!odd.admits(NetworkPolicy::UnmeteredOnly));
    }

    #[test]
    fn test_record_from_request() {
        let request = DownloadRequest::new("https://example.com/file.zip", "/downloads/file.zip")
            .with_priority(Priority::High)
            .with_group(GroupId(7))
            .with_header("Authorization", "Bearer x");
        let record = DownloadRecord::from_request(request.clone(), NetworkPolicy::UnmeteredOnly);

        assert_eq!(record.id, request.id());
        assert_eq!(record.display_name, "file.zip");
        assert_eq!(record.status, DownloadStatus::Queued);
        assert_eq!(record.total_bytes, UNKNOWN_TOTAL);
        assert_eq!(record.network_policy, NetworkPolicy::UnmeteredOnly);
        assert_eq!(record.progress(), None);
        assert_eq!(record.headers.get("Authorization").map(String::as_str), Some("Bearer x"));
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_concurrent": 5}"#).unwrap();
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.stop_grace_ms, EngineConfig::default().stop_grace_ms);
    }
}
