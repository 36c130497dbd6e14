//! SQLite-based record store
//!
//! One row per download. Status, error and pause reason are stored as text so
//! the database stays readable with the sqlite3 shell.

use crate::error::{EngineError, Result, StorageError};
use crate::store::{RecordStore, StatusUpdate};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use fetchd_types::{
    DownloadId, DownloadRecord, DownloadStatus, ErrorKind, GroupId, NetworkPolicy, PauseReason,
    Priority,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS downloads (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        url TEXT NOT NULL,
        destination TEXT NOT NULL,
        display_name TEXT NOT NULL,
        group_id INTEGER NOT NULL DEFAULT 0,
        priority INTEGER NOT NULL DEFAULT 1,
        headers TEXT NOT NULL DEFAULT '{}',
        network_policy TEXT NOT NULL DEFAULT 'any',
        downloaded INTEGER NOT NULL DEFAULT 0,
        total INTEGER NOT NULL DEFAULT -1,
        status TEXT NOT NULL,
        error TEXT NOT NULL DEFAULT 'none',
        error_message TEXT,
        pause_reason TEXT,
        created_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_downloads_destination ON downloads(destination);
    CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);
    CREATE INDEX IF NOT EXISTS idx_downloads_group ON downloads(group_id, status);
"#;

const ORDER: &str = "ORDER BY priority DESC, created_at ASC, seq ASC";

/// Record store backed by a SQLite database
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StorageError::from)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("Opened record store at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database, mostly for tests
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // A second connection would see a different empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for open connections to finish
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_ordered(&self, filter: &str, binds: Vec<Bind>) -> Result<Vec<DownloadRecord>> {
        let sql = format!("SELECT * FROM downloads {} {}", filter, ORDER);
        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = match bind {
                Bind::Text(value) => query.bind(value),
                Bind::Int(value) => query.bind(value),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_record).collect()
    }
}

enum Bind {
    Text(String),
    Int(i64),
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert(&self, record: &DownloadRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let destination = record.destination.to_string_lossy().to_string();

        let existing = sqlx::query("SELECT id FROM downloads WHERE id = ? OR destination = ? LIMIT 1")
            .bind(record.id.to_string())
            .bind(&destination)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = existing {
            let existing_id: String = row.try_get("id")?;
            if existing_id == record.id.to_string() {
                return Err(EngineError::AlreadyExists(record.id));
            }
            return Err(EngineError::DuplicateDestination(record.destination.clone()));
        }

        let headers = serde_json::to_string(&record.headers).map_err(StorageError::from)?;

        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, url, destination, display_name, group_id, priority, headers,
                network_policy, downloaded, total, status, error, error_message,
                pause_reason, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.url)
        .bind(&destination)
        .bind(&record.display_name)
        .bind(record.group.0 as i64)
        .bind(record.priority.rank())
        .bind(headers)
        .bind(record.network_policy.as_str())
        .bind(record.downloaded_bytes as i64)
        .bind(record.total_bytes)
        .bind(record.status.as_str())
        .bind(record.error.as_str())
        .bind(record.error_message.as_deref())
        .bind(record.pause_reason.map(PauseReason::as_str))
        .bind(record.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Inserted download {}", record.id);
        Ok(())
    }

    async fn get(&self, id: DownloadId) -> Result<Option<DownloadRecord>> {
        let row = sqlx::query("SELECT * FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_record).transpose()
    }

    async fn update_status(&self, id: DownloadId, update: &StatusUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE downloads
            SET status = ?, error = ?, error_message = ?, pause_reason = ?
            WHERE id = ?
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.error.as_str())
        .bind(update.error_message.as_deref())
        .bind(update.pause_reason.map(PauseReason::as_str))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(id));
        }
        Ok(())
    }

    async fn update_progress(&self, id: DownloadId, downloaded: u64, total: i64) -> Result<()> {
        let result = sqlx::query("UPDATE downloads SET downloaded = ?, total = ? WHERE id = ?")
            .bind(downloaded as i64)
            .bind(total)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(id));
        }
        Ok(())
    }

    async fn query_by_status(&self, statuses: &[DownloadStatus]) -> Result<Vec<DownloadRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = statuses.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let binds = statuses
            .iter()
            .map(|status| Bind::Text(status.as_str().to_string()))
            .collect();
        self.fetch_ordered(&format!("WHERE status IN ({})", placeholders), binds)
            .await
    }

    async fn query_by_group(&self, group: GroupId) -> Result<Vec<DownloadRecord>> {
        self.fetch_ordered("WHERE group_id = ?", vec![Bind::Int(group.0 as i64)])
            .await
    }

    async fn query_all(&self) -> Result<Vec<DownloadRecord>> {
        self.fetch_ordered("", Vec::new()).await
    }

    async fn delete(&self, id: DownloadId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM downloads").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn recover_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE downloads
            SET status = 'queued', pause_reason = NULL
            WHERE status = 'downloading'
               OR (status = 'paused' AND pause_reason = 'shutdown')
            "#,
        )
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!("Re-queued {} interrupted downloads", recovered);
        }
        Ok(recovered)
    }

    async fn flush(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn corrupt(id: &str, reason: impl ToString) -> EngineError {
    StorageError::Corrupt {
        id: id.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Convert a database row to a record
fn row_to_record(row: SqliteRow) -> Result<DownloadRecord> {
    let id_text: String = row.try_get("id")?;
    let id = DownloadId::from_str(&id_text).map_err(|e| corrupt(&id_text, e))?;

    let status = row
        .try_get::<String, _>("status")?
        .parse::<DownloadStatus>()
        .map_err(|e| corrupt(&id_text, e))?;
    let error = row
        .try_get::<String, _>("error")?
        .parse::<ErrorKind>()
        .map_err(|e| corrupt(&id_text, e))?;
    let network_policy = row
        .try_get::<String, _>("network_policy")?
        .parse::<NetworkPolicy>()
        .map_err(|e| corrupt(&id_text, e))?;
    let pause_reason = row
        .try_get::<Option<String>, _>("pause_reason")?
        .map(|reason| reason.parse::<PauseReason>())
        .transpose()
        .map_err(|e| corrupt(&id_text, e))?;
    let headers = serde_json::from_str(&row.try_get::<String, _>("headers")?)
        .map_err(StorageError::from)?;
    let created_at = DateTime::parse_from_rfc3339(&row.try_get::<String, _>("created_at")?)
        .map_err(|e| corrupt(&id_text, e))?
        .with_timezone(&Utc);

    Ok(DownloadRecord {
        id,
        url: row.try_get("url")?,
        destination: PathBuf::from(row.try_get::<String, _>("destination")?),
        display_name: row.try_get("display_name")?,
        group: GroupId(row.try_get::<i64, _>("group_id")? as u32),
        priority: Priority::from_rank(row.try_get("priority")?),
        headers,
        network_policy,
        downloaded_bytes: row.try_get::<i64, _>("downloaded")?.max(0) as u64,
        total_bytes: row.try_get("total")?,
        status,
        error,
        error_message: row.try_get("error_message")?,
        pause_reason,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchd_types::{DownloadRequest, ErrorKind, NetworkPolicy};
    use tempfile::TempDir;

    fn record(name: &str) -> DownloadRecord {
        DownloadRecord::from_request(
            DownloadRequest::new(format!("https://example.com/{}", name), format!("/data/{}", name))
                .with_header("Accept", "*/*"),
            NetworkPolicy::Any,
        )
    }

    #[tokio::test]
    async fn test_insert_and_get_preserves_fields() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut original = record("a.bin");
        original.priority = Priority::High;
        original.group = GroupId(3);
        original.network_policy = NetworkPolicy::UnmeteredOnly;
        store.insert(&original).await.unwrap();

        let loaded = store.get(original.id).await.unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn test_duplicate_detection() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = record("a.bin");
        store.insert(&a).await.unwrap();

        assert!(matches!(store.insert(&a).await, Err(EngineError::AlreadyExists(_))));

        let mut clash = record("b.bin");
        clash.destination = a.destination.clone();
        assert!(matches!(
            store.insert(&clash).await,
            Err(EngineError::DuplicateDestination(_))
        ));
        assert_eq!(store.query_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_update_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = record("a.bin");
        store.insert(&a).await.unwrap();

        store
            .update_status(a.id, &StatusUpdate::failed(ErrorKind::NetworkUnavailable, Some("dns".into())))
            .await
            .unwrap();
        let loaded = store.get(a.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DownloadStatus::Failed);
        assert_eq!(loaded.error, ErrorKind::NetworkUnavailable);
        assert_eq!(loaded.error_message.as_deref(), Some("dns"));

        store
            .update_status(a.id, &StatusUpdate::paused(PauseReason::Network))
            .await
            .unwrap();
        let loaded = store.get(a.id).await.unwrap().unwrap();
        assert_eq!(loaded.pause_reason, Some(PauseReason::Network));
        assert_eq!(loaded.error, ErrorKind::None);
    }

    #[tokio::test]
    async fn test_query_by_status_ordering() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        let mut rows = Vec::new();
        for (name, priority) in [
            ("1", Priority::Low),
            ("2", Priority::High),
            ("3", Priority::Normal),
            ("4", Priority::High),
        ] {
            let mut r = record(name);
            r.priority = priority;
            r.created_at = now;
            store.insert(&r).await.unwrap();
            rows.push(r);
        }

        let ids: Vec<_> = store
            .query_by_status(&[DownloadStatus::Queued])
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![rows[1].id, rows[3].id, rows[2].id, rows[0].id]);
        assert!(store.query_by_status(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fetchd.db");
        let a = record("a.bin");

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.insert(&a).await.unwrap();
            store
                .update_status(a.id, &StatusUpdate::plain(DownloadStatus::Downloading))
                .await
                .unwrap();
            store.update_progress(a.id, 4096, 8192).await.unwrap();
            store.flush().await.unwrap();
            store.close().await;
        }

        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(store.recover_interrupted().await.unwrap(), 1);
        let loaded = store.get(a.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DownloadStatus::Queued);
        assert_eq!(loaded.downloaded_bytes, 4096);
        assert_eq!(loaded.total_bytes, 8192);
    }

    #[tokio::test]
    async fn test_delete_and_group_queries() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut a = record("a.bin");
        a.group = GroupId(9);
        let b = record("b.bin");
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        let group = store.query_by_group(GroupId(9)).await.unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(group[0].id, a.id);

        assert!(store.delete(a.id).await.unwrap());
        assert!(!store.delete(a.id).await.unwrap());
        assert_eq!(store.delete_all().await.unwrap(), 1);
        assert!(store.query_all().await.unwrap().is_empty());
    }
}
