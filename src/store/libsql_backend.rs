//! libSQL backend for the async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::ClassificationSource;
use crate::store::migrations;
use crate::store::traits::{
    ActivityCounts, ActivityEntry, ActivityStatus, Database, ProcessedRecord,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed width, so string comparison orders by time.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_to_activity(row: &libsql::Row) -> Result<ActivityEntry, libsql::Error> {
    let id_str: String = row.get(0)?;
    let source_str: String = row.get(6)?;
    let status_str: String = row.get(8)?;
    let created_str: String = row.get(9)?;

    Ok(ActivityEntry {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        message_id: row.get(1)?,
        sender: row.get(2)?,
        subject: row.get(3)?,
        action: row.get(4)?,
        label: row.get::<String>(5).ok(),
        source: ClassificationSource::parse(&source_str),
        reason: row.get(7)?,
        status: ActivityStatus::parse(&status_str),
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const ACTIVITY_COLUMNS: &str =
    "id, message_id, sender, subject, action, label, source, reason, status, created_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Activity log ────────────────────────────────────────────────

    async fn record_activity(&self, entry: &ActivityEntry) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO activity_log ({ACTIVITY_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    entry.id.to_string(),
                    entry.message_id.as_str(),
                    entry.sender.as_str(),
                    entry.subject.as_str(),
                    entry.action.as_str(),
                    opt_text(entry.label.as_deref()),
                    entry.source.as_str(),
                    entry.reason.as_str(),
                    entry.status.as_str(),
                    format_datetime(&entry.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_activity: {e}")))?;
        Ok(())
    }

    async fn recent_activity(&self, limit: usize) -> Result<Vec<ActivityEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACTIVITY_COLUMNS} FROM activity_log \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_activity: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_activity(&row) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!("Skipping activity row: {e}");
                }
            }
        }
        Ok(entries)
    }

    async fn activity_counts(
        &self,
        since: DateTime<Utc>,
    ) -> Result<ActivityCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, action, COUNT(*) FROM activity_log \
                 WHERE created_at >= ?1 GROUP BY status, action",
                params![format_datetime(&since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("activity_counts: {e}")))?;

        let mut counts = ActivityCounts::default();
        while let Ok(Some(row)) = rows.next().await {
            let status: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            let action: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            let n = row.get::<i64>(2).unwrap_or(0).max(0) as u64;

            match (ActivityStatus::parse(&status), action.as_str()) {
                (ActivityStatus::Applied, "label") => counts.labeled += n,
                (ActivityStatus::Applied, "delete") => counts.deleted += n,
                (ActivityStatus::Applied, _) | (ActivityStatus::Ignored, _) => counts.ignored += n,
                (ActivityStatus::Deferred, _) => counts.deferred += n,
                (ActivityStatus::Failed, _) => counts.failed += n,
            }
        }
        Ok(counts)
    }

    async fn prune_activity(&self, keep_days: u32) -> Result<u64, DatabaseError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(keep_days));
        let removed = self
            .conn()
            .execute(
                "DELETE FROM activity_log WHERE created_at < ?1",
                params![format_datetime(&cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_activity: {e}")))?;
        if removed > 0 {
            debug!(removed, keep_days, "Pruned activity log");
        }
        Ok(removed)
    }

    async fn latest_status(
        &self,
        message_id: &str,
    ) -> Result<Option<ActivityStatus>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status FROM activity_log WHERE message_id = ?1 \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(ActivityStatus::parse(&status)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_status: {e}"))),
        }
    }

    // ── Processed ledger ────────────────────────────────────────────

    async fn is_processed(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM processed_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_processed: {e}")))?;

        match rows.next().await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("is_processed: {e}"))),
        }
    }

    async fn mark_processed(&self, record: &ProcessedRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO processed_messages (message_id, action, label, processed_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.message_id.as_str(),
                    record.action.as_str(),
                    opt_text(record.label.as_deref()),
                    format_datetime(&record.processed_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_processed: {e}")))?;
        Ok(())
    }

    async fn processed_count(&self) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM processed_messages", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("processed_count: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0).max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("processed_count: {e}"))),
        }
    }

    async fn prune_processed(&self, keep_days: u32) -> Result<u64, DatabaseError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(keep_days));
        let removed = self
            .conn()
            .execute(
                "DELETE FROM processed_messages WHERE processed_at < ?1 AND action != 'ignore'",
                params![format_datetime(&cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_processed: {e}")))?;
        if removed > 0 {
            debug!(removed, keep_days, "Pruned processed ledger");
        }
        Ok(removed)
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok()),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now')) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;
        Ok(())
    }
}
