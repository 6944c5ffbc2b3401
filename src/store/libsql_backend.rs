//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::types::{HistoryId, ProcessedMessageRecord, SyncCheckpoint};
use crate::store::migrations;
use crate::store::traits::Database;

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
        if let Some(parent) = path.parent() {
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
        backend.init_schema().await?;
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
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so string order is time order.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp '{s}': {e}")))
}

fn row_to_checkpoint(row: &libsql::Row) -> Result<SyncCheckpoint, DatabaseError> {
    let mailbox_key: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let history_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let updated_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;

    let position: HistoryId = history_str.parse().map_err(|e| {
        DatabaseError::Serialization(format!("bad history id '{history_str}': {e}"))
    })?;

    Ok(SyncCheckpoint {
        mailbox_key,
        position,
        updated_at: parse_datetime(&updated_str)?,
    })
}

fn row_to_record(row: &libsql::Row) -> Result<ProcessedMessageRecord, DatabaseError> {
    let message_id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let first_seen: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let expires: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
    let committed: i64 = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;

    Ok(ProcessedMessageRecord {
        message_id,
        first_seen_at: parse_datetime(&first_seen)?,
        expires_at: parse_datetime(&expires)?,
        committed: committed != 0,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Checkpoints ─────────────────────────────────────────────────

    async fn get_checkpoint(
        &self,
        mailbox_key: &str,
    ) -> Result<Option<SyncCheckpoint>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT mailbox_key, history_id, updated_at FROM sync_checkpoints WHERE mailbox_key = ?1",
                params![mailbox_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_checkpoint: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_checkpoint(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_checkpoint: {e}"))),
        }
    }

    async fn put_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO sync_checkpoints (mailbox_key, history_id, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (mailbox_key) DO UPDATE SET history_id = ?2, updated_at = ?3",
                params![
                    checkpoint.mailbox_key.as_str(),
                    checkpoint.position.to_string(),
                    format_datetime(checkpoint.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_checkpoint: {e}")))?;

        debug!(
            mailbox = %checkpoint.mailbox_key,
            history_id = %checkpoint.position,
            "Checkpoint stored"
        );
        Ok(())
    }

    // ── Ledger ──────────────────────────────────────────────────────

    async fn insert_processed_if_absent(
        &self,
        record: &ProcessedMessageRecord,
    ) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO processed_messages (message_id, first_seen_at, expires_at, committed)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (message_id) DO NOTHING",
                params![
                    record.message_id.as_str(),
                    format_datetime(record.first_seen_at),
                    format_datetime(record.expires_at),
                    i64::from(record.committed),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_processed_if_absent: {e}")))?;

        Ok(inserted == 1)
    }

    async fn get_processed(
        &self,
        message_id: &str,
    ) -> Result<Option<ProcessedMessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, first_seen_at, expires_at, committed FROM processed_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_processed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_processed: {e}"))),
        }
    }

    async fn commit_processed(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE processed_messages SET committed = 1 WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_processed: {e}")))?;
        Ok(count > 0)
    }

    async fn reclaim_processed(
        &self,
        record: &ProcessedMessageRecord,
        held_since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE processed_messages SET first_seen_at = ?2, expires_at = ?3, committed = ?4
                 WHERE message_id = ?1 AND committed = 0 AND first_seen_at <= ?5",
                params![
                    record.message_id.as_str(),
                    format_datetime(record.first_seen_at),
                    format_datetime(record.expires_at),
                    i64::from(record.committed),
                    format_datetime(held_since),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reclaim_processed: {e}")))?;
        Ok(count == 1)
    }

    async fn delete_processed(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM processed_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_processed: {e}")))?;
        Ok(count > 0)
    }

    async fn purge_expired_processed(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM processed_messages WHERE expires_at <= ?1",
                params![format_datetime(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_expired_processed: {e}")))?;

        if count > 0 {
            info!(count, "Purged expired ledger records");
        }
        Ok(count as usize)
    }
}
