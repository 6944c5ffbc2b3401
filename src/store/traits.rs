//! Unified `Database` trait — single async interface for checkpoints and the ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::pipeline::types::{ProcessedMessageRecord, SyncCheckpoint};

/// Backend-agnostic database trait.
///
/// Every write is a single atomic statement: checkpoints are upserted, ledger
/// records are created only if absent.
#[async_trait]
pub trait Database: Send + Sync {
    /// Create or upgrade the schema.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Checkpoints ─────────────────────────────────────────────────

    /// Last processed history position for a mailbox.
    async fn get_checkpoint(&self, mailbox_key: &str)
    -> Result<Option<SyncCheckpoint>, DatabaseError>;

    /// Insert or overwrite the checkpoint for `checkpoint.mailbox_key`.
    async fn put_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<(), DatabaseError>;

    // ── Ledger ──────────────────────────────────────────────────────

    /// Create the record unless one exists for the same message id.
    /// Returns `true` if this call created it.
    async fn insert_processed_if_absent(
        &self,
        record: &ProcessedMessageRecord,
    ) -> Result<bool, DatabaseError>;

    /// Look up a ledger record.
    async fn get_processed(
        &self,
        message_id: &str,
    ) -> Result<Option<ProcessedMessageRecord>, DatabaseError>;

    /// Mark a ledger record committed. Returns `true` if the record exists.
    async fn commit_processed(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Replace an uncommitted record taken at or before `held_since` with
    /// `record`. Returns `true` if this call replaced it.
    async fn reclaim_processed(
        &self,
        record: &ProcessedMessageRecord,
        held_since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Remove a ledger record. Returns `true` if one was removed.
    async fn delete_processed(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Remove every record with `expires_at <= now`. Returns the count removed.
    async fn purge_expired_processed(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError>;
}
