//! Idempotency ledger — at-most-once claims on remote message ids.
//!
//! A claim is a create-if-absent write of an uncommitted record. The holder
//! either commits it (the message's fate is decided and no other invocation
//! may act on it) or releases it (nothing happened, the message is free
//! again). Finding a record is only a duplicate once it is committed; an
//! uncommitted record means another invocation is mid-flight and the caller
//! must not treat the message as done. Storage failures propagate and are
//! never read as "duplicate".

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{CLAIM_LEASE_MINUTES, TRANSPORT_RETENTION_DAYS};
use crate::error::DatabaseError;
use crate::pipeline::types::ProcessedMessageRecord;
use crate::store::Database;

/// Result of trying to claim a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This caller holds the claim.
    Acquired,
    /// A committed record exists; the message was already handled.
    Duplicate,
    /// Another invocation holds an uncommitted claim that may still be released.
    InFlight,
}

pub struct IdempotencyLedger {
    db: Arc<dyn Database>,
    retention: chrono::Duration,
    lease: chrono::Duration,
}

impl IdempotencyLedger {
    /// `retention` is raised to the transport's redelivery window when shorter.
    pub fn new(db: Arc<dyn Database>, retention: Duration) -> Self {
        let floor = chrono::Duration::days(i64::from(TRANSPORT_RETENTION_DAYS));
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or(floor)
            .max(floor);
        Self {
            db,
            retention,
            lease: chrono::Duration::minutes(CLAIM_LEASE_MINUTES),
        }
    }

    /// How long an uncommitted claim is honoured before another caller may take it over.
    pub fn with_lease(mut self, lease: chrono::Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn retention(&self) -> chrono::Duration {
        self.retention
    }

    pub async fn claim(&self, message_id: &str) -> Result<Claim, DatabaseError> {
        let now = Utc::now();
        let record = ProcessedMessageRecord {
            message_id: message_id.to_string(),
            first_seen_at: now,
            expires_at: now + self.retention,
            committed: false,
        };
        if self.db.insert_processed_if_absent(&record).await? {
            return Ok(Claim::Acquired);
        }

        let Some(held) = self.db.get_processed(message_id).await? else {
            // Released between our insert and read; the next delivery retries.
            debug!(message_id, "Claim released concurrently");
            return Ok(Claim::InFlight);
        };
        if held.committed {
            debug!(message_id, "Message already claimed");
            return Ok(Claim::Duplicate);
        }

        let held_since = now - self.lease;
        if held.first_seen_at > held_since {
            debug!(message_id, since = %held.first_seen_at, "Message claim in flight");
            return Ok(Claim::InFlight);
        }
        if self.db.reclaim_processed(&record, held_since).await? {
            warn!(message_id, since = %held.first_seen_at, "Took over abandoned claim");
            return Ok(Claim::Acquired);
        }
        Ok(Claim::InFlight)
    }

    /// Fix the message's fate. After this, other callers see `Claim::Duplicate`.
    pub async fn commit(&self, message_id: &str) -> Result<(), DatabaseError> {
        if !self.db.commit_processed(message_id).await? {
            warn!(message_id, "Committed a claim that no longer exists");
        }
        Ok(())
    }

    /// Drop a claim whose processing failed before any side effect ran.
    pub async fn release(&self, message_id: &str) -> Result<(), DatabaseError> {
        if self.db.delete_processed(message_id).await? {
            debug!(message_id, "Released claim");
        }
        Ok(())
    }

    /// Delete expired records. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize, DatabaseError> {
        self.db.purge_expired_processed(Utc::now()).await
    }
}

/// Spawn the periodic purge of expired ledger records.
///
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_ledger_purge(
    ledger: Arc<IdempotencyLedger>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Ledger purge started, every {}s", interval.as_secs());
        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Ledger purge shutting down");
                return;
            }

            match ledger.purge_expired().await {
                Ok(0) => {}
                Ok(n) => info!(removed = n, "Purged expired ledger records"),
                Err(e) => error!("Ledger purge failed: {e}"),
            }
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn ledger() -> (Arc<dyn Database>, IdempotencyLedger) {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend.init_schema().await.unwrap();
        let db: Arc<dyn Database> = Arc::new(backend);
        let ledger = IdempotencyLedger::new(Arc::clone(&db), Duration::from_secs(8 * 86_400));
        (db, ledger)
    }

    #[tokio::test]
    async fn first_claim_wins() {
        let (_db, ledger) = ledger().await;
        assert_eq!(ledger.claim("m1").await.unwrap(), Claim::Acquired);
        assert_eq!(ledger.claim("m1").await.unwrap(), Claim::InFlight);
        ledger.commit("m1").await.unwrap();
        assert_eq!(ledger.claim("m1").await.unwrap(), Claim::Duplicate);
        assert_eq!(ledger.claim("m1").await.unwrap(), Claim::Duplicate);
        assert_eq!(ledger.claim("m2").await.unwrap(), Claim::Acquired);
    }

    #[tokio::test]
    async fn record_outlives_transport_retention() {
        let (db, ledger) = ledger().await;
        ledger.claim("m1").await.unwrap();
        let record = db.get_processed("m1").await.unwrap().unwrap();
        assert!(record.expires_at - record.first_seen_at >= chrono::Duration::days(7));
        assert!(!record.committed);
    }

    #[tokio::test]
    async fn short_retention_is_raised_to_floor() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let ledger = IdempotencyLedger::new(Arc::new(backend), Duration::from_secs(60));
        assert_eq!(ledger.retention(), chrono::Duration::days(i64::from(TRANSPORT_RETENTION_DAYS)));
    }

    #[tokio::test]
    async fn released_claim_can_be_taken_again() {
        let (_db, ledger) = ledger().await;
        assert_eq!(ledger.claim("m1").await.unwrap(), Claim::Acquired);
        ledger.release("m1").await.unwrap();
        assert_eq!(ledger.claim("m1").await.unwrap(), Claim::Acquired);
        // Releasing an unknown id is a no-op.
        ledger.release("never-claimed").await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_claim_is_taken_over_after_lease() {
        let (db, ledger) = ledger().await;
        let ledger = ledger.with_lease(chrono::Duration::zero());
        let mut stale = ProcessedMessageRecord {
            message_id: "m1".into(),
            first_seen_at: Utc::now() - chrono::Duration::hours(1),
            expires_at: Utc::now() + chrono::Duration::days(8),
            committed: false,
        };
        db.insert_processed_if_absent(&stale).await.unwrap();
        assert_eq!(ledger.claim("m1").await.unwrap(), Claim::Acquired);

        // Committed records are never taken over.
        stale.message_id = "m2".into();
        stale.committed = true;
        db.insert_processed_if_absent(&stale).await.unwrap();
        assert_eq!(ledger.claim("m2").await.unwrap(), Claim::Duplicate);
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let (_db, ledger) = ledger().await;
        let ledger = Arc::new(ledger);

        let attempts = (0..16).map(|_| {
            let ledger = Arc::clone(&ledger);
            async move { ledger.claim("same-id").await.unwrap() }
        });
        let results = futures::future::join_all(attempts).await;

        assert_eq!(results.iter().filter(|c| **c == Claim::Acquired).count(), 1);
        assert_eq!(results.iter().filter(|c| **c == Claim::InFlight).count(), 15);
    }

    #[tokio::test]
    async fn purge_keeps_live_records() {
        let (_db, ledger) = ledger().await;
        ledger.claim("m1").await.unwrap();
        ledger.commit("m1").await.unwrap();
        assert_eq!(ledger.purge_expired().await.unwrap(), 0);
        assert_eq!(ledger.claim("m1").await.unwrap(), Claim::Duplicate);
    }
}
