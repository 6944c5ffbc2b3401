//! Notification handler — one push notification, one terminal outcome.
//!
//! decode → load checkpoint → staleness check → sync → per message
//! (claim, fetch, classify, dispatch, mark read) → advance checkpoint.
//!
//! The checkpoint only moves when every message in the batch was handled or
//! deliberately skipped. A failed message keeps the checkpoint where it was,
//! so the transport's redelivery retries the range; messages whose claim was
//! committed are skipped on that retry. A message whose claim another
//! invocation still holds uncommitted counts as failed, since that holder
//! may yet release it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::error::PipelineError;
use crate::google::gmail::MailboxApi;
use crate::pipeline::archive::ArchivalDispatcher;
use crate::pipeline::artifact::ArtifactExtractor;
use crate::pipeline::history::{HistorySynchronizer, SyncOutcome};
use crate::pipeline::ledger::{Claim, IdempotencyLedger};
use crate::pipeline::message::MessageDetail;
use crate::pipeline::notification::{PushEnvelope, decode_notification};
use crate::pipeline::reconcile::CalendarReconciler;
use crate::pipeline::rules::Classifier;
use crate::pipeline::types::{Artifact, Effect, HistoryId, MailboxNotification, SyncCheckpoint};
use crate::store::Database;

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Payload could not be decoded.
    Dropped,
    /// Position not newer than the checkpoint.
    Stale { checkpoint: HistoryId },
    /// Start position expired; checkpoint reset to the remote head.
    BaselineReset { position: HistoryId },
    /// Batch processed and checkpoint advanced.
    Processed(BatchReport),
}

/// Per-batch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub mailbox: String,
    pub position: HistoryId,
    pub seen: usize,
    pub duplicates: usize,
    pub missing: usize,
    pub unmatched: usize,
    pub applied: usize,
    pub not_applied: usize,
    pub failed: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Duplicate => self.duplicates += 1,
            MessageOutcome::Missing => self.missing += 1,
            MessageOutcome::Unmatched => self.unmatched += 1,
            MessageOutcome::Applied => self.applied += 1,
            MessageOutcome::NotApplied => self.not_applied += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    /// Another invocation already claimed it.
    Duplicate,
    /// Deleted remotely before we could read it.
    Missing,
    /// No rule matched.
    Unmatched,
    /// Side effect ran and the message was marked read.
    Applied,
    /// Rule matched but there was nothing to act on.
    NotApplied,
}

/// Work decided before any side effect runs.
enum Prepared {
    Missing,
    Unmatched,
    NotApplied,
    Ready {
        message: MessageDetail,
        effect: Effect,
        artifact: Option<Artifact>,
    },
}

pub struct NotificationHandler {
    db: Arc<dyn Database>,
    mailbox: Arc<dyn MailboxApi>,
    synchronizer: HistorySynchronizer,
    ledger: Arc<IdempotencyLedger>,
    classifier: Arc<Classifier>,
    reconciler: CalendarReconciler,
    archiver: ArchivalDispatcher,
    extractor: ArtifactExtractor,
    calendar_name: String,
    /// Serializes invocations for the same mailbox within this process.
    mailbox_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NotificationHandler {
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            db: Arc::clone(&ctx.db),
            mailbox: Arc::clone(&ctx.mailbox),
            synchronizer: HistorySynchronizer::new(Arc::clone(&ctx.mailbox)),
            ledger: Arc::clone(&ctx.ledger),
            classifier: Arc::clone(&ctx.classifier),
            reconciler: CalendarReconciler::new(Arc::clone(&ctx.calendar)),
            archiver: ArchivalDispatcher::new(Arc::clone(&ctx.storage), ctx.drive_root.clone()),
            extractor: ArtifactExtractor::new(Arc::clone(&ctx.mailbox), ctx.portal.clone()),
            calendar_name: ctx.calendar_name.clone(),
            mailbox_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle a raw push request body.
    pub async fn handle_push(&self, body: &[u8]) -> Result<HandleOutcome, PipelineError> {
        let envelope: PushEnvelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping push request with malformed envelope: {e}");
                return Ok(HandleOutcome::Dropped);
            }
        };
        debug!(push_id = %envelope.message.message_id, "Received push notification");
        self.handle_encoded(envelope.message.data.as_deref().unwrap_or_default())
            .await
    }

    /// Handle the base64 `data` field of a push message.
    pub async fn handle_encoded(&self, data: &str) -> Result<HandleOutcome, PipelineError> {
        match decode_notification(data) {
            Ok(notification) => self.handle(&notification).await,
            Err(e) => {
                warn!("Dropping notification: {e}");
                Ok(HandleOutcome::Dropped)
            }
        }
    }

    /// Run one decoded notification to a terminal outcome.
    pub async fn handle(
        &self,
        notification: &MailboxNotification,
    ) -> Result<HandleOutcome, PipelineError> {
        let mailbox_key = notification.email_address.as_str();
        let target = notification.history_id;

        let lock = self.lock_for(mailbox_key);
        let _guard = lock.lock().await;

        let start = match self.db.get_checkpoint(mailbox_key).await? {
            Some(checkpoint) if target <= checkpoint.position => {
                debug!(
                    mailbox = mailbox_key,
                    position = %target,
                    checkpoint = %checkpoint.position,
                    "Stale notification"
                );
                return Ok(HandleOutcome::Stale {
                    checkpoint: checkpoint.position,
                });
            }
            Some(checkpoint) => checkpoint.position,
            None => {
                info!(
                    mailbox = mailbox_key,
                    position = %target,
                    "No checkpoint yet, bootstrapping"
                );
                target
            }
        };

        let message_ids = match self.synchronizer.sync(start).await? {
            SyncOutcome::BaselineLost => {
                let profile = self.mailbox.get_profile().await?;
                self.db
                    .put_checkpoint(&SyncCheckpoint::new(mailbox_key, profile.history_id))
                    .await?;
                warn!(
                    mailbox = mailbox_key,
                    from = %start,
                    to = %profile.history_id,
                    "Checkpoint reset to mailbox head; messages in the gap are skipped"
                );
                return Ok(HandleOutcome::BaselineReset {
                    position: profile.history_id,
                });
            }
            SyncOutcome::Changes {
                new_message_ids, ..
            } => new_message_ids,
        };

        let mut report = BatchReport {
            mailbox: mailbox_key.to_string(),
            position: target,
            seen: message_ids.len(),
            ..Default::default()
        };

        for message_id in &message_ids {
            match self.process_message(message_id).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!(
                        mailbox = mailbox_key,
                        message_id = %message_id,
                        "Message failed: {e}"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.failed > 0 {
            warn!(mailbox = mailbox_key, ?report, "Batch incomplete, checkpoint unchanged");
            return Err(PipelineError::Incomplete {
                mailbox: mailbox_key.to_string(),
                failed: report.failed,
            });
        }

        self.advance_checkpoint(mailbox_key, target).await?;
        info!(
            mailbox = mailbox_key,
            position = %target,
            seen = report.seen,
            applied = report.applied,
            duplicates = report.duplicates,
            "Batch processed"
        );
        Ok(HandleOutcome::Processed(report))
    }

    fn lock_for(&self, mailbox_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .mailbox_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(mailbox_key.to_string()).or_default())
    }

    /// Write `target` unless the stored checkpoint is already at or past it.
    async fn advance_checkpoint(
        &self,
        mailbox_key: &str,
        target: HistoryId,
    ) -> Result<(), PipelineError> {
        if let Some(current) = self.db.get_checkpoint(mailbox_key).await? {
            if current.position >= target {
                debug!(
                    mailbox = mailbox_key,
                    checkpoint = %current.position,
                    "Checkpoint already ahead"
                );
                return Ok(());
            }
        }
        self.db
            .put_checkpoint(&SyncCheckpoint::new(mailbox_key, target))
            .await?;
        Ok(())
    }

    async fn process_message(&self, message_id: &str) -> Result<MessageOutcome, PipelineError> {
        match self.ledger.claim(message_id).await? {
            Claim::Acquired => {}
            Claim::Duplicate => return Ok(MessageOutcome::Duplicate),
            // The holder may still release it, so this batch is not done.
            Claim::InFlight => return Err(PipelineError::ClaimInFlight(message_id.to_string())),
        }

        // Nothing is mutated before the commit, so a failure up to it gives the claim back.
        let prepared = match self.prepare(message_id).await {
            Ok(prepared) => self
                .ledger
                .commit(message_id)
                .await
                .map(|()| prepared)
                .map_err(PipelineError::from),
            Err(e) => Err(e),
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Err(release_err) = self.ledger.release(message_id).await {
                    error!(message_id, "Failed to release claim: {release_err}");
                }
                return Err(e);
            }
        };

        match prepared {
            Prepared::Missing => Ok(MessageOutcome::Missing),
            Prepared::Unmatched => Ok(MessageOutcome::Unmatched),
            Prepared::NotApplied => Ok(MessageOutcome::NotApplied),
            Prepared::Ready {
                message,
                effect,
                artifact,
            } => self.dispatch(&message, &effect, artifact).await,
        }
    }

    async fn prepare(&self, message_id: &str) -> Result<Prepared, PipelineError> {
        let message = match self.mailbox.get_message(message_id).await {
            Ok(message) => message,
            Err(e) if e.is_not_found() => {
                warn!(message_id, "Message no longer exists, skipping");
                return Ok(Prepared::Missing);
            }
            Err(e) => return Err(e.into()),
        };

        let body = message.body_text();
        let Some(effect) = self
            .classifier
            .classify(message.sender(), message.subject(), &body)
        else {
            debug!(message_id, subject = message.subject(), "No rule matched");
            return Ok(Prepared::Unmatched);
        };

        let artifact = match &effect {
            Effect::ArchiveArtifact { source, .. } => {
                match self.extractor.extract(source, &message).await {
                    Ok(artifact) => Some(artifact),
                    Err(PipelineError::Artifact(reason)) => {
                        warn!(message_id, "No artifact to archive: {reason}");
                        return Ok(Prepared::NotApplied);
                    }
                    Err(PipelineError::Remote(e)) if e.is_not_found() => {
                        warn!(message_id, "Attachment no longer exists, skipping");
                        return Ok(Prepared::Missing);
                    }
                    Err(e) => return Err(e),
                }
            }
            Effect::DeleteEvents { .. } | Effect::PatchEvents { .. } => None,
        };

        Ok(Prepared::Ready {
            message,
            effect,
            artifact,
        })
    }

    /// Run the side effect. The claim is kept whatever happens here.
    async fn dispatch(
        &self,
        message: &MessageDetail,
        effect: &Effect,
        artifact: Option<Artifact>,
    ) -> Result<MessageOutcome, PipelineError> {
        let applied = match (effect, artifact) {
            (Effect::ArchiveArtifact { folder_path, .. }, Some(artifact)) => {
                self.archiver.archive(&artifact, folder_path).await?;
                true
            }
            (Effect::ArchiveArtifact { .. }, None) => false,
            (Effect::DeleteEvents { .. } | Effect::PatchEvents { .. }, _) => self
                .reconciler
                .apply(effect, &self.calendar_name)
                .await?
                .applied(),
        };

        if !applied {
            info!(
                message_id = %message.id,
                effect = effect.label(),
                "Matched but nothing applied"
            );
            return Ok(MessageOutcome::NotApplied);
        }

        if let Err(e) = self.mailbox.mark_read(&message.id).await {
            warn!(message_id = %message.id, "Side effect applied but mark-read failed: {e}");
        }
        info!(message_id = %message.id, effect = effect.label(), "Applied effect");
        Ok(MessageOutcome::Applied)
    }
}
