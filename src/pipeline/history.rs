//! History synchronizer — flattens the mailbox change log after a position.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::RemoteError;
use crate::google::gmail::MailboxApi;
use crate::pipeline::types::HistoryId;

/// Result of one synchronization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Messages added after the start position, in arrival order.
    Changes {
        new_message_ids: Vec<String>,
        has_changes: bool,
    },
    /// The start position is no longer valid on the remote side.
    BaselineLost,
}

impl SyncOutcome {
    fn unchanged() -> Self {
        Self::Changes {
            new_message_ids: Vec::new(),
            has_changes: false,
        }
    }
}

pub struct HistorySynchronizer {
    mailbox: Arc<dyn MailboxApi>,
}

impl HistorySynchronizer {
    pub fn new(mailbox: Arc<dyn MailboxApi>) -> Self {
        Self { mailbox }
    }

    /// Pull every `messagesAdded` entry after `start`, following pages.
    ///
    /// A missing `history` section on the first page means nothing changed.
    /// A not-found reply for the start position is reported as
    /// `BaselineLost`; every other remote error propagates.
    pub async fn sync(&self, start: HistoryId) -> Result<SyncOutcome, RemoteError> {
        let mut new_message_ids = Vec::new();
        let mut seen = HashSet::new();
        let mut has_changes = false;
        let mut page_token: Option<String> = None;

        loop {
            let page = match self
                .mailbox
                .list_history(start, page_token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(e) if e.is_not_found() => {
                    warn!(start = %start, "History start position expired, baseline lost");
                    return Ok(SyncOutcome::BaselineLost);
                }
                Err(e) => return Err(e),
            };

            if let Some(batches) = page.history {
                has_changes = true;
                for batch in batches {
                    for added in batch.messages_added {
                        // The same id can appear in more than one batch.
                        if seen.insert(added.message.id.clone()) {
                            new_message_ids.push(added.message.id);
                        }
                    }
                }
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        if !has_changes {
            debug!(start = %start, "No history since start position");
            return Ok(SyncOutcome::unchanged());
        }

        debug!(start = %start, count = new_message_ids.len(), "Collected new messages");
        Ok(SyncOutcome::Changes {
            new_message_ids,
            has_changes,
        })
    }
}
