//! Mailbox watch renewal.
//!
//! Push registrations expire after about a week, so the watch is renewed on
//! start and then on a timer. The first registration also seeds the
//! checkpoint so the first notification has a position to sync from.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::PipelineError;
use crate::google::gmail::{MailboxApi, WatchResponse};
use crate::pipeline::types::SyncCheckpoint;
use crate::store::Database;

/// Register the watch once. Seeds the checkpoint if the mailbox has none.
pub async fn renew_watch(
    mailbox: &dyn MailboxApi,
    db: &dyn Database,
    topic: &str,
) -> Result<WatchResponse, PipelineError> {
    let profile = mailbox.get_profile().await?;
    let response = mailbox.watch(topic).await?;

    if db.get_checkpoint(&profile.email_address).await?.is_none() {
        db.put_checkpoint(&SyncCheckpoint::new(
            &profile.email_address,
            response.history_id,
        ))
        .await?;
        info!(
            mailbox = %profile.email_address,
            position = %response.history_id,
            "Seeded checkpoint from watch registration"
        );
    }

    debug!(
        mailbox = %profile.email_address,
        expiration = %response.expiration,
        "Watch registered"
    );
    Ok(response)
}

/// Spawn the watch renewal loop. The first tick fires immediately.
///
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_watch_renewal(
    mailbox: Arc<dyn MailboxApi>,
    db: Arc<dyn Database>,
    topic: String,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(topic = %topic, "Watch renewal started, every {}s", interval.as_secs());
        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Watch renewal shutting down");
                return;
            }

            if let Err(e) = renew_watch(mailbox.as_ref(), db.as_ref(), &topic).await {
                error!("Watch renewal failed: {e}");
            }
        }
    });

    (handle, shutdown_flag)
}
