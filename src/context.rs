//! Application context — every shared dependency, built once at start.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::Error;
use crate::google::calendar::{CalendarApi, GoogleCalendarClient};
use crate::google::drive::{DriveClient, StorageApi};
use crate::google::gmail::{GmailClient, MailboxApi};
use crate::google::http::GoogleHttp;
use crate::pipeline::artifact::BillPortal;
use crate::pipeline::ledger::IdempotencyLedger;
use crate::pipeline::rules::Classifier;
use crate::store::Database;

/// Handles passed to every component. Cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    pub db: Arc<dyn Database>,
    pub mailbox: Arc<dyn MailboxApi>,
    pub calendar: Arc<dyn CalendarApi>,
    pub storage: Arc<dyn StorageApi>,
    pub portal: Option<Arc<dyn BillPortal>>,
    pub classifier: Arc<Classifier>,
    pub ledger: Arc<IdempotencyLedger>,
    /// Calendar holding the bill reminders.
    pub calendar_name: String,
    /// Storage folder id archive paths are resolved from.
    pub drive_root: String,
}

impl AppContext {
    /// Wire the HTTP adapters from configuration.
    pub fn from_config(config: &AppConfig, db: Arc<dyn Database>) -> Result<Self, Error> {
        let http = GoogleHttp::new(config.access_token.clone());
        let classifier = match &config.rules_path {
            Some(path) => Classifier::load(path)?,
            None => Classifier::default_rules(),
        };

        Ok(Self {
            ledger: Arc::new(IdempotencyLedger::new(
                Arc::clone(&db),
                config.ledger_retention,
            )),
            db,
            mailbox: Arc::new(GmailClient::new(http.clone(), &config.endpoints.gmail)),
            calendar: Arc::new(GoogleCalendarClient::new(
                http.clone(),
                &config.endpoints.calendar,
            )),
            storage: Arc::new(DriveClient::new(
                http,
                &config.endpoints.drive,
                &config.endpoints.drive_upload,
            )),
            portal: None,
            classifier: Arc::new(classifier),
            calendar_name: config.calendar_name.clone(),
            drive_root: config.drive_root.clone(),
        })
    }

    pub fn with_portal(mut self, portal: Arc<dyn BillPortal>) -> Self {
        self.portal = Some(portal);
        self
    }
}
