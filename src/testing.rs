//! In-memory doubles for the remote capabilities and the database.
//!
//! Each double records how often every operation was called so tests can
//! assert on side-effect counts (e.g. "replay made zero calendar mutations").

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal_macros::dec;
use secrecy::SecretString;
use tokio::sync::{Barrier, Mutex};

use crate::context::AppContext;
use crate::error::{DatabaseError, RemoteError};
use crate::google::calendar::{CalendarApi, CalendarEvent, CalendarSummary};
use crate::google::drive::{ItemKind, StorageApi, StorageItem};
use crate::google::gmail::{
    HistoryPage, HistoryRecord, MailboxApi, MailboxProfile, MessageAdded, MessageRef,
    WatchResponse,
};
use crate::pipeline::artifact::{BillPortal, BillStatement, PortalSession};
use crate::pipeline::ledger::IdempotencyLedger;
use crate::pipeline::message::MessageDetail;
use crate::pipeline::rules::Classifier;
use crate::pipeline::types::{Artifact, HistoryId, ProcessedMessageRecord, SyncCheckpoint};
use crate::store::Database;

fn not_found(service: &str, resource: &str) -> RemoteError {
    RemoteError::NotFound {
        service: service.to_string(),
        resource: resource.to_string(),
    }
}

fn status(service: &str, status: u16) -> RemoteError {
    RemoteError::Status {
        service: service.to_string(),
        status,
        body: "injected failure".to_string(),
    }
}

// ── Message fixtures ────────────────────────────────────────────────

/// A single-part text message.
pub fn text_message(id: &str, from: &str, subject: &str, body: &str) -> MessageDetail {
    let json = serde_json::json!({
        "id": id,
        "threadId": id,
        "labelIds": ["INBOX", "UNREAD"],
        "payload": {
            "mimeType": "text/plain",
            "headers": [
                {"name": "From", "value": from},
                {"name": "Subject", "value": subject}
            ],
            "body": {"data": URL_SAFE_NO_PAD.encode(body)}
        }
    });
    serde_json::from_value(json).unwrap_or_default()
}

/// A multipart message carrying one inline PDF attachment.
pub fn pdf_message(id: &str, from: &str, subject: &str, file_name: &str, pdf: &[u8]) -> MessageDetail {
    let json = serde_json::json!({
        "id": id,
        "threadId": id,
        "payload": {
            "mimeType": "multipart/mixed",
            "headers": [
                {"name": "From", "value": from},
                {"name": "Subject", "value": subject}
            ],
            "parts": [
                {"partId": "0", "mimeType": "text/plain", "body": {"data": URL_SAFE_NO_PAD.encode("see attached")}},
                {"partId": "1", "mimeType": "application/pdf", "filename": file_name, "body": {"data": URL_SAFE_NO_PAD.encode(pdf)}}
            ]
        }
    });
    serde_json::from_value(json).unwrap_or_default()
}

// ── Mailbox ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxCalls {
    pub list_history: usize,
    pub get_profile: usize,
    pub get_message: usize,
    pub get_attachment: usize,
    pub mark_read: usize,
    pub watch: usize,
}

impl MailboxCalls {
    pub fn total(&self) -> usize {
        self.list_history
            + self.get_profile
            + self.get_message
            + self.get_attachment
            + self.mark_read
            + self.watch
    }
}

#[derive(Default)]
struct MailboxState {
    head: HistoryId,
    records: Vec<(HistoryId, Vec<String>)>,
    messages: HashMap<String, MessageDetail>,
    attachments: HashMap<(String, String), Vec<u8>>,
    read: Vec<String>,
    expired_before: Option<HistoryId>,
    history_failure: Option<u16>,
    message_failures: HashMap<String, u16>,
    page_size: usize,
    history_gate: Option<Arc<Barrier>>,
    slow_fetches: HashSet<String>,
}

/// Mailbox with an append-only history log.
pub struct FakeMailbox {
    email: String,
    state: Mutex<MailboxState>,
    calls: StdMutex<MailboxCalls>,
}

impl FakeMailbox {
    pub fn new(email: &str, head: HistoryId) -> Self {
        Self {
            email: email.to_string(),
            state: Mutex::new(MailboxState {
                head,
                page_size: 100,
                ..Default::default()
            }),
            calls: StdMutex::new(MailboxCalls::default()),
        }
    }

    pub fn calls(&self) -> MailboxCalls {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn count(&self, f: impl FnOnce(&mut MailboxCalls)) {
        if let Ok(mut calls) = self.calls.lock() {
            f(&mut calls);
        }
    }

    pub async fn head(&self) -> HistoryId {
        self.state.lock().await.head
    }

    /// Append one history record listing `ids` as added. Returns its position.
    pub async fn push_history_batch(&self, ids: Vec<&str>) -> HistoryId {
        let mut state = self.state.lock().await;
        state.head = HistoryId(state.head.0 + 1);
        let position = state.head;
        state
            .records
            .push((position, ids.into_iter().map(String::from).collect()));
        position
    }

    /// Store a message and append it to the history log.
    pub async fn deliver(&self, message: MessageDetail) -> HistoryId {
        let id = message.id.clone();
        self.add_message(message).await;
        self.push_history_batch(vec![id.as_str()]).await
    }

    /// Store a message without touching the history log.
    pub async fn add_message(&self, message: MessageDetail) {
        let mut state = self.state.lock().await;
        state.messages.insert(message.id.clone(), message);
    }

    pub async fn remove_message(&self, id: &str) {
        self.state.lock().await.messages.remove(id);
    }

    pub async fn add_attachment(&self, message_id: &str, attachment_id: &str, content: &[u8]) {
        self.state.lock().await.attachments.insert(
            (message_id.to_string(), attachment_id.to_string()),
            content.to_vec(),
        );
    }

    /// History requests starting before `position` report not-found.
    pub async fn expire_history_before(&self, position: HistoryId) {
        self.state.lock().await.expired_before = Some(position);
    }

    pub async fn fail_history_with_status(&self, code: u16) {
        self.state.lock().await.history_failure = Some(code);
    }

    pub async fn fail_message_with_status(&self, message_id: &str, code: u16) {
        self.state
            .lock()
            .await
            .message_failures
            .insert(message_id.to_string(), code);
    }

    pub async fn clear_failures(&self) {
        let mut state = self.state.lock().await;
        state.history_failure = None;
        state.message_failures.clear();
    }

    /// Hold every history request until `parties` of them are waiting together.
    pub async fn gate_history_calls(&self, parties: usize) {
        self.state.lock().await.history_gate = Some(Arc::new(Barrier::new(parties)));
    }

    /// Make fetches of `message_id` yield to other tasks before answering.
    pub async fn slow_fetch(&self, message_id: &str) {
        self.state
            .lock()
            .await
            .slow_fetches
            .insert(message_id.to_string());
    }

    pub async fn set_page_size(&self, size: usize) {
        self.state.lock().await.page_size = size.max(1);
    }

    /// Ids marked read, in call order.
    pub async fn read_ids(&self) -> Vec<String> {
        self.state.lock().await.read.clone()
    }
}

#[async_trait]
impl MailboxApi for FakeMailbox {
    async fn list_history(
        &self,
        start: HistoryId,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, RemoteError> {
        self.count(|c| c.list_history += 1);
        let gate = self.state.lock().await.history_gate.clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        let state = self.state.lock().await;

        if let Some(code) = state.history_failure {
            return Err(status("gmail", code));
        }
        if state.expired_before.is_some_and(|floor| start < floor) {
            return Err(not_found("gmail", &format!("history since {start}")));
        }

        let pending: Vec<_> = state.records.iter().filter(|(id, _)| *id > start).collect();
        if pending.is_empty() {
            return Ok(HistoryPage {
                history: None,
                next_page_token: None,
                history_id: Some(state.head),
            });
        }

        let offset: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let end = (offset + state.page_size).min(pending.len());
        let history = pending[offset.min(end)..end]
            .iter()
            .map(|(id, ids)| HistoryRecord {
                id: Some(*id),
                messages_added: ids
                    .iter()
                    .map(|m| MessageAdded {
                        message: MessageRef {
                            id: m.clone(),
                            thread_id: m.clone(),
                        },
                    })
                    .collect(),
            })
            .collect();

        Ok(HistoryPage {
            history: Some(history),
            next_page_token: (end < pending.len()).then(|| end.to_string()),
            history_id: Some(state.head),
        })
    }

    async fn get_profile(&self) -> Result<MailboxProfile, RemoteError> {
        self.count(|c| c.get_profile += 1);
        Ok(MailboxProfile {
            email_address: self.email.clone(),
            history_id: self.state.lock().await.head,
        })
    }

    async fn get_message(&self, message_id: &str) -> Result<MessageDetail, RemoteError> {
        self.count(|c| c.get_message += 1);
        if self.state.lock().await.slow_fetches.contains(message_id) {
            tokio::task::yield_now().await;
        }
        let state = self.state.lock().await;
        if let Some(code) = state.message_failures.get(message_id) {
            return Err(status("gmail", *code));
        }
        state
            .messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| not_found("gmail", &format!("message {message_id}")))
    }

    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, RemoteError> {
        self.count(|c| c.get_attachment += 1);
        self.state
            .lock()
            .await
            .attachments
            .get(&(message_id.to_string(), attachment_id.to_string()))
            .cloned()
            .ok_or_else(|| not_found("gmail", &format!("attachment {attachment_id}")))
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), RemoteError> {
        self.count(|c| c.mark_read += 1);
        let mut state = self.state.lock().await;
        if !state.messages.contains_key(message_id) {
            return Err(not_found("gmail", &format!("message {message_id}")));
        }
        state.read.push(message_id.to_string());
        Ok(())
    }

    async fn watch(&self, _topic: &str) -> Result<WatchResponse, RemoteError> {
        self.count(|c| c.watch += 1);
        Ok(WatchResponse {
            history_id: self.state.lock().await.head,
            expiration: "1791331200000".to_string(),
        })
    }
}

// ── Calendar ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalendarCalls {
    pub list_calendars: usize,
    pub list_events: usize,
    pub delete_event: usize,
    pub patch_event: usize,
}

impl CalendarCalls {
    pub fn mutations(&self) -> usize {
        self.delete_event + self.patch_event
    }
}

/// One calendar (id `cal-1`) plus a few unrelated ones.
pub struct FakeCalendar {
    calendars: Vec<CalendarSummary>,
    events: Mutex<Vec<CalendarEvent>>,
    delete_failure: Mutex<Option<u16>>,
    calls: StdMutex<CalendarCalls>,
}

impl FakeCalendar {
    pub fn new(name: &str) -> Self {
        Self {
            calendars: vec![
                CalendarSummary {
                    id: "primary".into(),
                    summary: "me@example.com".into(),
                },
                CalendarSummary {
                    id: "cal-1".into(),
                    summary: name.into(),
                },
            ],
            events: Mutex::new(Vec::new()),
            delete_failure: Mutex::new(None),
            calls: StdMutex::new(CalendarCalls::default()),
        }
    }

    pub fn calls(&self) -> CalendarCalls {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn count(&self, f: impl FnOnce(&mut CalendarCalls)) {
        if let Ok(mut calls) = self.calls.lock() {
            f(&mut calls);
        }
    }

    pub async fn add_event(&self, event: CalendarEvent) {
        self.events.lock().await.push(event);
    }

    pub async fn event(&self, id: &str) -> Option<CalendarEvent> {
        self.events.lock().await.iter().find(|e| e.id == id).cloned()
    }

    pub async fn event_ids(&self) -> Vec<String> {
        self.events.lock().await.iter().map(|e| e.id.clone()).collect()
    }

    pub async fn fail_deletes_with_status(&self, code: u16) {
        *self.delete_failure.lock().await = Some(code);
    }
}

/// Start instant of an event; all-day dates count from midnight UTC.
fn event_start(event: &CalendarEvent) -> Option<DateTime<Utc>> {
    if let Some(dt) = &event.start.date_time {
        return DateTime::parse_from_rfc3339(dt)
            .ok()
            .map(|d| d.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(event.start.date.as_deref()?, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

#[async_trait]
impl CalendarApi for FakeCalendar {
    async fn list_calendars(&self) -> Result<Vec<CalendarSummary>, RemoteError> {
        self.count(|c| c.list_calendars += 1);
        Ok(self.calendars.clone())
    }

    async fn list_events(
        &self,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, RemoteError> {
        self.count(|c| c.list_events += 1);
        if calendar_id != "cal-1" {
            return Ok(Vec::new());
        }
        Ok(self
            .events
            .lock()
            .await
            .iter()
            .filter(|e| event_start(e).is_some_and(|s| s >= time_min && s <= time_max))
            .cloned()
            .collect())
    }

    async fn delete_event(&self, _calendar_id: &str, event_id: &str) -> Result<(), RemoteError> {
        self.count(|c| c.delete_event += 1);
        if let Some(code) = *self.delete_failure.lock().await {
            return Err(status("calendar", code));
        }
        let mut events = self.events.lock().await;
        let before = events.len();
        events.retain(|e| e.id != event_id);
        if events.len() == before {
            return Err(not_found("calendar", event_id));
        }
        Ok(())
    }

    async fn patch_event_summary(
        &self,
        _calendar_id: &str,
        event_id: &str,
        summary: &str,
    ) -> Result<(), RemoteError> {
        self.count(|c| c.patch_event += 1);
        let mut events = self.events.lock().await;
        let event = events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| not_found("calendar", event_id))?;
        event.summary = summary.to_string();
        Ok(())
    }
}

// ── Storage ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageCalls {
    pub find: usize,
    pub create_folder: usize,
    pub create_file: usize,
    pub update_file: usize,
}

impl StorageCalls {
    pub fn mutations(&self) -> usize {
        self.create_folder + self.create_file + self.update_file
    }
}

struct StoredItem {
    id: String,
    name: String,
    parent: String,
    folder: bool,
    content: Vec<u8>,
}

#[derive(Default)]
struct StorageState {
    items: Vec<StoredItem>,
    next_id: usize,
    fail_next_file_write: bool,
}

pub struct FakeStorage {
    root_id: String,
    state: Mutex<StorageState>,
    calls: StdMutex<StorageCalls>,
}

impl FakeStorage {
    pub fn new(root_id: &str) -> Self {
        Self {
            root_id: root_id.to_string(),
            state: Mutex::new(StorageState::default()),
            calls: StdMutex::new(StorageCalls::default()),
        }
    }

    pub fn calls(&self) -> StorageCalls {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn count(&self, f: impl FnOnce(&mut StorageCalls)) {
        if let Ok(mut calls) = self.calls.lock() {
            f(&mut calls);
        }
    }

    pub async fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .items
            .iter()
            .find(|i| i.id == id && !i.folder)
            .map(|i| i.content.clone())
    }

    /// Paths of every stored file, in creation order.
    pub async fn file_paths(&self) -> Vec<String> {
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state
                .items
                .iter()
                .filter(|i| !i.folder)
                .map(|i| i.id.clone())
                .collect()
        };
        let mut paths = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(path) = self.path_of(&id).await {
                paths.push(path);
            }
        }
        paths
    }

    /// '/'-joined folder names leading to item `id`.
    pub async fn path_of(&self, id: &str) -> Option<String> {
        let state = self.state.lock().await;
        let mut names = Vec::new();
        let mut current = state.items.iter().find(|i| i.id == id)?;
        loop {
            names.push(current.name.clone());
            if current.parent == self.root_id {
                break;
            }
            current = state.items.iter().find(|i| i.id == current.parent)?;
        }
        names.reverse();
        Some(names.join("/"))
    }

    /// Make the next `create_file` or `update_file_content` fail with 503.
    pub async fn fail_next_file_write(&self) {
        self.state.lock().await.fail_next_file_write = true;
    }

    fn take_failure(state: &mut StorageState) -> Result<(), RemoteError> {
        if std::mem::take(&mut state.fail_next_file_write) {
            return Err(status("drive", 503));
        }
        Ok(())
    }

    fn insert(
        state: &mut StorageState,
        name: &str,
        parent: &str,
        folder: bool,
        content: &[u8],
    ) -> StorageItem {
        state.next_id += 1;
        let id = format!("item-{}", state.next_id);
        state.items.push(StoredItem {
            id: id.clone(),
            name: name.to_string(),
            parent: parent.to_string(),
            folder,
            content: content.to_vec(),
        });
        StorageItem {
            id,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl StorageApi for FakeStorage {
    async fn find(
        &self,
        name: &str,
        parent_id: &str,
        kind: ItemKind,
    ) -> Result<Option<StorageItem>, RemoteError> {
        self.count(|c| c.find += 1);
        let want_folder = kind == ItemKind::Folder;
        Ok(self
            .state
            .lock()
            .await
            .items
            .iter()
            .find(|i| i.name == name && i.parent == parent_id && i.folder == want_folder)
            .map(|i| StorageItem {
                id: i.id.clone(),
                name: i.name.clone(),
            }))
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<StorageItem, RemoteError> {
        self.count(|c| c.create_folder += 1);
        let mut state = self.state.lock().await;
        Ok(Self::insert(&mut state, name, parent_id, true, &[]))
    }

    async fn create_file(
        &self,
        name: &str,
        parent_id: &str,
        _mime_type: &str,
        content: &[u8],
    ) -> Result<StorageItem, RemoteError> {
        self.count(|c| c.create_file += 1);
        let mut state = self.state.lock().await;
        Self::take_failure(&mut state)?;
        Ok(Self::insert(&mut state, name, parent_id, false, content))
    }

    async fn update_file_content(
        &self,
        file_id: &str,
        _mime_type: &str,
        content: &[u8],
    ) -> Result<StorageItem, RemoteError> {
        self.count(|c| c.update_file += 1);
        let mut state = self.state.lock().await;
        Self::take_failure(&mut state)?;
        let item = state
            .items
            .iter_mut()
            .find(|i| i.id == file_id && !i.folder)
            .ok_or_else(|| not_found("drive", file_id))?;
        item.content = content.to_vec();
        Ok(StorageItem {
            id: item.id.clone(),
            name: item.name.clone(),
        })
    }
}

// ── Bill portal ─────────────────────────────────────────────────────

pub struct FakeBillPortal {
    file_name: String,
    content: Vec<u8>,
    logins: AtomicUsize,
}

impl FakeBillPortal {
    pub fn new(file_name: &str, content: &[u8]) -> Self {
        Self {
            file_name: file_name.to_string(),
            content: content.to_vec(),
            logins: AtomicUsize::new(0),
        }
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BillPortal for FakeBillPortal {
    async fn login(&self) -> Result<PortalSession, RemoteError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        Ok(PortalSession {
            account_id: "acct-1".to_string(),
            token: SecretString::from("session-token"),
        })
    }

    async fn bill_history(
        &self,
        _session: &PortalSession,
    ) -> Result<Vec<BillStatement>, RemoteError> {
        Ok(vec![BillStatement {
            statement_date: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap_or_default(),
            amount: dec!(112.40),
            document_id: "doc-1".to_string(),
        }])
    }

    async fn current_bill(&self, _session: &PortalSession) -> Result<Artifact, RemoteError> {
        Ok(Artifact {
            content: self.content.clone(),
            file_name: self.file_name.clone(),
            mime_type: "application/pdf".to_string(),
        })
    }
}

// ── Database ────────────────────────────────────────────────────────

/// `Database` over in-memory maps, with a checkpoint write counter.
#[derive(Default)]
pub struct MemoryStore {
    checkpoints: Mutex<HashMap<String, SyncCheckpoint>>,
    processed: Mutex<HashMap<String, ProcessedMessageRecord>>,
    checkpoint_writes: AtomicUsize,
    failing_claims: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoint_writes(&self) -> usize {
        self.checkpoint_writes.load(Ordering::SeqCst)
    }

    /// Make claims for `message_id` fail with a query error.
    pub async fn fail_claims_for(&self, message_id: &str) {
        self.failing_claims
            .lock()
            .await
            .insert(message_id.to_string());
    }
}

#[async_trait]
impl Database for MemoryStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        mailbox_key: &str,
    ) -> Result<Option<SyncCheckpoint>, DatabaseError> {
        Ok(self.checkpoints.lock().await.get(mailbox_key).cloned())
    }

    async fn put_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<(), DatabaseError> {
        self.checkpoint_writes.fetch_add(1, Ordering::SeqCst);
        self.checkpoints
            .lock()
            .await
            .insert(checkpoint.mailbox_key.clone(), checkpoint.clone());
        Ok(())
    }

    async fn insert_processed_if_absent(
        &self,
        record: &ProcessedMessageRecord,
    ) -> Result<bool, DatabaseError> {
        if self.failing_claims.lock().await.contains(&record.message_id) {
            return Err(DatabaseError::Query(format!(
                "insert_processed_if_absent: injected failure for {}",
                record.message_id
            )));
        }
        let mut processed = self.processed.lock().await;
        if processed.contains_key(&record.message_id) {
            return Ok(false);
        }
        processed.insert(record.message_id.clone(), record.clone());
        Ok(true)
    }

    async fn get_processed(
        &self,
        message_id: &str,
    ) -> Result<Option<ProcessedMessageRecord>, DatabaseError> {
        Ok(self.processed.lock().await.get(message_id).cloned())
    }

    async fn commit_processed(&self, message_id: &str) -> Result<bool, DatabaseError> {
        match self.processed.lock().await.get_mut(message_id) {
            Some(record) => {
                record.committed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reclaim_processed(
        &self,
        record: &ProcessedMessageRecord,
        held_since: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut processed = self.processed.lock().await;
        match processed.get_mut(&record.message_id) {
            Some(held) if !held.committed && held.first_seen_at <= held_since => {
                *held = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_processed(&self, message_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.processed.lock().await.remove(message_id).is_some())
    }

    async fn purge_expired_processed(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let mut processed = self.processed.lock().await;
        let before = processed.len();
        processed.retain(|_, r| r.expires_at > now);
        Ok(before - processed.len())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

/// An `AppContext` wired to fresh doubles, with handles kept for assertions.
pub struct Harness {
    pub mailbox: Arc<FakeMailbox>,
    pub calendar: Arc<FakeCalendar>,
    pub storage: Arc<FakeStorage>,
    pub portal: Arc<FakeBillPortal>,
    pub db: Arc<MemoryStore>,
    pub ctx: AppContext,
}

impl Harness {
    pub const MAILBOX: &'static str = "me@example.com";
    pub const CALENDAR: &'static str = "Bills";

    pub fn new(head: HistoryId) -> Self {
        let mailbox = Arc::new(FakeMailbox::new(Self::MAILBOX, head));
        let calendar = Arc::new(FakeCalendar::new(Self::CALENDAR));
        let storage = Arc::new(FakeStorage::new("root"));
        let portal = Arc::new(FakeBillPortal::new("edison-current.pdf", b"%PDF portal"));
        let db = Arc::new(MemoryStore::new());

        let ctx = AppContext {
            db: db.clone(),
            mailbox: mailbox.clone(),
            calendar: calendar.clone(),
            storage: storage.clone(),
            portal: Some(portal.clone() as Arc<dyn BillPortal>),
            classifier: Arc::new(Classifier::default_rules()),
            ledger: Arc::new(IdempotencyLedger::new(
                db.clone(),
                Duration::from_secs(30 * 24 * 3600),
            )),
            calendar_name: Self::CALENDAR.to_string(),
            drive_root: "root".to_string(),
        };

        Self {
            mailbox,
            calendar,
            storage,
            portal,
            db,
            ctx,
        }
    }

    /// Calendar plus storage mutations.
    pub fn mutations(&self) -> usize {
        self.calendar.calls().mutations() + self.storage.calls().mutations()
    }

    /// Every remote call made so far, reads included.
    pub fn remote_calls(&self) -> usize {
        let calendar = self.calendar.calls();
        let storage = self.storage.calls();
        self.mailbox.calls().total()
            + calendar.list_calendars
            + calendar.list_events
            + calendar.mutations()
            + storage.find
            + storage.mutations()
            + self.portal.logins()
    }
}
