//! Mailbox capability — history log, message detail, attachments, labels, watch.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RemoteError;
use crate::google::http::{GoogleHttp, encode_path_segment};
use crate::pipeline::message::{MessageDetail, decode_base64url};
use crate::pipeline::types::HistoryId;

const SERVICE: &str = "gmail";

/// Page size for `users.history.list`.
const HISTORY_PAGE_SIZE: u32 = 500;

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageAdded {
    pub message: MessageRef,
}

/// One batch of the history log.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: Option<HistoryId>,
    #[serde(default)]
    pub messages_added: Vec<MessageAdded>,
}

/// One page of `users.history.list`. `history` is absent when nothing changed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub history: Option<Vec<HistoryRecord>>,
    pub next_page_token: Option<String>,
    pub history_id: Option<HistoryId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxProfile {
    pub email_address: String,
    pub history_id: HistoryId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResponse {
    pub history_id: HistoryId,
    /// Expiry as epoch milliseconds (sent as a string).
    pub expiration: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WatchRequest<'a> {
    topic_name: &'a str,
    label_ids: Vec<&'a str>,
    label_filter_behavior: &'a str,
}

#[derive(Debug, Deserialize)]
struct AttachmentBody {
    data: String,
}

// ── Capability trait ────────────────────────────────────────────────

/// Operations the pipeline needs from the mailbox service.
#[async_trait]
pub trait MailboxApi: Send + Sync {
    /// One page of history entries after `start`.
    async fn list_history(
        &self,
        start: HistoryId,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, RemoteError>;

    /// Mailbox address and current head position.
    async fn get_profile(&self) -> Result<MailboxProfile, RemoteError>;

    async fn get_message(&self, message_id: &str) -> Result<MessageDetail, RemoteError>;

    /// Raw bytes of a separately stored attachment.
    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, RemoteError>;

    /// Remove the UNREAD label.
    async fn mark_read(&self, message_id: &str) -> Result<(), RemoteError>;

    /// Register (or renew) push notifications for the inbox.
    async fn watch(&self, topic: &str) -> Result<WatchResponse, RemoteError>;
}

// ── HTTP adapter ────────────────────────────────────────────────────

/// Gmail v1 REST adapter.
pub struct GmailClient {
    http: GoogleHttp,
    base_url: String,
}

impl GmailClient {
    pub fn new(http: GoogleHttp, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{path}", self.base_url)
    }
}

#[async_trait]
impl MailboxApi for GmailClient {
    async fn list_history(
        &self,
        start: HistoryId,
        page_token: Option<&str>,
    ) -> Result<HistoryPage, RemoteError> {
        let mut query = vec![
            ("startHistoryId", start.to_string()),
            ("historyTypes", "messageAdded".to_string()),
            ("maxResults", HISTORY_PAGE_SIZE.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let request = self.http.request(Method::GET, &self.url("history")).query(&query);
        let page: HistoryPage = self
            .http
            .send_json(SERVICE, &format!("history since {start}"), request)
            .await?;

        debug!(
            start = %start,
            batches = page.history.as_ref().map(Vec::len).unwrap_or(0),
            more = page.next_page_token.is_some(),
            "Fetched history page"
        );
        Ok(page)
    }

    async fn get_profile(&self) -> Result<MailboxProfile, RemoteError> {
        let request = self.http.request(Method::GET, &self.url("profile"));
        self.http.send_json(SERVICE, "profile", request).await
    }

    async fn get_message(&self, message_id: &str) -> Result<MessageDetail, RemoteError> {
        let url = self.url(&format!("messages/{}", encode_path_segment(message_id)));
        let request = self
            .http
            .request(Method::GET, &url)
            .query(&[("format", "full")]);
        self.http
            .send_json(SERVICE, &format!("message {message_id}"), request)
            .await
    }

    async fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<Vec<u8>, RemoteError> {
        let url = self.url(&format!(
            "messages/{}/attachments/{}",
            encode_path_segment(message_id),
            encode_path_segment(attachment_id)
        ));
        let request = self.http.request(Method::GET, &url);
        let body: AttachmentBody = self
            .http
            .send_json(SERVICE, &format!("attachment of {message_id}"), request)
            .await?;

        decode_base64url(&body.data).map_err(|e| RemoteError::Decode {
            service: SERVICE.to_string(),
            reason: format!("attachment of {message_id}: {e}"),
        })
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), RemoteError> {
        let url = self.url(&format!("messages/{}/modify", encode_path_segment(message_id)));
        let request = self
            .http
            .request(Method::POST, &url)
            .json(&serde_json::json!({ "removeLabelIds": ["UNREAD"] }));
        self.http
            .send_empty(SERVICE, &format!("message {message_id}"), request)
            .await
    }

    async fn watch(&self, topic: &str) -> Result<WatchResponse, RemoteError> {
        let body = WatchRequest {
            topic_name: topic,
            label_ids: vec!["INBOX"],
            label_filter_behavior: "INCLUDE",
        };
        let request = self.http.request(Method::POST, &self.url("watch")).json(&body);
        self.http.send_json(SERVICE, "watch", request).await
    }
}
