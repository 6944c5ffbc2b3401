//! Artifact extraction — message attachment or bill-portal download.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use secrecy::SecretString;
use tracing::{debug, info};

use crate::error::{PipelineError, RemoteError};
use crate::google::gmail::MailboxApi;
use crate::pipeline::message::{MessageDetail, decode_base64url};
use crate::pipeline::statement::{read_anchors, statement_file_name};
use crate::pipeline::types::{Artifact, ArtifactSource};

// ── Bill portal ─────────────────────────────────────────────────────

/// Tokens gathered by a completed portal login.
pub struct PortalSession {
    pub account_id: String,
    pub token: SecretString,
}

/// One entry of the portal's statement history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillStatement {
    pub statement_date: NaiveDate,
    pub amount: Decimal,
    pub document_id: String,
}

/// A utility's web portal. Logging in is a fixed multi-step handshake
/// owned by the implementation.
#[async_trait]
pub trait BillPortal: Send + Sync {
    async fn login(&self) -> Result<PortalSession, RemoteError>;

    async fn bill_history(&self, session: &PortalSession)
    -> Result<Vec<BillStatement>, RemoteError>;

    /// Most recent statement as a downloadable document.
    async fn current_bill(&self, session: &PortalSession) -> Result<Artifact, RemoteError>;
}

// ── Extraction ──────────────────────────────────────────────────────

pub struct ArtifactExtractor {
    mailbox: Arc<dyn MailboxApi>,
    portal: Option<Arc<dyn BillPortal>>,
}

impl ArtifactExtractor {
    pub fn new(mailbox: Arc<dyn MailboxApi>, portal: Option<Arc<dyn BillPortal>>) -> Self {
        Self { mailbox, portal }
    }

    /// Produce the artifact `source` names for `message`.
    ///
    /// A PDF whose text carries a statement date is renamed after that date.
    /// `PipelineError::Artifact` means the artifact cannot exist (no such
    /// attachment, no portal configured); remote failures are returned as
    /// `PipelineError::Remote`.
    pub async fn extract(
        &self,
        source: &ArtifactSource,
        message: &MessageDetail,
    ) -> Result<Artifact, PipelineError> {
        let mut artifact = match source {
            ArtifactSource::Attachment { mime_type } => {
                self.from_attachment(message, mime_type).await?
            }
            ArtifactSource::BillPortal => self.from_portal().await?,
        };

        if artifact.mime_type == "application/pdf" {
            if let Some(anchors) = read_anchors(&artifact.content).await {
                info!(
                    message_id = %message.id,
                    file = %artifact.file_name,
                    statement_date = ?anchors.statement_date,
                    amount_due = ?anchors.amount_due,
                    "Read statement anchors"
                );
                if let Some(date) = anchors.statement_date {
                    artifact.file_name = statement_file_name(date);
                }
            }
        }
        Ok(artifact)
    }

    async fn from_attachment(
        &self,
        message: &MessageDetail,
        mime_type: &str,
    ) -> Result<Artifact, PipelineError> {
        let part = message.find_attachment(mime_type).ok_or_else(|| {
            PipelineError::Artifact(format!(
                "message {} has no {mime_type} attachment",
                message.id
            ))
        })?;

        let content = match (&part.body.data, &part.body.attachment_id) {
            (Some(data), _) => decode_base64url(data).map_err(|e| {
                PipelineError::Artifact(format!("attachment {}: {e}", part.filename))
            })?,
            (None, Some(attachment_id)) => {
                self.mailbox
                    .get_attachment(&message.id, attachment_id)
                    .await?
            }
            (None, None) => {
                return Err(PipelineError::Artifact(format!(
                    "attachment {} has no content",
                    part.filename
                )));
            }
        };

        debug!(
            message_id = %message.id,
            file = %part.filename,
            bytes = content.len(),
            "Extracted attachment"
        );
        Ok(Artifact {
            content,
            file_name: part.filename.clone(),
            mime_type: part.mime_type.clone(),
        })
    }

    async fn from_portal(&self) -> Result<Artifact, PipelineError> {
        let portal = self
            .portal
            .as_ref()
            .ok_or_else(|| PipelineError::Artifact("no bill portal configured".into()))?;

        let session = portal.login().await?;
        let latest = portal
            .bill_history(&session)
            .await?
            .into_iter()
            .max_by_key(|statement| statement.statement_date);

        let mut artifact = portal.current_bill(&session).await?;
        // The current bill is the latest statement; name it by that date.
        if let Some(latest) = latest {
            debug!(
                account = %session.account_id,
                statement_date = %latest.statement_date,
                amount = %latest.amount,
                "Latest portal statement"
            );
            artifact.file_name = statement_file_name(latest.statement_date);
        }
        debug!(file = %artifact.file_name, "Downloaded current bill");
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use crate::pipeline::statement::fixture::statement_pdf;
    use crate::pipeline::types::HistoryId;
    use crate::testing::{FakeBillPortal, FakeMailbox};

    fn message_with_parts(parts: serde_json::Value) -> MessageDetail {
        serde_json::from_value(serde_json::json!({
            "id": "m1",
            "payload": {"mimeType": "multipart/mixed", "parts": parts}
        }))
        .unwrap()
    }

    fn pdf_source() -> ArtifactSource {
        ArtifactSource::Attachment {
            mime_type: "application/pdf".into(),
        }
    }

    #[tokio::test]
    async fn inline_attachment_is_decoded() {
        let mailbox = Arc::new(FakeMailbox::new("me@example.com", HistoryId(1)));
        let extractor = ArtifactExtractor::new(mailbox.clone(), None);
        let data = base64::engine::general_purpose::URL_SAFE.encode(b"%PDF-1.4");
        let msg = message_with_parts(serde_json::json!([
            {"mimeType": "application/pdf", "filename": "bill.pdf", "body": {"data": data}}
        ]));

        let artifact = extractor.extract(&pdf_source(), &msg).await.unwrap();
        assert_eq!(artifact.content, b"%PDF-1.4");
        assert_eq!(artifact.file_name, "bill.pdf");
        assert_eq!(mailbox.calls().get_attachment, 0);
    }

    #[tokio::test]
    async fn separate_attachment_is_fetched() {
        let mailbox = Arc::new(FakeMailbox::new("me@example.com", HistoryId(1)));
        mailbox.add_attachment("m1", "att-9", b"remote pdf").await;
        let extractor = ArtifactExtractor::new(mailbox.clone(), None);
        let msg = message_with_parts(serde_json::json!([
            {"mimeType": "application/pdf", "filename": "bill.pdf", "body": {"attachmentId": "att-9"}}
        ]));

        let artifact = extractor.extract(&pdf_source(), &msg).await.unwrap();
        assert_eq!(artifact.content, b"remote pdf");
        assert_eq!(mailbox.calls().get_attachment, 1);
    }

    #[tokio::test]
    async fn missing_attachment_is_artifact_error() {
        let mailbox = Arc::new(FakeMailbox::new("me@example.com", HistoryId(1)));
        let extractor = ArtifactExtractor::new(mailbox, None);
        let msg = message_with_parts(serde_json::json!([]));

        let err = extractor.extract(&pdf_source(), &msg).await.unwrap_err();
        assert!(matches!(err, PipelineError::Artifact(_)));
    }

    #[tokio::test]
    async fn portal_bill_is_downloaded() {
        let mailbox = Arc::new(FakeMailbox::new("me@example.com", HistoryId(1)));
        let portal = Arc::new(FakeBillPortal::new("2026-10.pdf", b"portal pdf"));
        let extractor = ArtifactExtractor::new(mailbox, Some(portal.clone()));
        let msg = message_with_parts(serde_json::json!([]));

        let artifact = extractor
            .extract(&ArtifactSource::BillPortal, &msg)
            .await
            .unwrap();
        // Named after the latest statement in the portal's history.
        assert_eq!(artifact.file_name, "2026-10-01.pdf");
        assert_eq!(artifact.content, b"portal pdf");
        assert_eq!(portal.logins(), 1);
    }

    #[tokio::test]
    async fn pdf_statement_date_names_the_file() {
        let mailbox = Arc::new(FakeMailbox::new("me@example.com", HistoryId(1)));
        let extractor = ArtifactExtractor::new(mailbox, None);
        let pdf = statement_pdf(&["SF Water", "Statement Date: 08/28/2026", "Amount Due: $64.02"]);
        let data = base64::engine::general_purpose::URL_SAFE.encode(&pdf);
        let msg = message_with_parts(serde_json::json!([
            {"mimeType": "application/pdf", "filename": "eBill.pdf", "body": {"data": data}}
        ]));

        let artifact = extractor.extract(&pdf_source(), &msg).await.unwrap();
        assert_eq!(artifact.file_name, "2026-08-28.pdf");
        assert_eq!(artifact.content, pdf);
    }

    #[tokio::test]
    async fn portal_source_without_portal() {
        let mailbox = Arc::new(FakeMailbox::new("me@example.com", HistoryId(1)));
        let extractor = ArtifactExtractor::new(mailbox, None);
        let msg = message_with_parts(serde_json::json!([]));

        let err = extractor
            .extract(&ArtifactSource::BillPortal, &msg)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Artifact(_)));
    }
}
