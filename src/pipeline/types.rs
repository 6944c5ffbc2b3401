//! Shared types for the notification pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── History position ────────────────────────────────────────────────

/// Position in a mailbox's append-only change log.
///
/// The remote API hands it out as a decimal string in responses and as a
/// JSON number in push notifications; both forms deserialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HistoryId(pub u64);

impl fmt::Display for HistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HistoryId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl Serialize for HistoryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for HistoryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

// ── Inbound notification ────────────────────────────────────────────

/// Decoded mailbox change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxNotification {
    /// Mailbox the change belongs to. Also the checkpoint key.
    pub email_address: String,
    /// Mailbox history position after the change.
    pub history_id: HistoryId,
}

// ── Persistence records ─────────────────────────────────────────────

/// Last fully processed history position of one mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCheckpoint {
    pub mailbox_key: String,
    pub position: HistoryId,
    pub updated_at: DateTime<Utc>,
}

impl SyncCheckpoint {
    pub fn new(mailbox_key: impl Into<String>, position: HistoryId) -> Self {
        Self {
            mailbox_key: mailbox_key.into(),
            position,
            updated_at: Utc::now(),
        }
    }
}

/// Ledger entry marking a remote message as handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedMessageRecord {
    pub message_id: String,
    /// When the current holder took the claim.
    pub first_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set once the holder has decided the message's fate. An uncommitted
    /// record may still be released.
    pub committed: bool,
}

// ── Effects ─────────────────────────────────────────────────────────

/// Where an archived artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ArtifactSource {
    /// First attachment of the message with this MIME type.
    Attachment {
        #[serde(default = "default_attachment_mime")]
        mime_type: String,
    },
    /// Current statement downloaded from the bill portal.
    BillPortal,
}

fn default_attachment_mime() -> String {
    "application/pdf".to_string()
}

/// Side effect a classified message triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Effect {
    /// Delete every reminder whose title starts with `title_prefix`.
    DeleteEvents { title_prefix: String, month_offset: u32 },
    /// Rename every reminder whose title starts with `title_prefix`.
    PatchEvents {
        title_prefix: String,
        month_offset: u32,
        new_title: String,
    },
    /// Upload an artifact into a '/'-delimited folder path.
    ArchiveArtifact {
        source: ArtifactSource,
        folder_path: String,
    },
}

impl Effect {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::DeleteEvents { .. } => "delete_events",
            Self::PatchEvents { .. } => "patch_events",
            Self::ArchiveArtifact { .. } => "archive_artifact",
        }
    }
}

/// Binary produced by an extraction step and consumed once by the archiver.
#[derive(Clone, PartialEq, Eq)]
pub struct Artifact {
    pub content: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.content.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_id_from_number_and_string() {
        let n: HistoryId = serde_json::from_str("12345").unwrap();
        let s: HistoryId = serde_json::from_str("\"12345\"").unwrap();
        assert_eq!(n, s);
        assert_eq!(serde_json::to_string(&n).unwrap(), "\"12345\"");
    }

    #[test]
    fn history_id_rejects_garbage() {
        assert!(serde_json::from_str::<HistoryId>("\"abc\"").is_err());
        assert!(serde_json::from_str::<HistoryId>("-4").is_err());
    }

    #[test]
    fn history_ids_order_numerically() {
        assert!(HistoryId(99) < HistoryId(100));
        assert!("99".parse::<HistoryId>().unwrap() < "100".parse::<HistoryId>().unwrap());
    }

    #[test]
    fn notification_uses_camel_case() {
        let n: MailboxNotification =
            serde_json::from_str(r#"{"emailAddress":"me@example.com","historyId":42}"#).unwrap();
        assert_eq!(n.email_address, "me@example.com");
        assert_eq!(n.history_id, HistoryId(42));
    }

    #[test]
    fn effect_tagged_json() {
        let effect: Effect = serde_json::from_str(
            r#"{"kind":"archive_artifact","source":{"from":"attachment"},"folder_path":"Bills/Water"}"#,
        )
        .unwrap();
        assert_eq!(
            effect,
            Effect::ArchiveArtifact {
                source: ArtifactSource::Attachment {
                    mime_type: "application/pdf".into()
                },
                folder_path: "Bills/Water".into(),
            }
        );
        assert_eq!(effect.label(), "archive_artifact");
    }
}
