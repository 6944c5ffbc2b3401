//! Push notification decoding.
//!
//! The transport POSTs an envelope whose `message.data` is base64 of a JSON
//! object carrying at least `emailAddress` and `historyId`.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::Deserialize;

use crate::error::PipelineError;
use crate::pipeline::types::MailboxNotification;

/// Push request body.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub publish_time: Option<String>,
}

/// Decode the base64 `data` field into a notification.
pub fn decode_notification(data: &str) -> Result<MailboxNotification, PipelineError> {
    let data = data.trim();
    if data.is_empty() {
        return Err(PipelineError::Decode("empty payload".into()));
    }

    let bytes = STANDARD
        .decode(data)
        .or_else(|_| URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')))
        .map_err(|e| PipelineError::Decode(format!("base64: {e}")))?;

    let notification: MailboxNotification = serde_json::from_slice(&bytes)
        .map_err(|e| PipelineError::Decode(format!("json: {e}")))?;

    if notification.email_address.trim().is_empty() {
        return Err(PipelineError::Decode("empty emailAddress".into()));
    }
    Ok(notification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::HistoryId;

    fn encode(json: &str) -> String {
        STANDARD.encode(json)
    }

    #[test]
    fn decodes_numeric_history_id() {
        let n = decode_notification(&encode(r#"{"emailAddress":"me@example.com","historyId":9876}"#))
            .unwrap();
        assert_eq!(n.email_address, "me@example.com");
        assert_eq!(n.history_id, HistoryId(9876));
    }

    #[test]
    fn accepts_url_safe_alphabet() {
        let data = URL_SAFE_NO_PAD.encode(r#"{"emailAddress":"me@example.com","historyId":"77"}"#);
        assert_eq!(decode_notification(&data).unwrap().history_id, HistoryId(77));
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(decode_notification("").is_err());
        assert!(decode_notification("!!not base64!!").is_err());
        assert!(decode_notification(&encode("not json")).is_err());
        assert!(decode_notification(&encode(r#"{"emailAddress":"me@example.com"}"#)).is_err());
        assert!(decode_notification(&encode(r#"{"emailAddress":"","historyId":1}"#)).is_err());
    }

    #[test]
    fn envelope_parses() {
        let env: PushEnvelope = serde_json::from_str(
            r#"{"message":{"data":"e30=","messageId":"123","publishTime":"2026-10-17T00:00:00Z"},"subscription":"projects/p/subscriptions/s"}"#,
        )
        .unwrap();
        assert_eq!(env.message.data.as_deref(), Some("e30="));
        assert_eq!(env.message.message_id, "123");
    }
}
