//! Message detail as returned by the mailbox API, plus the MIME tree walk.
//!
//! The payload is an immutable tree of parts. Lookups are depth-first and
//! return the first match in document order.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use serde::Deserialize;

/// URL-safe base64 that accepts both padded and unpadded input.
const BASE64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode the mailbox API's base64url body encoding.
pub fn decode_base64url(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64URL.decode(data.trim())
}

#[derive(Debug, Clone, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Inline body data, or a pointer to a separately fetched attachment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartBody {
    #[serde(default)]
    pub size: u64,
    pub data: Option<String>,
    pub attachment_id: Option<String>,
}

/// One node of the MIME tree.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub part_id: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: PartBody,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl MessagePart {
    /// First part, in depth-first order, satisfying `pred`. Includes `self`.
    pub fn find_part<P>(&self, pred: P) -> Option<&MessagePart>
    where
        P: Fn(&MessagePart) -> bool,
    {
        let mut stack = vec![self];
        while let Some(part) = stack.pop() {
            if pred(part) {
                return Some(part);
            }
            // Reverse so the first child is visited first.
            stack.extend(part.parts.iter().rev());
        }
        None
    }

    /// Case-insensitive header lookup on this part.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    fn mime_is(&self, mime_type: &str) -> bool {
        self.mime_type.eq_ignore_ascii_case(mime_type)
    }

    /// Decoded inline text, if this part carries any.
    fn inline_text(&self) -> Option<String> {
        let data = self.body.data.as_deref()?;
        let bytes = decode_base64url(data).ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Full message as returned by the message-detail API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDetail {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub label_ids: Vec<String>,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub payload: MessagePart,
}

impl MessageDetail {
    pub fn sender(&self) -> &str {
        self.payload.header("From").unwrap_or_default()
    }

    pub fn subject(&self) -> &str {
        self.payload.header("Subject").unwrap_or_default()
    }

    pub fn date(&self) -> Option<&str> {
        self.payload.header("Date")
    }

    /// Body text for classification: first `text/plain` part, then first
    /// `text/html` part, then the snippet.
    pub fn body_text(&self) -> String {
        ["text/plain", "text/html"]
            .iter()
            .find_map(|mime| {
                self.payload
                    .find_part(|p| p.mime_is(mime) && p.body.data.is_some())
                    .and_then(MessagePart::inline_text)
            })
            .unwrap_or_else(|| self.snippet.clone())
    }

    /// First named attachment with the given MIME type.
    pub fn find_attachment(&self, mime_type: &str) -> Option<&MessagePart> {
        self.payload.find_part(|p| {
            !p.filename.is_empty()
                && p.mime_is(mime_type)
                && (p.body.data.is_some() || p.body.attachment_id.is_some())
        })
    }
}

/// Domain part of a `From` header value, lowercased.
///
/// Handles `Name <user@host>` and bare `user@host`.
pub fn sender_domain(from: &str) -> String {
    let address = match (from.rfind('<'), from.rfind('>')) {
        (Some(open), Some(close)) if open < close => &from[open + 1..close],
        _ => from,
    };
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .unwrap_or(address)
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(text: &str) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(text)
    }

    fn sample() -> MessageDetail {
        let json = serde_json::json!({
            "id": "m1",
            "threadId": "t1",
            "labelIds": ["INBOX", "UNREAD"],
            "snippet": "snippet text",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    {"name": "From", "value": "Capital One <capitalone@notification.capitalone.com>"},
                    {"name": "subject", "value": "Withdrawal notice"},
                    {"name": "Date", "value": "Mon, 5 Oct 2026 09:00:00 -0700"}
                ],
                "parts": [
                    {
                        "partId": "0",
                        "mimeType": "multipart/alternative",
                        "parts": [
                            {"partId": "0.0", "mimeType": "text/plain", "body": {"size": 5, "data": encode("ATT has initiated a payment")}},
                            {"partId": "0.1", "mimeType": "text/html", "body": {"size": 5, "data": encode("<p>html</p>")}}
                        ]
                    },
                    {"partId": "1", "mimeType": "application/pdf", "filename": "statement.pdf", "body": {"size": 100, "attachmentId": "att-1"}},
                    {"partId": "2", "mimeType": "application/pdf", "filename": "second.pdf", "body": {"size": 100, "attachmentId": "att-2"}}
                ]
            }
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn headers_are_case_insensitive() {
        let msg = sample();
        assert_eq!(msg.subject(), "Withdrawal notice");
        assert!(msg.sender().contains("capitalone.com"));
        assert!(msg.date().is_some());
    }

    #[test]
    fn body_prefers_nested_plain_text() {
        assert_eq!(sample().body_text(), "ATT has initiated a payment");
    }

    #[test]
    fn body_falls_back_to_snippet() {
        let msg: MessageDetail = serde_json::from_value(serde_json::json!({
            "id": "m2",
            "snippet": "only a snippet",
            "payload": {"mimeType": "multipart/mixed", "parts": []}
        }))
        .unwrap();
        assert_eq!(msg.body_text(), "only a snippet");
    }

    #[test]
    fn single_part_message_body() {
        let msg: MessageDetail = serde_json::from_value(serde_json::json!({
            "id": "m3",
            "payload": {"mimeType": "text/plain", "body": {"data": encode("flat body")}}
        }))
        .unwrap();
        assert_eq!(msg.body_text(), "flat body");
    }

    #[test]
    fn first_attachment_in_document_order() {
        let msg = sample();
        let part = msg.find_attachment("application/pdf").unwrap();
        assert_eq!(part.filename, "statement.pdf");
        assert_eq!(part.body.attachment_id.as_deref(), Some("att-1"));
        assert!(msg.find_attachment("image/png").is_none());
    }

    #[test]
    fn decodes_padded_and_unpadded() {
        assert_eq!(decode_base64url("aGk").unwrap(), b"hi");
        assert_eq!(decode_base64url("aGk=").unwrap(), b"hi");
        assert_eq!(decode_base64url("-_8").unwrap(), vec![0xfb, 0xff]);
    }

    #[test]
    fn sender_domain_forms() {
        assert_eq!(
            sender_domain("Capital One <capitalone@notification.CapitalOne.com>"),
            "notification.capitalone.com"
        );
        assert_eq!(sender_domain("alerts@chase.com"), "chase.com");
        assert_eq!(sender_domain("no address here"), "no address here");
    }
}
