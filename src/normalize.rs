//! Conversion of provider messages into stored message records.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};

use crate::error::{PipelineError, Result};
use crate::gmail::{GmailMessage, MessagePart};
use crate::models::NewMessage;
use crate::validation::InputValidator;

/// Byte cap for the `To` header
pub const MAX_RECIPIENT_BYTES: usize = 512;
/// Byte cap for the subject (RFC 5322 line limit)
pub const MAX_SUBJECT_BYTES: usize = 998;
/// Byte cap for the plain-text body
pub const MAX_BODY_BYTES: usize = 65_535;
/// Byte cap for the snippet
pub const MAX_SNIPPET_BYTES: usize = 512;

/// Build the stored form of a fetched message.
///
/// `now` is the timestamp of last resort when neither the internal date nor the
/// `Date` header can be parsed.
pub fn normalize(message: &GmailMessage, user_id: &str, now: DateTime<Utc>) -> Result<NewMessage> {
    if message.id.is_empty() {
        return Err(PipelineError::InvalidInput("message has no provider id".to_string()));
    }

    let payload = message.payload.as_ref();
    let body = InputValidator::sanitize_text(&payload.map(extract_plain_text).unwrap_or_default());
    let snippet = InputValidator::sanitize_text(&message.snippet);
    let recipient = InputValidator::sanitize_text(message.header("To"));
    let subject = InputValidator::sanitize_text(message.header("Subject"));

    Ok(NewMessage {
        user_id: user_id.to_string(),
        provider_message_id: message.id.clone(),
        thread_id: message.thread_id.clone(),
        history_id: message.history_id.clone().unwrap_or_default(),
        sender: InputValidator::sanitize_text(message.header("From")),
        recipient: InputValidator::truncate_utf8(&recipient, MAX_RECIPIENT_BYTES).to_string(),
        subject: InputValidator::truncate_utf8(&subject, MAX_SUBJECT_BYTES).to_string(),
        body: InputValidator::truncate_utf8(&body, MAX_BODY_BYTES).to_string(),
        snippet: InputValidator::truncate_utf8(&snippet, MAX_SNIPPET_BYTES).to_string(),
        timestamp: message_timestamp(message, now),
        labels: message.label_ids.clone(),
        has_attachments: payload.is_some_and(has_attachments),
        size_estimate: i64::try_from(message.size_estimate).unwrap_or(i64::MAX),
    })
}

/// Depth-first search for the first `text/plain` part with decodable data
#[must_use]
pub fn extract_plain_text(part: &MessagePart) -> String {
    if part.mime_type.eq_ignore_ascii_case("text/plain") {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
            let text = decode_base64url(data);
            if !text.is_empty() {
                return text;
            }
        }
    }

    for child in &part.parts {
        let text = extract_plain_text(child);
        if !text.is_empty() {
            return text;
        }
    }

    String::new()
}

/// Decode Gmail body data, accepting padded and standard-alphabet input.
/// Undecodable data yields `""`.
#[must_use]
pub fn decode_base64url(data: &str) -> String {
    let cleaned: String = data
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();

    URL_SAFE_NO_PAD
        .decode(cleaned.as_bytes())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// True when any part below the root carries a filename or an attachment disposition
#[must_use]
pub fn has_attachments(root: &MessagePart) -> bool {
    root.parts.iter().any(|part| {
        let named = !part.filename.is_empty();
        let disposed = part
            .header("Content-Disposition")
            .is_some_and(|value| value.to_ascii_lowercase().contains("attachment"));
        named || disposed || has_attachments(part)
    })
}

fn message_timestamp(message: &GmailMessage, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(ms) = message
        .internal_date
        .as_deref()
        .and_then(|raw| raw.trim().parse::<i64>().ok())
    {
        if let Some(ts) = DateTime::from_timestamp_millis(ms) {
            return ts;
        }
    }

    let header = message.header("Date");
    if !header.is_empty() {
        if let Ok(parsed) = DateTime::parse_from_rfc2822(header) {
            return parsed.with_timezone(&Utc);
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(header) {
            return parsed.with_timezone(&Utc);
        }
    }

    now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::{Header, PartBody};
    use chrono::TimeZone;

    fn header(name: &str, value: &str) -> Header {
        Header {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    fn text_part(mime: &str, text: &str) -> MessagePart {
        MessagePart {
            mime_type: mime.to_string(),
            body: Some(PartBody {
                data: Some(URL_SAFE_NO_PAD.encode(text)),
                size: text.len() as u64,
            }),
            ..MessagePart::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_nested_multipart_finds_plain_text() {
        let root = MessagePart {
            mime_type: "multipart/mixed".to_string(),
            parts: vec![
                MessagePart {
                    mime_type: "multipart/alternative".to_string(),
                    parts: vec![
                        text_part("text/html", "<p>Receipt</p>"),
                        text_part("text/plain", "Receipt total $12.00"),
                    ],
                    ..MessagePart::default()
                },
                MessagePart {
                    mime_type: "application/pdf".to_string(),
                    filename: "receipt.pdf".to_string(),
                    ..MessagePart::default()
                },
            ],
            ..MessagePart::default()
        };

        assert_eq!(extract_plain_text(&root), "Receipt total $12.00");
        assert!(has_attachments(&root));
    }

    #[test]
    fn test_html_only_yields_empty_body() {
        let root = MessagePart {
            mime_type: "multipart/alternative".to_string(),
            parts: vec![text_part("text/html", "<b>hi</b>")],
            ..MessagePart::default()
        };
        assert_eq!(extract_plain_text(&root), "");
        assert!(!has_attachments(&root));
    }

    #[test]
    fn test_decode_tolerates_padding_and_alphabet() {
        assert_eq!(decode_base64url("SGVsbG8="), "Hello");
        assert_eq!(decode_base64url("SGVsbG8"), "Hello");
        assert_eq!(decode_base64url("P3M_"), decode_base64url("P3M/"));
        assert_eq!(decode_base64url("!!!"), "");
    }

    #[test]
    fn test_disposition_header_marks_attachment() {
        let root = MessagePart {
            mime_type: "multipart/mixed".to_string(),
            parts: vec![MessagePart {
                headers: vec![header("Content-Disposition", "ATTACHMENT; name=x")],
                ..MessagePart::default()
            }],
            ..MessagePart::default()
        };
        assert!(has_attachments(&root));
    }

    #[test]
    fn test_timestamp_preference() {
        let mut message = GmailMessage {
            id: "m1".to_string(),
            internal_date: Some("1700000000000".to_string()),
            payload: Some(MessagePart {
                headers: vec![header("Date", "Tue, 1 Jul 2003 10:52:37 +0200")],
                ..MessagePart::default()
            }),
            ..GmailMessage::default()
        };
        let stored = normalize(&message, "u1", now()).unwrap();
        assert_eq!(stored.timestamp.timestamp(), 1_700_000_000);

        message.internal_date = Some("not-a-number".to_string());
        let stored = normalize(&message, "u1", now()).unwrap();
        assert_eq!(stored.timestamp, Utc.with_ymd_and_hms(2003, 7, 1, 8, 52, 37).unwrap());

        message.payload = None;
        let stored = normalize(&message, "u1", now()).unwrap();
        assert_eq!(stored.timestamp, now());
    }

    #[test]
    fn test_field_caps() {
        let long_subject = "é".repeat(600);
        let message = GmailMessage {
            id: "m1".to_string(),
            snippet: "s".repeat(700),
            payload: Some(MessagePart {
                mime_type: "text/plain".to_string(),
                headers: vec![
                    header("Subject", &long_subject),
                    header("To", &"x".repeat(600)),
                    header("From", "Shop <orders@shop.example>"),
                ],
                body: Some(PartBody {
                    data: Some(URL_SAFE_NO_PAD.encode("b".repeat(70_000))),
                    size: 70_000,
                }),
                ..MessagePart::default()
            }),
            ..GmailMessage::default()
        };

        let stored = normalize(&message, "u1", now()).unwrap();
        assert_eq!(stored.subject.len(), 998);
        assert_eq!(stored.recipient.len(), MAX_RECIPIENT_BYTES);
        assert_eq!(stored.body.len(), MAX_BODY_BYTES);
        assert_eq!(stored.snippet.len(), MAX_SNIPPET_BYTES);
        assert_eq!(stored.sender, "Shop <orders@shop.example>");
        assert_eq!(stored.history_id, "");
    }

    #[test]
    fn test_body_controls_are_stripped() {
        let message = GmailMessage {
            id: "m1".to_string(),
            snippet: "code\u{7}483920".to_string(),
            payload: Some(text_part("text/plain", "\u{0}Total:\u{1b} $12.00\r\n\tThanks\n")),
            ..GmailMessage::default()
        };

        let record = normalize(&message, "u1", now()).unwrap();
        assert_eq!(record.body, "Total: $12.00\r\n\tThanks");
        assert_eq!(record.snippet, "code483920");
    }

    #[test]
    fn test_missing_id_is_rejected() {
        assert!(normalize(&GmailMessage::default(), "u1", now()).is_err());
    }
}
