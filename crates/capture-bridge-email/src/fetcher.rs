//! Message Fetcher & Metadata Extractor (spec §4.9).
//!
//! `extract_metadata` is a pure function over the provider's wire shape;
//! `fetch_message` is the thin IO wrapper that appends to `errors_log` on
//! failure without masking the original error.

use base64::Engine;
use capture_bridge_ledger::LedgerStore;
use capture_bridge_types::{CoreError, EmailMetadata, ErrorCode};
use chrono::{DateTime, TimeZone, Utc};

use crate::provider::{GmailProvider, ProviderError, RawMessage, RawMessagePart};

/// Decode Gmail's base64url body encoding. Accepts both padded and
/// unpadded input; a malformed payload decodes to an empty body rather
/// than failing the whole fetch (spec §4.9).
pub fn decode_base64url(data: &str) -> String {
    let mut normalized = data.replace('-', "+").replace('_', "/");
    let remainder = normalized.len() % 4;
    if remainder != 0 {
        normalized.push_str(&"=".repeat(4 - remainder));
    }
    base64::engine::general_purpose::STANDARD
        .decode(normalized.as_bytes())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default()
}

/// Walk a MIME tree depth-first for the first `text/plain` part. A
/// message with only `text/html` yields no body at all (spec §4.9).
fn find_body(part: &RawMessagePart) -> Option<String> {
    if part.mime_type == "text/plain" {
        if let Some(data) = &part.body.data {
            return Some(decode_base64url(data));
        }
    }
    for child in &part.parts {
        if let Some(found) = find_body(child) {
            return Some(found);
        }
    }
    None
}

fn header<'a>(part: &'a RawMessagePart, name: &str) -> Option<&'a str> {
    part.headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn strip_angle_brackets(s: &str) -> String {
    let trimmed = s.trim();
    if let Some(inner) = trimmed.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
        inner.to_string()
    } else {
        trimmed.to_string()
    }
}

fn parse_internal_date(raw: &Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
}

/// Extract the closed-shape [`EmailMetadata`] and plaintext body from a
/// raw provider message. Returns [`ErrorCode::StagingInvalidMetadata`]
/// when `Message-ID` or `From` are absent (spec §4.9).
pub fn extract_metadata(
    raw: &RawMessage,
    history_id: Option<&str>,
) -> Result<(EmailMetadata, String), CoreError> {
    let payload = raw.payload.as_ref();

    let message_id = payload
        .and_then(|p| header(p, "Message-ID"))
        .map(strip_angle_brackets)
        .ok_or_else(|| {
            CoreError::new(
                ErrorCode::StagingInvalidMetadata,
                "missing_message_id",
                false,
            )
        })?;

    let from = payload
        .and_then(|p| header(p, "From"))
        .map(str::to_string)
        .ok_or_else(|| {
            CoreError::new(ErrorCode::StagingInvalidMetadata, "missing_from", false)
        })?;

    let subject = payload
        .and_then(|p| header(p, "Subject"))
        .map(str::to_string)
        .unwrap_or_else(|| "(no subject)".to_string());

    let date = payload
        .and_then(|p| header(p, "Date"))
        .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
        .map(|d| d.with_timezone(&Utc))
        .or_else(|| parse_internal_date(&raw.internal_date))
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

    let body = payload.and_then(find_body).unwrap_or_default();

    let metadata = EmailMetadata {
        channel: "email".to_string(),
        channel_native_id: raw.id.clone(),
        message_id,
        from,
        subject,
        date,
        thread_id: None,
        labels: Vec::new(),
        snippet: None,
        internal_date: raw.internal_date.clone(),
        size_estimate: None,
        history_id: history_id.map(str::to_string),
    };

    Ok((metadata, body))
}

fn map_provider_err(err: &ProviderError) -> CoreError {
    CoreError::new(
        ErrorCode::ApiRateLimited,
        err.message.clone(),
        err.is_transient(),
    )
}

/// Fetch a single message, logging a non-fatal `errors_log` row on
/// failure before propagating the original error unchanged.
pub async fn fetch_message(
    provider: &dyn GmailProvider,
    ledger: &LedgerStore,
    message_id: &str,
) -> Result<RawMessage, CoreError> {
    match provider.get_message(message_id).await {
        Ok(raw) => Ok(raw),
        Err(err) => {
            ledger
                .log_error(
                    "gmail.fetchMessage",
                    err.status.map(i64::from),
                    &err.message,
                    Some(message_id),
                )
                .await;
            Err(map_provider_err(&err))
        }
    }
}
