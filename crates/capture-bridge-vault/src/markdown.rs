//! Renders the exported note: YAML frontmatter, a human header, the
//! body, and a metadata footer (spec §6). The format is fixed by tests;
//! any change here is a breaking change to the vault contract.

use capture_bridge_types::CaptureSource;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Render a fully-delivered capture note.
pub fn format_note(
    id: &str,
    source: CaptureSource,
    captured_at: DateTime<Utc>,
    content_hash: &str,
    body: &str,
    meta: &Value,
) -> String {
    let captured_at = captured_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    format!(
        "---\nid: {id}\nsource: {source}\ncaptured_at: {captured_at}\ncontent_hash: {content_hash}\n---\n\n# Capture {id}\n\n{body}\n\n---\nmetadata: {meta}\n",
    )
}

/// Render a placeholder note for a capture whose transcription failed
/// (spec §9 Open Questions: treated as an opaque, byte-exact string).
pub fn format_placeholder_note(
    id: &str,
    captured_at: DateTime<Utc>,
    reason: &str,
) -> String {
    let captured_at = captured_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    format!(
        "---\nid: {id}\nsource: voice\ncaptured_at: {captured_at}\nstatus: failed_transcription\n---\n\n# Capture {id} (transcription unavailable)\n\n_This voice memo could not be transcribed: {reason}._\n",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn note_is_byte_exact() {
        let captured_at = DateTime::parse_from_rfc3339("2025-10-09T12:00:00.000Z")
            .unwrap()
            .with_timezone(&Utc);
        let meta = json!({"channel": "email"});
        let rendered = format_note(
            "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            CaptureSource::Email,
            captured_at,
            "deadbeef",
            "hello world",
            &meta,
        );
        assert_eq!(
            rendered,
            "---\nid: 01ARZ3NDEKTSV4RRFFQ69G5FAV\nsource: email\ncaptured_at: 2025-10-09T12:00:00.000Z\ncontent_hash: deadbeef\n---\n\n# Capture 01ARZ3NDEKTSV4RRFFQ69G5FAV\n\nhello world\n\n---\nmetadata: {\"channel\":\"email\"}\n"
        );
    }

    #[test]
    fn placeholder_note_is_byte_exact() {
        let captured_at = DateTime::parse_from_rfc3339("2025-10-09T12:00:00.000Z")
            .unwrap()
            .with_timezone(&Utc);
        let rendered = format_placeholder_note("01ARZ3NDEKTSV4RRFFQ69G5FAV", captured_at, "asr timeout");
        assert_eq!(
            rendered,
            "---\nid: 01ARZ3NDEKTSV4RRFFQ69G5FAV\nsource: voice\ncaptured_at: 2025-10-09T12:00:00.000Z\nstatus: failed_transcription\n---\n\n# Capture 01ARZ3NDEKTSV4RRFFQ69G5FAV (transcription unavailable)\n\n_This voice memo could not be transcribed: asr timeout._\n"
        );
    }
}
