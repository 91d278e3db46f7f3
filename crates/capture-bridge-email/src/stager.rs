//! Email Stager (spec §4.10): turns an extracted message into a staged
//! `captures` row inside the caller's transaction.

use capture_bridge_hashing::UlidGenerator;
use capture_bridge_ledger::LedgerStore;
use capture_bridge_types::{Capture, CaptureSource, CaptureStatus, CoreError, EmailMetadata, MetricsSink};
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};

/// Outcome of a single stage operation.
#[derive(Debug, Clone)]
pub struct StagedCapture {
    pub capture_id: String,
    pub status: CaptureStatus,
    pub created_at: DateTime<Utc>,
}

fn build_capture(
    id: String,
    metadata: &EmailMetadata,
    body: &str,
    now: DateTime<Utc>,
) -> Result<Capture, CoreError> {
    let meta_json = serde_json::to_value(metadata).map_err(|e| {
        CoreError::new(
            capture_bridge_types::ErrorCode::StagingInvalidMetadata,
            format!("email metadata is not serializable: {e}"),
            false,
        )
    })?;
    Ok(Capture {
        id,
        source: CaptureSource::Email,
        raw_content: Some(body.to_string()),
        content_hash: None,
        status: CaptureStatus::Staged,
        meta_json,
        created_at: now,
        updated_at: now,
    })
}

/// Stage one message within an open transaction. Generates a fresh id
/// via `generator`, inserts the row, and emits `capture_email_staging_ms`
/// — a metrics failure never fails the stage.
pub async fn stage(
    tx: &mut Transaction<'_, Sqlite>,
    generator: &mut UlidGenerator,
    metrics: &dyn MetricsSink,
    metadata: &EmailMetadata,
    body: &str,
    now: DateTime<Utc>,
) -> Result<StagedCapture, CoreError> {
    let started = std::time::Instant::now();
    let id = generator.next();
    let capture = build_capture(id.clone(), metadata, body, now)?;
    LedgerStore::insert_capture(tx, &capture).await?;
    metrics.record_histogram(
        "capture_email_staging_ms",
        started.elapsed().as_secs_f64() * 1000.0,
    );
    Ok(StagedCapture {
        capture_id: id,
        status: CaptureStatus::Staged,
        created_at: now,
    })
}

/// Typed-error variant for callers that want `staging.*` taxonomy codes
/// rather than a raw `CoreError` bubbling straight from `sqlx`. `stage`
/// (via `insert_capture`'s `map_sqlx_err`) already produces the correct
/// `staging.*` code, so this just passes the error through unchanged.
pub async fn stage_safe(
    tx: &mut Transaction<'_, Sqlite>,
    generator: &mut UlidGenerator,
    metrics: &dyn MetricsSink,
    metadata: &EmailMetadata,
    body: &str,
    now: DateTime<Utc>,
) -> Result<StagedCapture, CoreError> {
    stage(tx, generator, metrics, metadata, body, now).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture_bridge_ledger::LedgerStore;
    use capture_bridge_types::NoopMetricsSink;

    fn sample_metadata() -> EmailMetadata {
        EmailMetadata {
            channel: "email".to_string(),
            channel_native_id: "m1".to_string(),
            message_id: "abc@example.com".to_string(),
            from: "a@example.com".to_string(),
            subject: "(no subject)".to_string(),
            date: Utc::now().to_rfc3339(),
            thread_id: None,
            labels: Vec::new(),
            snippet: None,
            internal_date: None,
            size_estimate: None,
            history_id: None,
        }
    }

    #[tokio::test]
    async fn stages_a_capture_row_with_expected_shape() {
        let ledger = LedgerStore::open_in_memory().await.unwrap();
        let mut gen = UlidGenerator::new();
        let metrics = NoopMetricsSink;
        let now = Utc::now();
        let metadata = sample_metadata();

        let staged = ledger
            .with_transaction(|tx| {
                Box::pin(async move {
                    stage(tx, &mut gen, &metrics, &metadata, "hello", now).await
                })
            })
            .await
            .unwrap();

        assert_eq!(staged.status, CaptureStatus::Staged);
        let row = ledger.get_capture(&staged.capture_id).await.unwrap().unwrap();
        assert_eq!(row.source, CaptureSource::Email);
        assert_eq!(row.raw_content.as_deref(), Some("hello"));
        assert!(row.content_hash.is_none());
    }
}
