//! Direct Exporter (spec §4.11): the one piece of the core that bridges
//! the ledger and the vault. Resolves the target path, asks the
//! Collision Detector what to do, writes atomically when called for,
//! then records the outcome and advances the capture's status in a
//! single ledger transaction.

use std::path::{Path, PathBuf};

use capture_bridge_hashing::{email_hash, hash, normalize};
use capture_bridge_ledger::LedgerStore;
use capture_bridge_types::{Capture, CaptureSource, CaptureStatus, CoreError, ErrorCode, ExportMode};
use capture_bridge_vault::{detect_collision, format_note, format_placeholder_note, resolve_capture_path, write_atomic, CollisionDecision};
use chrono::{DateTime, Utc};

/// What a single `export_capture` call accomplished.
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub capture_id: String,
    pub mode: ExportMode,
    pub vault_path: PathBuf,
}

/// Whether this capture is delivered as a full note, an opaque
/// placeholder, or is a re-export of a capture already in a terminal
/// status (spec §8 scenario 6 / idempotence law: re-exporting an
/// already-exported capture still reaches the Collision Detector and
/// records a `duplicate_skip` audit row, but never re-advances status
/// since §4.8 forbids any transition out of a terminal state).
enum ExportPlan {
    Full {
        initial_status: CaptureStatus,
        duplicate_status: CaptureStatus,
    },
    Placeholder,
    AlreadyTerminal,
}

fn plan_for(capture: &Capture) -> Result<ExportPlan, CoreError> {
    match capture.status {
        CaptureStatus::Staged if capture.source == CaptureSource::Email => Ok(ExportPlan::Full {
            initial_status: CaptureStatus::Exported,
            duplicate_status: CaptureStatus::ExportedDuplicate,
        }),
        CaptureStatus::Transcribed => Ok(ExportPlan::Full {
            initial_status: CaptureStatus::Exported,
            duplicate_status: CaptureStatus::ExportedDuplicate,
        }),
        CaptureStatus::FailedTranscription => Ok(ExportPlan::Placeholder),
        CaptureStatus::Exported | CaptureStatus::ExportedDuplicate | CaptureStatus::ExportedPlaceholder => {
            Ok(ExportPlan::AlreadyTerminal)
        }
        other => Err(CoreError::new(
            ErrorCode::StagingConstraint,
            format!("capture {} in status {other} is not eligible for export", capture.id),
            false,
        )),
    }
}

/// Resolve the email canonical hash or, for voice, bind a generic
/// content hash when transcription left it unset (spec §3.1's "late
/// binding" invariant also names `exported_placeholder`, so a voice
/// capture whose transcription failed before a fingerprint was ever
/// recorded still gets one here).
fn bind_content_hash(capture: &Capture) -> String {
    if let Some(existing) = &capture.content_hash {
        return existing.clone();
    }
    match capture.source {
        CaptureSource::Email => {
            let message_id = capture
                .meta_json
                .get("message_id")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            email_hash(message_id, capture.raw_content.as_deref().unwrap_or(""))
        }
        CaptureSource::Voice => hash(&normalize(capture.raw_content.as_deref().unwrap_or(""))),
    }
}

/// Export one capture inside a single transactional unit. Returns the
/// decided outcome on success; on a `conflict` collision the audit row
/// still commits (so the attempt is visible), but the call returns a
/// recoverable error and the capture's status is left untouched so a
/// later export can retry.
pub async fn export_capture(
    ledger: &LedgerStore,
    vault_root: &Path,
    capture_id: &str,
    now: DateTime<Utc>,
) -> Result<ExportOutcome, CoreError> {
    let capture = ledger.get_capture(capture_id).await?.ok_or_else(|| {
        CoreError::new(
            ErrorCode::StagingConstraint,
            format!("no such capture: {capture_id}"),
            false,
        )
    })?;

    let plan = plan_for(&capture)?;
    let content_hash = bind_content_hash(&capture);

    let rendered = match &plan {
        ExportPlan::Full { .. } | ExportPlan::AlreadyTerminal => format_note(
            &capture.id,
            capture.source,
            capture.created_at,
            &content_hash,
            capture.raw_content.as_deref().unwrap_or(""),
            &capture.meta_json,
        ),
        ExportPlan::Placeholder => {
            let reason = capture
                .meta_json
                .get("failure_reason")
                .and_then(|v| v.as_str())
                .unwrap_or("transcription unavailable");
            format_placeholder_note(&capture.id, capture.created_at, reason)
        }
    };

    let target_path = resolve_capture_path(vault_root, &capture.id)?;
    let has_prior_audit = ledger.has_prior_export_audit(&capture.id).await?;
    let file_hash = hash(&rendered);
    let decision = detect_collision(&target_path, &file_hash, has_prior_audit)?;

    let vault_path = format!("inbox/{}.md", capture.id);

    if matches!(decision, CollisionDecision::Initial | CollisionDecision::SelfHeal) {
        write_atomic(vault_root, &target_path, rendered.as_bytes())?;
    }

    // `placeholder` is its own top-level mode (spec §4.2's attribute
    // list), distinct from the initial/self_heal/duplicate_skip family
    // that only applies to a fully-delivered note. A genuine conflict
    // always surfaces as `conflict`, even for a placeholder export. A
    // re-export of an already-terminal capture maps the same way a
    // first-time `Full` export would.
    let mode = match (&plan, decision) {
        (_, CollisionDecision::Conflict) => ExportMode::Conflict,
        (ExportPlan::Placeholder, _) => ExportMode::Placeholder,
        (_, CollisionDecision::Initial) => ExportMode::Initial,
        (_, CollisionDecision::SelfHeal) => ExportMode::SelfHeal,
        (_, CollisionDecision::DuplicateSkip) => ExportMode::DuplicateSkip,
    };

    if let CollisionDecision::Conflict = decision {
        ledger
            .with_transaction(|tx| {
                let capture_id = capture.id.clone();
                let vault_path = vault_path.clone();
                let file_hash = file_hash.clone();
                Box::pin(async move {
                    LedgerStore::insert_export_audit(
                        tx,
                        &capture_id,
                        &vault_path,
                        &file_hash,
                        ExportMode::Conflict,
                        now,
                    )
                    .await
                    .map(|_| ())
                })
            })
            .await?;
        return Err(CoreError::new(
            ErrorCode::Eexist,
            format!("export conflict at {}", target_path.display()),
            true,
        ));
    }

    // `None` means the capture is already in a terminal status (a
    // re-export producing `duplicate_skip`/`self_heal`/`initial` against
    // an already-delivered capture) and must not attempt a transition
    // that §4.8 would reject.
    let next_status = match (&plan, &decision) {
        (ExportPlan::AlreadyTerminal, _) => None,
        (ExportPlan::Placeholder, _) => Some(CaptureStatus::ExportedPlaceholder),
        (ExportPlan::Full { initial_status, .. }, CollisionDecision::Initial | CollisionDecision::SelfHeal) => {
            Some(*initial_status)
        }
        (ExportPlan::Full { duplicate_status, .. }, CollisionDecision::DuplicateSkip) => Some(*duplicate_status),
        (ExportPlan::Full { .. }, CollisionDecision::Conflict) => unreachable!("handled above"),
    };

    let current_status = capture.status;
    let capture_id_owned = capture.id.clone();
    let vault_path_owned = vault_path.clone();
    let file_hash_owned = file_hash.clone();
    ledger
        .with_transaction(move |tx| {
            Box::pin(async move {
                LedgerStore::insert_export_audit(
                    tx,
                    &capture_id_owned,
                    &vault_path_owned,
                    &file_hash_owned,
                    mode,
                    now,
                )
                .await?;
                if let Some(next_status) = next_status {
                    LedgerStore::advance_capture_status(
                        tx,
                        &capture_id_owned,
                        current_status,
                        next_status,
                        Some(&content_hash),
                        now,
                    )
                    .await?;
                }
                Ok(())
            })
        })
        .await?;

    Ok(ExportOutcome {
        capture_id: capture.id,
        mode,
        vault_path: target_path,
    })
}
