//! The top-level `Engine` (spec §5): wires the ledger, vault, email
//! poller, and backup subsystems into the two cycles a host process
//! drives — exporting staged/transcribed/failed captures, and rolling
//! the hourly/daily backup schedule.

use std::path::PathBuf;
use std::sync::Arc;

use capture_bridge_backup::{create_backup, prune_daily, promote_daily, record_verification_outcome, verify_backup};
use capture_bridge_email::EmailPoller;
use capture_bridge_ledger::LedgerStore;
use capture_bridge_types::{sync_keys, BackupVerificationState, CaptureStatus, CoreError, MetricsSink, NoopMetricsSink};
use chrono::{DateTime, Utc};

use crate::exporter::{export_capture, ExportOutcome};

/// Filesystem layout the engine needs beyond the live ledger connection
/// (spec §4.6's `<vault>/.capture-bridge/.backups/{hourly,daily}`).
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub ledger_db: PathBuf,
    pub vault_root: PathBuf,
    pub hourly_backup_dir: PathBuf,
    pub daily_backup_dir: PathBuf,
}

impl EnginePaths {
    pub fn under_vault(vault_root: impl Into<PathBuf>, ledger_db: impl Into<PathBuf>) -> Self {
        let vault_root = vault_root.into();
        let backups = vault_root.join(".capture-bridge").join(".backups");
        Self {
            ledger_db: ledger_db.into(),
            hourly_backup_dir: backups.join("hourly"),
            daily_backup_dir: backups.join("daily"),
            vault_root,
        }
    }
}

/// Statuses scanned for export work, in the order the exporter visits
/// them. Order doesn't affect correctness (each capture's own status
/// gates which transition applies) but keeps logs readable.
const EXPORTABLE_STATUSES: [CaptureStatus; 3] = [
    CaptureStatus::Staged,
    CaptureStatus::Transcribed,
    CaptureStatus::FailedTranscription,
];

/// Result of one `run_export_cycle` call.
#[derive(Debug, Default)]
pub struct ExportCycleReport {
    pub exported: Vec<ExportOutcome>,
    /// Recoverable failures (EACCES/ENETDOWN/EEXIST) logged and skipped.
    pub recoverable_failures: Vec<CoreError>,
    /// Set when a fatal error (ENOSPC/EROFS) halted the loop early.
    pub halted_by: Option<CoreError>,
}

/// Result of one `run_backup_cycle` call.
#[derive(Debug)]
pub struct BackupCycleReport {
    pub backed_up: PathBuf,
    pub verification_passed: bool,
    pub promoted: Option<PathBuf>,
    pub pruned: Vec<PathBuf>,
}

pub struct Engine {
    ledger: LedgerStore,
    paths: EnginePaths,
    poller: Option<EmailPoller>,
    metrics: Arc<dyn MetricsSink>,
}

impl Engine {
    pub fn new(ledger: LedgerStore, paths: EnginePaths) -> Self {
        Self {
            ledger,
            paths,
            poller: None,
            metrics: Arc::new(NoopMetricsSink),
        }
    }

    pub fn with_poller(mut self, poller: EmailPoller) -> Self {
        self.poller = Some(poller);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn paths(&self) -> &EnginePaths {
        &self.paths
    }

    /// Poll Gmail for new messages, if a poller is configured. A no-op
    /// (not an error) for a voice-memo-only deployment.
    pub async fn poll_email(&self, now: DateTime<Utc>) -> Option<Result<capture_bridge_email::PollOutcome, CoreError>> {
        match &self.poller {
            Some(poller) => Some(poller.poll_once(now).await),
            None => None,
        }
    }

    /// Export every eligible capture, in status order. Stops at the
    /// first fatal (non-recoverable) error (spec §4.11 step 7); earlier
    /// successes and recoverable failures are still reported.
    pub async fn run_export_cycle(&self, now: DateTime<Utc>) -> Result<ExportCycleReport, CoreError> {
        let mut report = ExportCycleReport::default();

        for status in EXPORTABLE_STATUSES {
            let captures = self.ledger.list_captures_by_status(status).await?;
            for capture in captures {
                match export_capture(&self.ledger, &self.paths.vault_root, &capture.id, now).await {
                    Ok(outcome) => {
                        self.metrics.record_counter("capture_export_total", 1);
                        report.exported.push(outcome);
                    }
                    Err(err) if err.recoverable => {
                        tracing::warn!(capture_id = %capture.id, error = %err.message, "recoverable export failure");
                        report.recoverable_failures.push(err);
                    }
                    Err(err) => {
                        tracing::error!(capture_id = %capture.id, error = %err.message, "fatal export failure, halting cycle");
                        report.halted_by = Some(err.clone());
                        return Ok(report_with_halt(report, err));
                    }
                }
            }
        }

        Ok(report)
    }

    /// Snapshot, verify, promote, and prune (spec §4.6). Runs the full
    /// escalation state update regardless of whether promotion/pruning
    /// happen, since those are gated on `HaltPruning`.
    pub async fn run_backup_cycle(&self, now: DateTime<Utc>) -> Result<BackupCycleReport, CoreError> {
        std::fs::create_dir_all(&self.paths.hourly_backup_dir)
            .map_err(|e| CoreError::new(capture_bridge_types::ErrorCode::FilePermissionError, e.to_string(), true))?;

        let backup = create_backup(&self.paths.ledger_db, &self.paths.hourly_backup_dir, now).await?;
        let verification = verify_backup(&backup.path, Some(&self.paths.ledger_db), true).await?;
        self.metrics.record_gauge(
            "backup_verification_result",
            if verification.passed() { 1.0 } else { 0.0 },
        );

        let mut state = self.load_backup_state().await?;
        record_verification_outcome(&mut state, verification.passed(), now);
        self.save_backup_state(&state, now).await?;

        let mut promoted = None;
        let mut pruned = Vec::new();

        if verification.passed() && state.status != capture_bridge_types::EscalationStatus::HaltPruning {
            if let Some(promotion) = promote_daily(&self.paths.hourly_backup_dir, &self.paths.daily_backup_dir, now.date_naive()).await? {
                promoted = Some(promotion.path);
            }
            pruned = prune_daily(&self.paths.daily_backup_dir, 7)?.deleted;
        }

        Ok(BackupCycleReport {
            backed_up: backup.path,
            verification_passed: verification.passed(),
            promoted,
            pruned,
        })
    }

    async fn load_backup_state(&self) -> Result<BackupVerificationState, CoreError> {
        match self.ledger.get_sync_state(sync_keys::BACKUP_VERIFICATION_STATE).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                CoreError::new(
                    capture_bridge_types::ErrorCode::FileParseError,
                    format!("corrupt backup_verification_state: {e}"),
                    false,
                )
            }),
            None => Ok(BackupVerificationState::default()),
        }
    }

    async fn save_backup_state(&self, state: &BackupVerificationState, now: DateTime<Utc>) -> Result<(), CoreError> {
        let raw = serde_json::to_string(state).map_err(|e| {
            CoreError::new(
                capture_bridge_types::ErrorCode::FileParseError,
                format!("failed to serialize backup_verification_state: {e}"),
                false,
            )
        })?;
        self.ledger
            .with_transaction(move |tx| {
                Box::pin(async move { LedgerStore::set_sync_state(tx, sync_keys::BACKUP_VERIFICATION_STATE, &raw, now).await })
            })
            .await
    }
}

fn report_with_halt(mut report: ExportCycleReport, err: CoreError) -> ExportCycleReport {
    report.halted_by = Some(err);
    report
}
