//! Domain types shared across the capture-bridge workspace.
//!
//! This crate holds no behavior beyond what is needed to keep the state
//! machine and error taxonomy honest: the [`Capture`] record, its status
//! lattice, the `exports_audit` / `errors_log` / `sync_state` row shapes,
//! and the [`CoreError`] surface that every subsystem ultimately maps
//! into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a capture originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    Voice,
    Email,
}

impl fmt::Display for CaptureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureSource::Voice => write!(f, "voice"),
            CaptureSource::Email => write!(f, "email"),
        }
    }
}

/// Lifecycle state of a [`Capture`]. See spec §4.8 for the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Staged,
    Transcribed,
    Exported,
    ExportedDuplicate,
    ExportedPlaceholder,
    FailedTranscription,
}

impl CaptureStatus {
    /// Terminal states never accept an outgoing transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CaptureStatus::Exported
                | CaptureStatus::ExportedDuplicate
                | CaptureStatus::ExportedPlaceholder
        )
    }

    /// Validate a transition against the exhaustive table in spec §4.8.
    pub fn can_transition_to(self, next: CaptureStatus) -> bool {
        use CaptureStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Staged, Transcribed)
                | (Transcribed, Exported)
                | (Staged, FailedTranscription)
                | (FailedTranscription, ExportedPlaceholder)
                | (Staged, ExportedDuplicate)
                | (Transcribed, ExportedDuplicate)
                | (Staged, Exported)
        )
    }
}

impl fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaptureStatus::Staged => "staged",
            CaptureStatus::Transcribed => "transcribed",
            CaptureStatus::Exported => "exported",
            CaptureStatus::ExportedDuplicate => "exported_duplicate",
            CaptureStatus::ExportedPlaceholder => "exported_placeholder",
            CaptureStatus::FailedTranscription => "failed_transcription",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CaptureStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "staged" => CaptureStatus::Staged,
            "transcribed" => CaptureStatus::Transcribed,
            "exported" => CaptureStatus::Exported,
            "exported_duplicate" => CaptureStatus::ExportedDuplicate,
            "exported_placeholder" => CaptureStatus::ExportedPlaceholder,
            "failed_transcription" => CaptureStatus::FailedTranscription,
            other => anyhow::bail!("unknown capture status: {other}"),
        })
    }
}

/// Closed-shape metadata for an email capture (spec §3.2).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailMetadata {
    pub channel: String,
    pub channel_native_id: String,
    pub message_id: String,
    pub from: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_estimate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_id: Option<String>,
}

pub fn default_subject() -> String {
    "(no subject)".to_string()
}

/// A capture row as stored in the `captures` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    pub id: String,
    pub source: CaptureSource,
    pub raw_content: Option<String>,
    pub content_hash: Option<String>,
    pub status: CaptureStatus,
    pub meta_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Delivery outcome recorded against a single export attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportMode {
    Initial,
    DuplicateSkip,
    SelfHeal,
    Conflict,
    Placeholder,
}

impl fmt::Display for ExportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExportMode::Initial => "initial",
            ExportMode::DuplicateSkip => "duplicate_skip",
            ExportMode::SelfHeal => "self_heal",
            ExportMode::Conflict => "conflict",
            ExportMode::Placeholder => "placeholder",
        };
        write!(f, "{s}")
    }
}

/// One row per delivery attempt that produced an on-disk outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportAuditRecord {
    pub id: i64,
    pub capture_id: String,
    pub vault_path: String,
    pub content_hash: String,
    pub exported_at: DateTime<Utc>,
    pub mode: ExportMode,
}

/// An append-only diagnostic row in `errors_log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogRecord {
    pub id: i64,
    pub source: String,
    pub code: Option<i64>,
    pub message: String,
    pub context: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Recognized `sync_state` keys (spec §3.1).
pub mod sync_keys {
    pub const GMAIL_HISTORY_ID: &str = "gmail_history_id";
    pub const LAST_GMAIL_AUTH: &str = "last_gmail_auth";
    pub const GMAIL_AUTH_FAILURES: &str = "gmail_auth_failures";
    pub const BACKUP_VERIFICATION_STATE: &str = "backup_verification_state";
}

/// Derived label for the backup escalation state machine (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationStatus {
    Healthy,
    Warn,
    DegradedBackup,
    HaltPruning,
}

impl EscalationStatus {
    pub fn from_consecutive_failures(count: u32) -> Self {
        match count {
            0 => EscalationStatus::Healthy,
            1 => EscalationStatus::Warn,
            2 => EscalationStatus::DegradedBackup,
            _ => EscalationStatus::HaltPruning,
        }
    }
}

/// Serialized value of `sync_state['backup_verification_state']`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupVerificationState {
    pub consecutive_failures: u32,
    pub last_success_timestamp: Option<DateTime<Utc>>,
    pub last_failure_timestamp: Option<DateTime<Utc>>,
    pub status: EscalationStatus,
}

impl Default for BackupVerificationState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            last_success_timestamp: None,
            last_failure_timestamp: None,
            status: EscalationStatus::Healthy,
        }
    }
}

impl BackupVerificationState {
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.status = EscalationStatus::Healthy;
        self.last_success_timestamp = Some(at);
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.status = EscalationStatus::from_consecutive_failures(self.consecutive_failures);
        self.last_failure_timestamp = Some(at);
    }
}

/// Error codes from the taxonomy in spec §7. Not every variant is a
/// `std::error::Error` type on its own; this enum is the stable wire
/// identifier carried on [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthInvalidClient,
    AuthInvalidGrant,
    AuthMaxFailures,
    FileParseError,
    FilePermissionError,
    ApiRateLimited,
    StagingInvalidMetadata,
    StagingDatabaseLocked,
    StagingDuplicateId,
    StagingDiskFull,
    StagingConstraint,
    Eacces,
    Eexist,
    Enetdown,
    Enospc,
    Erofs,
    PathEscape,
    BackupIntegrityFailure,
    BackupForeignKeyViolation,
    BackupMissingTable,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The `{code, message, recoverable}` surface every subsystem error maps
/// into at its crate boundary (spec §6/§7).
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable,
        }
    }
}

/// Injectable metrics surface (spec §9: clock, sleep, ULID source, and
/// metrics sink are all explicit dependencies so a test harness can
/// drive them deterministically). No external backend is wired up; this
/// is the emission point the poller and stager call into.
pub trait MetricsSink: Send + Sync {
    fn record_counter(&self, name: &str, value: u64);
    fn record_histogram(&self, name: &str, value_ms: f64);
    fn record_gauge(&self, name: &str, value: f64);
}

/// Default sink: drops every emission.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record_counter(&self, _name: &str, _value: u64) {}
    fn record_histogram(&self, _name: &str, _value_ms: f64) {}
    fn record_gauge(&self, _name: &str, _value: f64) {}
}

/// Emits every metric as a `tracing` event; used by the CLI binary since
/// no external metrics backend is in scope.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record_counter(&self, name: &str, value: u64) {
        tracing::info!(metric = name, kind = "counter", value, "metric");
    }
    fn record_histogram(&self, name: &str, value_ms: f64) {
        tracing::info!(metric = name, kind = "histogram", value_ms, "metric");
    }
    fn record_gauge(&self, name: &str, value: f64) {
        tracing::info!(metric = name, kind = "gauge", value, "metric");
    }
}

/// The mail provider's OAuth client secret file (spec §6). All five
/// fields are required; missing any is `AUTH_INVALID_CLIENT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailCredentialsInner {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uris: Vec<String>,
    pub auth_uri: String,
    pub token_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailCredentials {
    pub installed: GmailCredentialsInner,
}

const GMAIL_CREDENTIAL_FIELDS: [&str; 5] =
    ["client_id", "client_secret", "redirect_uris", "auth_uri", "token_uri"];

impl GmailCredentials {
    /// Parse and validate the closed shape. Malformed JSON is
    /// `FILE_PARSE_ERROR`; a structurally valid document missing
    /// `installed` or any of its five required fields is
    /// `AUTH_INVALID_CLIENT` (spec §6).
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| CoreError::new(ErrorCode::FileParseError, e.to_string(), false))?;

        let installed = value.get("installed").ok_or_else(|| {
            CoreError::new(ErrorCode::AuthInvalidClient, "missing required field: installed", false)
        })?;
        for field in GMAIL_CREDENTIAL_FIELDS {
            if installed.get(field).is_none() {
                return Err(CoreError::new(
                    ErrorCode::AuthInvalidClient,
                    format!("missing required credential field: {field}"),
                    false,
                ));
            }
        }

        serde_json::from_value(value)
            .map_err(|e| CoreError::new(ErrorCode::FileParseError, e.to_string(), false))
    }
}

/// The cached OAuth token file (spec §6). Written atomically with mode
/// `0600`, preserved across refreshes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenFile {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry_date: i64,
    pub scope: String,
    pub token_type: String,
}

impl TokenFile {
    /// `now + 300s >= expiry_date` (both epoch millis).
    pub fn is_expired(&self, now_epoch_millis: i64) -> bool {
        now_epoch_millis + 300_000 >= self.expiry_date
    }

    /// A refreshed token must still carry `gmail.readonly`.
    pub fn has_readonly_scope(&self) -> bool {
        self.scope.split_whitespace().any(|s| s == "gmail.readonly")
    }
}
