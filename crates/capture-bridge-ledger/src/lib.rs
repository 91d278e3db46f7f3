//! The staging ledger: a single SQLite file holding the four tables the
//! core is allowed to own (`captures`, `exports_audit`, `errors_log`,
//! `sync_state`).
//!
//! Every state-advancing action the core takes happens inside one
//! [`LedgerStore::with_transaction`] call so that a crash between an
//! external side effect and its ledger commit leaves the two mutually
//! consistent on retry.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;

use capture_bridge_types::{
    Capture, CaptureSource, CaptureStatus, CoreError, ErrorCode, ErrorLogRecord, ExportAuditRecord,
    ExportMode,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

const SCHEMA: &str = include_str!("schema.sql");

/// `busy_timeout` floor mandated by spec §4.5.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// The four-table embedded store. Cheap to clone: it wraps a pooled
/// connection handle.
#[derive(Clone)]
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    /// Open (creating if absent) the ledger file at `path`, with WAL
    /// journaling, `synchronous=NORMAL`, foreign keys on, and a
    /// `busy_timeout` floor (spec §4.5).
    pub async fn open(path: &Path) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS as u64))
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(map_connect_err)?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(Self { pool })
    }

    /// In-memory ledger for tests; same schema and pragmas as a file-backed
    /// store, scoped to a single connection's lifetime.
    pub async fn open_in_memory() -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(map_connect_err)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(map_connect_err)?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(Self { pool })
    }

    /// Checkpoint the WAL into the main database file, best-effort (used
    /// before a backup snapshot; spec §4.6).
    pub async fn checkpoint_wal(&self) -> Result<(), CoreError> {
        let _ = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run `f` inside a single transaction: commit if `f` succeeds, roll
    /// back if it returns an error. This is the only way the core is
    /// meant to advance ledger state (spec §4.5, §5).
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        F: for<'c> FnOnce(
            &'c mut Transaction<'_, Sqlite>,
        ) -> Pin<Box<dyn Future<Output = Result<T, CoreError>> + Send + 'c>>,
    {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await.map_err(map_sqlx_err)?;
                Ok(value)
            }
            Err(err) => {
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    // -- sync_state ---------------------------------------------------

    pub async fn get_sync_state(&self, key: &str) -> Result<Option<String>, CoreError> {
        let row = sqlx::query("SELECT value FROM sync_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    /// `INSERT ... ON CONFLICT(key) DO UPDATE` upsert (spec §4.5).
    pub async fn set_sync_state(
        tx: &mut Transaction<'_, Sqlite>,
        key: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO sync_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(to_iso8601(now))
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    // -- captures -------------------------------------------------------

    /// Insert a freshly-staged capture row. Callers generate the id
    /// themselves (capture-bridge-hashing's `UlidGenerator`).
    pub async fn insert_capture(
        tx: &mut Transaction<'_, Sqlite>,
        capture: &Capture,
    ) -> Result<(), CoreError> {
        let meta = serde_json::to_string(&capture.meta_json).map_err(|e| {
            CoreError::new(
                ErrorCode::StagingInvalidMetadata,
                format!("meta_json is not serializable: {e}"),
                false,
            )
        })?;
        sqlx::query(
            "INSERT INTO captures (id, source, raw_content, content_hash, status, meta_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&capture.id)
        .bind(capture.source.to_string())
        .bind(&capture.raw_content)
        .bind(&capture.content_hash)
        .bind(capture.status.to_string())
        .bind(meta)
        .bind(to_iso8601(capture.created_at))
        .bind(to_iso8601(capture.updated_at))
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    pub async fn get_capture(&self, id: &str) -> Result<Option<Capture>, CoreError> {
        let row = sqlx::query("SELECT * FROM captures WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        row.map(row_to_capture).transpose()
    }

    /// Captures currently sitting in `status`, oldest first. Used by the
    /// exporter to find work without the caller needing to track ids.
    pub async fn list_captures_by_status(
        &self,
        status: CaptureStatus,
    ) -> Result<Vec<Capture>, CoreError> {
        let rows = sqlx::query("SELECT * FROM captures WHERE status = ?1 ORDER BY created_at, id")
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.into_iter().map(row_to_capture).collect()
    }

    /// Whether any `exports_audit` row already exists for `capture_id`
    /// (the Direct Exporter needs this to distinguish `initial` from
    /// `self_heal` when the on-disk file is absent; spec §4.4).
    pub async fn has_prior_export_audit(&self, capture_id: &str) -> Result<bool, CoreError> {
        let row = sqlx::query("SELECT 1 FROM exports_audit WHERE capture_id = ?1 LIMIT 1")
            .bind(capture_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(row.is_some())
    }

    /// Advance `capture.status`, validating the transition against
    /// [`CaptureStatus::can_transition_to`] before writing.
    pub async fn advance_capture_status(
        tx: &mut Transaction<'_, Sqlite>,
        capture_id: &str,
        current: CaptureStatus,
        next: CaptureStatus,
        content_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if !current.can_transition_to(next) {
            return Err(CoreError::new(
                ErrorCode::StagingConstraint,
                format!("illegal capture transition {current} -> {next}"),
                false,
            ));
        }
        sqlx::query(
            "UPDATE captures SET status = ?1, content_hash = COALESCE(?2, content_hash), updated_at = ?3 WHERE id = ?4",
        )
        .bind(next.to_string())
        .bind(content_hash)
        .bind(to_iso8601(now))
        .bind(capture_id)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    // -- exports_audit ----------------------------------------------------

    pub async fn insert_export_audit(
        tx: &mut Transaction<'_, Sqlite>,
        capture_id: &str,
        vault_path: &str,
        content_hash: &str,
        mode: ExportMode,
        now: DateTime<Utc>,
    ) -> Result<i64, CoreError> {
        let result = sqlx::query(
            "INSERT INTO exports_audit (capture_id, vault_path, content_hash, exported_at, mode)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(capture_id)
        .bind(vault_path)
        .bind(content_hash)
        .bind(to_iso8601(now))
        .bind(mode.to_string())
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.last_insert_rowid())
    }

    pub async fn audit_rows_for_capture(
        &self,
        capture_id: &str,
    ) -> Result<Vec<ExportAuditRecord>, CoreError> {
        let rows = sqlx::query("SELECT * FROM exports_audit WHERE capture_id = ?1 ORDER BY id")
            .bind(capture_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.into_iter().map(row_to_audit).collect()
    }

    // -- errors_log -------------------------------------------------------

    /// Append a diagnostic row. Per spec §4.9, logging failures must never
    /// surface to the caller, so this swallows its own errors.
    pub async fn log_error(&self, source: &str, code: Option<i64>, message: &str, context: Option<&str>) {
        let now = to_iso8601(Utc::now());
        let _ = sqlx::query(
            "INSERT INTO errors_log (source, code, message, context, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(source)
        .bind(code)
        .bind(message)
        .bind(context)
        .bind(now)
        .execute(&self.pool)
        .await;
    }

    pub async fn recent_errors(&self, limit: i64) -> Result<Vec<ErrorLogRecord>, CoreError> {
        let rows = sqlx::query("SELECT * FROM errors_log ORDER BY id DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        rows.into_iter().map(row_to_error).collect()
    }
}

fn to_iso8601(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn row_to_capture(row: sqlx::sqlite::SqliteRow) -> Result<Capture, CoreError> {
    let source: String = row.get("source");
    let status: String = row.get("status");
    let meta_raw: String = row.get("meta_json");
    Ok(Capture {
        id: row.get("id"),
        source: match source.as_str() {
            "voice" => CaptureSource::Voice,
            "email" => CaptureSource::Email,
            other => {
                return Err(CoreError::new(
                    ErrorCode::StagingConstraint,
                    format!("unknown capture source in row: {other}"),
                    false,
                ))
            }
        },
        raw_content: row.get("raw_content"),
        content_hash: row.get("content_hash"),
        status: CaptureStatus::from_str(&status).map_err(|e| {
            CoreError::new(ErrorCode::StagingConstraint, e.to_string(), false)
        })?,
        meta_json: serde_json::from_str(&meta_raw).map_err(|e| {
            CoreError::new(ErrorCode::StagingInvalidMetadata, e.to_string(), false)
        })?,
        created_at: parse_iso8601(&row.get::<String, _>("created_at"))?,
        updated_at: parse_iso8601(&row.get::<String, _>("updated_at"))?,
    })
}

fn row_to_audit(row: sqlx::sqlite::SqliteRow) -> Result<ExportAuditRecord, CoreError> {
    let mode: String = row.get("mode");
    Ok(ExportAuditRecord {
        id: row.get("id"),
        capture_id: row.get("capture_id"),
        vault_path: row.get("vault_path"),
        content_hash: row.get("content_hash"),
        exported_at: parse_iso8601(&row.get::<String, _>("exported_at"))?,
        mode: match mode.as_str() {
            "initial" => ExportMode::Initial,
            "duplicate_skip" => ExportMode::DuplicateSkip,
            "self_heal" => ExportMode::SelfHeal,
            "conflict" => ExportMode::Conflict,
            "placeholder" => ExportMode::Placeholder,
            other => {
                return Err(CoreError::new(
                    ErrorCode::StagingConstraint,
                    format!("unknown export mode in row: {other}"),
                    false,
                ))
            }
        },
    })
}

fn row_to_error(row: sqlx::sqlite::SqliteRow) -> Result<ErrorLogRecord, CoreError> {
    Ok(ErrorLogRecord {
        id: row.get("id"),
        source: row.get("source"),
        code: row.get("code"),
        message: row.get("message"),
        context: row.get("context"),
        created_at: parse_iso8601(&row.get::<String, _>("created_at"))?,
    })
}

fn parse_iso8601(s: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::new(ErrorCode::StagingConstraint, e.to_string(), false))
}

fn map_connect_err(err: sqlx::Error) -> CoreError {
    CoreError::new(
        ErrorCode::FilePermissionError,
        format!("failed to open ledger: {err}"),
        false,
    )
}

/// Map a `sqlx::Error` to the taxonomy in spec §4.5.
fn map_sqlx_err(err: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(ref db_err) = err {
        let msg = db_err.message();
        if msg.contains("database is locked") || msg.contains("busy") {
            return CoreError::new(ErrorCode::StagingDatabaseLocked, msg.to_string(), true);
        }
        if db_err.is_unique_violation() {
            return CoreError::new(ErrorCode::StagingDuplicateId, msg.to_string(), true);
        }
        if msg.contains("disk") || msg.contains("no space") {
            return CoreError::new(ErrorCode::StagingDiskFull, msg.to_string(), false);
        }
        return CoreError::new(ErrorCode::StagingConstraint, msg.to_string(), false);
    }
    CoreError::new(ErrorCode::StagingConstraint, err.to_string(), false)
}
