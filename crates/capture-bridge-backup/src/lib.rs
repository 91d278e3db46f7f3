//! Hourly ledger snapshots, integrity verification, daily promotion,
//! pruning, and the escalation state machine that guards the ledger
//! itself (spec §4.6).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use capture_bridge_types::{BackupVerificationState, CoreError, ErrorCode};
use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

const REQUIRED_TABLES: [&str; 4] = ["captures", "exports_audit", "errors_log", "sync_state"];

#[derive(Debug, Clone)]
pub struct BackupResult {
    pub path: PathBuf,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub integrity_ok: bool,
    pub hash_match: bool,
    pub restore_test_ok: Option<bool>,
}

impl VerifyResult {
    pub fn passed(&self) -> bool {
        self.integrity_ok && self.restore_test_ok.unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct PromotionResult {
    pub path: PathBuf,
    pub selected_reason: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct PruneResult {
    pub deleted: Vec<PathBuf>,
}

fn hourly_file_name(at: DateTime<Utc>) -> String {
    format!("ledger-{}.sqlite", at.format("%Y%m%d-%H"))
}

fn daily_file_name(date: NaiveDate) -> String {
    format!("ledger-{}.sqlite", date.format("%Y%m%d"))
}

fn set_mode_0600(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
        CoreError::new(
            ErrorCode::FilePermissionError,
            format!("failed to chmod {}: {e}", path.display()),
            true,
        )
    })
}

/// Best-effort WAL checkpoint, then copy the live ledger file into
/// `hourly_dir` (spec §4.6: target completion under 5s).
pub async fn create_backup(
    live_db_path: &Path,
    hourly_dir: &Path,
    now: DateTime<Utc>,
) -> Result<BackupResult, CoreError> {
    let start = Instant::now();

    if let Ok(pool) = SqlitePool::connect(&format!("sqlite://{}", live_db_path.display())).await {
        let _ = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&pool)
            .await;
        pool.close().await;
    }

    fs::create_dir_all(hourly_dir).map_err(|e| {
        CoreError::new(
            ErrorCode::FilePermissionError,
            format!("failed to create {}: {e}", hourly_dir.display()),
            true,
        )
    })?;

    let target = hourly_dir.join(hourly_file_name(now));
    fs::copy(live_db_path, &target).map_err(|e| {
        CoreError::new(
            ErrorCode::FilePermissionError,
            format!("failed to copy ledger to {}: {e}", target.display()),
            true,
        )
    })?;
    set_mode_0600(&target)?;

    Ok(BackupResult {
        path: target,
        duration: start.elapsed(),
    })
}

async fn open_read_only(path: &Path) -> Result<SqlitePool, CoreError> {
    let options = SqliteConnectOptions::new().filename(path).read_only(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| {
            CoreError::new(
                ErrorCode::BackupIntegrityFailure,
                format!("failed to open backup {}: {e}", path.display()),
                false,
            )
        })
}

async fn integrity_check(pool: &SqlitePool) -> Result<bool, CoreError> {
    let row = sqlx::query("PRAGMA integrity_check")
        .fetch_one(pool)
        .await
        .map_err(|e| CoreError::new(ErrorCode::BackupIntegrityFailure, e.to_string(), false))?;
    let value: String = row.get(0);
    Ok(value == "ok")
}

async fn streaming_sha256(path: &Path) -> Result<String, CoreError> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| CoreError::new(ErrorCode::FilePermissionError, e.to_string(), true))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| CoreError::new(ErrorCode::FilePermissionError, e.to_string(), true))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn restore_test(backup_path: &Path) -> Result<bool, CoreError> {
    let scratch_dir = std::env::temp_dir();
    let scratch_path = scratch_dir.join(format!(
        "capture-bridge-restore-test-{}-{}.sqlite",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));

    let run = async {
        fs::copy(backup_path, &scratch_path)
            .map_err(|e| CoreError::new(ErrorCode::FilePermissionError, e.to_string(), true))?;
        let pool = open_read_only(&scratch_path).await?;

        if !integrity_check(&pool).await? {
            return Ok(false);
        }

        let rows = sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(&pool)
            .await
            .map_err(|e| CoreError::new(ErrorCode::BackupMissingTable, e.to_string(), false))?;
        let names: Vec<String> = rows.iter().map(|r| r.get(0)).collect();
        for required in REQUIRED_TABLES {
            if !names.iter().any(|n| n == required) {
                return Err(CoreError::new(
                    ErrorCode::BackupMissingTable,
                    format!("backup is missing table {required}"),
                    false,
                ));
            }
        }

        let fk_violations = sqlx::query("PRAGMA foreign_key_check")
            .fetch_all(&pool)
            .await
            .map_err(|e| CoreError::new(ErrorCode::BackupForeignKeyViolation, e.to_string(), false))?;
        if !fk_violations.is_empty() {
            return Err(CoreError::new(
                ErrorCode::BackupForeignKeyViolation,
                "foreign_key_check reported violations".to_string(),
                false,
            ));
        }

        let _count: i64 = sqlx::query("SELECT COUNT(*) FROM captures")
            .fetch_one(&pool)
            .await
            .map_err(|e| CoreError::new(ErrorCode::BackupIntegrityFailure, e.to_string(), false))?
            .get(0);

        pool.close().await;
        Ok(true)
    }
    .await;

    let _ = fs::remove_file(&scratch_path);
    run
}

/// Verify a backup file (spec §4.6). `live` being absent yields
/// `hash_match=false` with no error, since a mismatch from writes since
/// the snapshot is an expected signal, not a failure.
pub async fn verify_backup(
    backup_path: &Path,
    live_path: Option<&Path>,
    do_restore_test: bool,
) -> Result<VerifyResult, CoreError> {
    let pool = open_read_only(backup_path).await?;
    let integrity_ok = integrity_check(&pool).await?;
    pool.close().await;

    let hash_match = match live_path {
        Some(live) if live.exists() => {
            streaming_sha256(backup_path).await? == streaming_sha256(live).await?
        }
        _ => false,
    };

    let restore_test_ok = if do_restore_test {
        Some(restore_test(backup_path).await?)
    } else {
        None
    };

    Ok(VerifyResult {
        integrity_ok,
        hash_match,
        restore_test_ok,
    })
}

/// Pick the `12:00` hourly backup for `date` if present, else the
/// earliest hour available.
fn select_promotion_source(hourly_dir: &Path, date: NaiveDate) -> Option<(PathBuf, &'static str)> {
    let prefix = format!("ledger-{}-", date.format("%Y%m%d"));
    let mut candidates: Vec<(String, PathBuf)> = fs::read_dir(hourly_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            if name.starts_with(&prefix) && name.ends_with(".sqlite") {
                Some((name, entry.path()))
            } else {
                None
            }
        })
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    let noon_name = format!("{prefix}12.sqlite");
    if let Some((_, path)) = candidates.iter().find(|(name, _)| name == &noon_name) {
        return Some((path.clone(), "noon_backup"));
    }
    candidates
        .into_iter()
        .next()
        .map(|(_, path)| (path, "earliest_available"))
}

/// Promote the chosen hourly backup for `date` to the daily directory.
/// Idempotent: skipped (returning `Ok(None)`) if a daily file already
/// exists for that date.
pub async fn promote_daily(
    hourly_dir: &Path,
    daily_dir: &Path,
    date: NaiveDate,
) -> Result<Option<PromotionResult>, CoreError> {
    fs::create_dir_all(daily_dir)
        .map_err(|e| CoreError::new(ErrorCode::FilePermissionError, e.to_string(), true))?;

    let target = daily_dir.join(daily_file_name(date));
    if target.exists() {
        return Ok(None);
    }

    let (source, reason) = select_promotion_source(hourly_dir, date).ok_or_else(|| {
        CoreError::new(
            ErrorCode::BackupMissingTable,
            format!("no hourly backup available for {date}"),
            true,
        )
    })?;

    let verification = verify_backup(&source, None, false).await?;
    if !verification.passed() {
        return Err(CoreError::new(
            ErrorCode::BackupIntegrityFailure,
            format!("hourly backup {} failed verification", source.display()),
            false,
        ));
    }

    fs::copy(&source, &target).map_err(|e| CoreError::new(ErrorCode::FilePermissionError, e.to_string(), true))?;
    set_mode_0600(&target)?;

    Ok(Some(PromotionResult {
        path: target,
        selected_reason: reason,
    }))
}

/// Keep the newest `keep` daily backups by lexicographic filename
/// (which matches chronological order under `ledger-YYYYMMDD.sqlite`).
pub fn prune_daily(daily_dir: &Path, keep: usize) -> Result<PruneResult, CoreError> {
    let mut files: Vec<PathBuf> = fs::read_dir(daily_dir)
        .map_err(|e| CoreError::new(ErrorCode::FilePermissionError, e.to_string(), true))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().map(|e| e == "sqlite").unwrap_or(false))
        .collect();
    files.sort();

    let mut result = PruneResult::default();
    if files.len() > keep {
        for stale in &files[..files.len() - keep] {
            fs::remove_file(stale)
                .map_err(|e| CoreError::new(ErrorCode::FilePermissionError, e.to_string(), true))?;
            result.deleted.push(stale.clone());
        }
    }
    Ok(result)
}

/// Apply the spec §4.6 escalation transition and return whether the
/// attempt should be treated as a success for metrics purposes.
pub fn record_verification_outcome(state: &mut BackupVerificationState, success: bool, now: DateTime<Utc>) {
    if success {
        state.record_success(now);
    } else {
        state.record_failure(now);
    }
}

/// Manual-intervention operation: create a backup, verify it with a
/// restore test, and apply the escalation transition rules.
pub async fn force_backup_and_verify(
    live_db_path: &Path,
    hourly_dir: &Path,
    state: &mut BackupVerificationState,
    now: DateTime<Utc>,
) -> Result<VerifyResult, CoreError> {
    let backup = create_backup(live_db_path, hourly_dir, now).await?;
    let verification = verify_backup(&backup.path, Some(live_db_path), true).await?;
    record_verification_outcome(state, verification.passed(), now);
    Ok(verification)
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture_bridge_types::EscalationStatus;

    async fn make_live_ledger(path: &Path) {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await.unwrap();
        sqlx::raw_sql(
            "CREATE TABLE captures (id TEXT PRIMARY KEY);
             CREATE TABLE exports_audit (id INTEGER PRIMARY KEY, capture_id TEXT REFERENCES captures(id));
             CREATE TABLE errors_log (id INTEGER PRIMARY KEY);
             CREATE TABLE sync_state (key TEXT PRIMARY KEY);",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn backup_then_verify_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("ledger.sqlite");
        make_live_ledger(&live).await;

        let hourly = dir.path().join("hourly");
        let now = DateTime::parse_from_rfc3339("2025-10-09T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let backup = create_backup(&live, &hourly, now).await.unwrap();

        let result = verify_backup(&backup.path, Some(&live), true).await.unwrap();
        assert!(result.integrity_ok);
        assert!(result.hash_match);
        assert_eq!(result.restore_test_ok, Some(true));
    }

    #[tokio::test]
    async fn missing_live_file_yields_hash_mismatch_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("ledger.sqlite");
        make_live_ledger(&live).await;
        let hourly = dir.path().join("hourly");
        let now = Utc::now();
        let backup = create_backup(&live, &hourly, now).await.unwrap();

        let result = verify_backup(&backup.path, None, false).await.unwrap();
        assert!(result.integrity_ok);
        assert!(!result.hash_match);
    }

    #[tokio::test]
    async fn daily_promotion_prefers_noon_backup() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("ledger.sqlite");
        make_live_ledger(&live).await;
        let hourly = dir.path().join("hourly");
        let daily = dir.path().join("daily");

        for hour in 0..8u32 {
            let at = DateTime::parse_from_rfc3339(&format!("2025-10-09T{hour:02}:00:00Z"))
                .unwrap()
                .with_timezone(&Utc);
            create_backup(&live, &hourly, at).await.unwrap();
        }
        let noon = DateTime::parse_from_rfc3339("2025-10-09T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        create_backup(&live, &hourly, noon).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2025, 10, 9).unwrap();
        let promoted = promote_daily(&hourly, &daily, date).await.unwrap().unwrap();
        assert_eq!(promoted.selected_reason, "noon_backup");
        assert!(promoted.path.ends_with("ledger-20251009.sqlite"));

        let again = promote_daily(&hourly, &daily, date).await.unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn pruning_keeps_newest_seven() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=10u32 {
            fs::write(dir.path().join(format!("ledger-202510{day:02}.sqlite")), b"x").unwrap();
        }
        let result = prune_daily(dir.path(), 7).unwrap();
        assert_eq!(result.deleted.len(), 3);

        let mut remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_str().unwrap().to_string())
            .collect();
        remaining.sort();
        assert_eq!(
            remaining,
            vec![
                "ledger-20251004.sqlite",
                "ledger-20251005.sqlite",
                "ledger-20251006.sqlite",
                "ledger-20251007.sqlite",
                "ledger-20251008.sqlite",
                "ledger-20251009.sqlite",
                "ledger-20251010.sqlite",
            ]
        );
    }

    #[test]
    fn escalation_reaches_halt_pruning_after_three_failures() {
        let mut state = BackupVerificationState::default();
        let t0 = Utc::now();
        for i in 0..3 {
            record_verification_outcome(&mut state, false, t0 + chrono::Duration::seconds(i));
        }
        assert_eq!(state.status, EscalationStatus::HaltPruning);
        assert_eq!(state.consecutive_failures, 3);

        record_verification_outcome(&mut state, true, t0 + chrono::Duration::seconds(10));
        assert_eq!(state.status, EscalationStatus::Healthy);
        assert_eq!(state.consecutive_failures, 0);
    }
}
