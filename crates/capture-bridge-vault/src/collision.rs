//! Filesystem-first collision detection (spec §4.4). Never trusts a
//! stale ledger: the decision is derived from a stat + open + hash of
//! the file currently on disk.

use std::fs;
use std::path::Path;

use capture_bridge_hashing::hash;
use capture_bridge_types::{CoreError, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionDecision {
    /// No file, no prior audit row: proceed as a first export.
    Initial,
    /// No file, but a matching audit row exists: re-export.
    SelfHeal,
    /// File present with a matching hash: skip the write, still audit.
    DuplicateSkip,
    /// File present with a different hash: refuse to overwrite.
    Conflict,
}

/// Decide how to export `expected_content_hash` to `target_path`.
/// `has_prior_audit_row` reflects whether an `exports_audit` row already
/// exists for this capture (passed in by the caller, since only the
/// caller has a ledger handle).
pub fn detect_collision(
    target_path: &Path,
    expected_content_hash: &str,
    has_prior_audit_row: bool,
) -> Result<CollisionDecision, CoreError> {
    if !target_path.exists() {
        return Ok(if has_prior_audit_row {
            CollisionDecision::SelfHeal
        } else {
            CollisionDecision::Initial
        });
    }

    let bytes = fs::read(target_path).map_err(|e| {
        CoreError::new(ErrorCode::Eacces, format!("failed to read {}: {e}", target_path.display()), true)
    })?;
    let on_disk_hash = hash(&String::from_utf8_lossy(&bytes));

    if on_disk_hash == expected_content_hash {
        Ok(CollisionDecision::DuplicateSkip)
    } else {
        Ok(CollisionDecision::Conflict)
    }
}
