//! Computes `<vault>/inbox/<ULID>.md` and refuses anything that would
//! resolve outside the vault root (spec §4.3).

use std::fs;
use std::path::{Path, PathBuf};

use capture_bridge_hashing::is_valid_capture_id;
use capture_bridge_types::{CoreError, ErrorCode};

/// Create `<vault>/inbox/` and `<vault>/.trash/` if absent. Idempotent.
pub fn ensure_vault_dirs(vault_root: &Path) -> Result<(), CoreError> {
    for dir in [vault_root.join("inbox"), vault_root.join(".trash")] {
        fs::create_dir_all(&dir).map_err(|e| {
            CoreError::new(
                ErrorCode::FilePermissionError,
                format!("failed to create {}: {e}", dir.display()),
                true,
            )
        })?;
    }
    Ok(())
}

/// Resolve the vault-relative export path for `capture_id`, validating the
/// identifier before composition and the resolved path afterward.
pub fn resolve_capture_path(vault_root: &Path, capture_id: &str) -> Result<PathBuf, CoreError> {
    if !is_valid_capture_id(capture_id) {
        return Err(CoreError::new(
            ErrorCode::PathEscape,
            format!("not a valid capture id: {capture_id}"),
            false,
        ));
    }

    ensure_vault_dirs(vault_root)?;

    let candidate = vault_root.join("inbox").join(format!("{capture_id}.md"));

    let canonical_root = fs::canonicalize(vault_root).map_err(|e| {
        CoreError::new(
            ErrorCode::FilePermissionError,
            format!("failed to canonicalize vault root: {e}"),
            true,
        )
    })?;
    // The file itself may not exist yet; canonicalize its parent and
    // recompose, since `canonicalize` requires the path to exist.
    let canonical_parent = fs::canonicalize(candidate.parent().expect("inbox/ always has a parent"))
        .map_err(|e| {
            CoreError::new(
                ErrorCode::FilePermissionError,
                format!("failed to canonicalize inbox dir: {e}"),
                true,
            )
        })?;
    let canonical_candidate = canonical_parent.join(candidate.file_name().expect("file name set above"));

    if !canonical_candidate.starts_with(&canonical_root) {
        return Err(CoreError::new(
            ErrorCode::PathEscape,
            format!("resolved path {} escapes vault root", canonical_candidate.display()),
            false,
        ));
    }

    Ok(canonical_candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_inbox_path_for_valid_id() {
        let dir = tempfile::tempdir().unwrap();
        let id = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
        let path = resolve_capture_path(dir.path(), id).unwrap();
        assert!(path.ends_with(format!("inbox/{id}.md")));
    }

    #[test]
    fn rejects_malformed_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_capture_path(dir.path(), "not-a-ulid").unwrap_err();
        assert_eq!(err.code, ErrorCode::PathEscape);
    }

    #[test]
    fn ensure_vault_dirs_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        ensure_vault_dirs(dir.path()).unwrap();
        ensure_vault_dirs(dir.path()).unwrap();
        assert!(dir.path().join("inbox").is_dir());
        assert!(dir.path().join(".trash").is_dir());
    }
}
