//! Temp-then-rename atomic write, with directory fsync after rename
//! (spec §4.2). Either `target` ends up containing exactly `payload`, or
//! it is untouched and no temp file remains.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use capture_bridge_types::{CoreError, ErrorCode};

fn classify_io_error(err: &std::io::Error, at_rename: bool) -> CoreError {
    match err.kind() {
        ErrorKind::PermissionDenied => {
            CoreError::new(ErrorCode::Eacces, err.to_string(), true)
        }
        ErrorKind::AlreadyExists if at_rename => {
            CoreError::new(ErrorCode::Eexist, err.to_string(), true)
        }
        ErrorKind::StorageFull | ErrorKind::QuotaExceeded => {
            CoreError::new(ErrorCode::Enospc, err.to_string(), false)
        }
        ErrorKind::ReadOnlyFilesystem => {
            CoreError::new(ErrorCode::Erofs, err.to_string(), false)
        }
        _ => match err.raw_os_error() {
            Some(28) => CoreError::new(ErrorCode::Enospc, err.to_string(), false),
            Some(30) => CoreError::new(ErrorCode::Erofs, err.to_string(), false),
            Some(100) => CoreError::new(ErrorCode::Enetdown, err.to_string(), true),
            _ => CoreError::new(ErrorCode::Enetdown, err.to_string(), true),
        },
    }
}

/// Write `payload` to `target` (an absolute path already resolved and
/// validated by the Path Resolver) inside `vault_root`. `vault_root`'s
/// `.trash/` directory must share a mount with `target`'s parent.
pub fn write_atomic(vault_root: &Path, target: &Path, payload: &[u8]) -> Result<(), CoreError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| classify_io_error(&e, false))?;
    }

    let trash_dir = vault_root.join(".trash");
    fs::create_dir_all(&trash_dir).map_err(|e| classify_io_error(&e, false))?;

    let temp_name = format!(
        ".{}.tmp-{}",
        target.file_name().and_then(|n| n.to_str()).unwrap_or("capture"),
        std::process::id()
    );
    let temp_path = trash_dir.join(temp_name);

    let write_result = (|| -> Result<(), CoreError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .map_err(|e| classify_io_error(&e, false))?;
        file.write_all(payload).map_err(|e| classify_io_error(&e, false))?;
        file.sync_all().map_err(|e| classify_io_error(&e, false))?;
        Ok(())
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }

    if let Err(e) = fs::rename(&temp_path, target) {
        let _ = fs::remove_file(&temp_path);
        return Err(classify_io_error(&e, true));
    }

    if let Some(parent) = target.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_payload_and_leaves_no_temp_file() {
        let vault = tempfile::tempdir().unwrap();
        fs::create_dir_all(vault.path().join("inbox")).unwrap();
        let target = vault.path().join("inbox").join("x.md");

        write_atomic(vault.path(), &target, b"hello").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"hello");
        let trash_entries: Vec<_> = fs::read_dir(vault.path().join(".trash"))
            .unwrap()
            .collect();
        assert!(trash_entries.is_empty());
    }

    #[test]
    fn overwrite_replaces_content_atomically() {
        let vault = tempfile::tempdir().unwrap();
        fs::create_dir_all(vault.path().join("inbox")).unwrap();
        let target = vault.path().join("inbox").join("x.md");

        write_atomic(vault.path(), &target, b"first").unwrap();
        write_atomic(vault.path(), &target, b"second").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"second");
    }
}
