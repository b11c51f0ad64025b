//! Shared filesystem helpers.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Temp file next to `path`, unique per call.
pub(crate) fn sibling_temp_path(path: &Path) -> io::Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    Ok(parent.join(format!(".{}.{}.tmp", name.trim_start_matches('.'), Uuid::new_v4())))
}

/// Write `content` to a fresh temp file beside `path` and sync it.
pub(crate) fn write_temp_sibling(path: &Path, content: &[u8]) -> io::Result<PathBuf> {
    let temp_path = sibling_temp_path(path)?;
    let result = (|| {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()
    })();
    match result {
        Ok(()) => Ok(temp_path),
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            Err(e)
        }
    }
}

/// Replace `path` with `content` in a single rename.
///
/// Readers observe either the old or the new contents, never a mix.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let temp_path = write_temp_sibling(path, content)?;
    fs::rename(&temp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&temp_path);
    })
}

/// Create `path` with `content` only if it does not exist yet.
///
/// The contents are complete before the name becomes visible: the data is
/// written to a temp file and hard-linked into place, and the link fails
/// with `AlreadyExists` if another process got there first.
pub fn create_exclusive(path: &Path, content: &[u8]) -> io::Result<()> {
    let temp_path = write_temp_sibling(path, content)?;
    let linked = fs::hard_link(&temp_path, path);
    let _ = fs::remove_file(&temp_path);
    linked
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
