//! Filesystem helpers for destination files
//!
//! Piece workers each open their own handle on the destination file and
//! write only inside their own byte range, so none of this needs locking.

use crate::error::SegdlError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tracing::{debug, warn};

/// Open the destination for random-access writes, creating it if missing.
///
/// Existing content is never truncated.
pub async fn open_for_pieces(path: &Path) -> Result<File, SegdlError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .await?;
    Ok(file)
}

/// Free bytes available to unprivileged users on the filesystem holding `dir`
#[cfg(unix)]
pub fn free_space(dir: &Path) -> Result<u64, SegdlError> {
    use nix::sys::statvfs::statvfs;

    let stats = statvfs(dir).map_err(std::io::Error::from)?;
    Ok(stats.blocks_available() as u64 * stats.fragment_size() as u64)
}

#[cfg(not(unix))]
pub fn free_space(_dir: &Path) -> Result<u64, SegdlError> {
    Ok(u64::MAX)
}

/// Nearest existing ancestor of `path`, used for free-space queries before
/// the destination directory exists
pub fn existing_ancestor(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| p.exists())
}

/// Best-effort reservation of `len` bytes; the file is only ever extended
pub async fn preallocate(file: &File, len: u64) -> Result<(), SegdlError> {
    let current = file.metadata().await?.len();
    if current < len {
        file.set_len(len).await?;
        debug!("Preallocated {} bytes", len);
    }
    Ok(())
}

/// Truncate (or extend) the file to exactly `len` bytes
pub async fn truncate(path: &Path, len: u64) -> Result<(), SegdlError> {
    match OpenOptions::new().write(true).open(path).await {
        Ok(file) => {
            file.set_len(len).await?;
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Delete a file; a missing file is not an error
pub async fn delete_file(path: &Path) -> Result<(), SegdlError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Move `from` to `to`, refusing to overwrite an existing target.
///
/// Falls back to copy + remove when a rename is not possible (e.g. across
/// filesystems). A missing source is not an error.
pub async fn move_file(from: &Path, to: &Path) -> Result<(), SegdlError> {
    if from == to {
        return Ok(());
    }
    if fs::try_exists(to).await? {
        return Err(SegdlError::FileExists(to.display().to_string()));
    }
    if !fs::try_exists(from).await? {
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }

    if let Err(e) = fs::rename(from, to).await {
        warn!("Rename {:?} -> {:?} failed ({}), copying instead", from, to, e);
        fs::copy(from, to).await?;
        fs::remove_file(from).await?;
    }
    Ok(())
}

/// `name` if free in `dir`, otherwise `name (1).ext`, `name (2).ext`, ...
pub fn unique_name(dir: &Path, name: &str) -> String {
    if !dir.join(name).exists() {
        return name.to_string();
    }
    let path = PathBuf::from(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (1..)
        .map(|n| format!("{} ({}){}", stem, n, ext))
        .find(|candidate| !dir.join(candidate).exists())
        .unwrap_or_else(|| name.to_string())
}
