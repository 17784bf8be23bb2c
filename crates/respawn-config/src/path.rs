//! Path helpers for substitute targets.
//!
//! `execve` does not search `PATH`, so a substitute target is used exactly as
//! written. These helpers let host code check and pin a target before it is
//! exported to a shimmed process.

use anyhow::{Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Resolve a substitute target to an absolute, symlink-free path.
///
/// A relative target would otherwise be resolved against whatever working
/// directory the intercepted caller happens to have.
pub fn normalize_target(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    path.canonicalize()
        .with_context(|| format!("Failed to resolve substitute target: {}", path.display()))
}

/// True when `path` is a regular file with at least one execute bit set.
pub fn is_executable(path: impl AsRef<Path>) -> bool {
    match std::fs::metadata(path.as_ref()) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Look `name` up in a `PATH`-style list, the way a shell would.
///
/// Names containing a `/` are returned unchanged if executable.
pub fn find_executable(name: &str, search_path: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let candidate = PathBuf::from(name);
        return is_executable(&candidate).then_some(candidate);
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| is_executable(candidate))
}
