//! Local socket placement for kernels listening on a Unix socket

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const SOCKET_ENV: &str = "ANVIL_SOCKET";

/// Default socket a local kernel listens on and plugins connect to.
///
/// `ANVIL_SOCKET` wins; otherwise `anvil/kernel.sock` under the user runtime
/// directory, falling back to `/tmp`.
pub fn socket_path() -> PathBuf {
    resolve_socket_path(std::env::var(SOCKET_ENV).ok(), dirs::runtime_dir())
}

fn resolve_socket_path(explicit: Option<String>, runtime_dir: Option<PathBuf>) -> PathBuf {
    match explicit.filter(|p| !p.trim().is_empty()) {
        Some(path) => PathBuf::from(path),
        None => runtime_dir
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("anvil")
            .join("kernel.sock"),
    }
}

/// Get `path` ready to be bound: drop a stale socket file and create the
/// parent directory.
pub fn prepare_socket(path: &Path) -> io::Result<()> {
    remove_socket(path)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Remove a socket file. Returns false if there was nothing to remove.
pub fn remove_socket(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
