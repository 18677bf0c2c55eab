//! Unix socket helpers shared by the control and feed listeners.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::net::UnixListener;
use tracing::debug;

/// Bind a listener at `path`, creating the parent directory and replacing a
/// stale socket file. The socket is left readable and writable by its owner
/// only.
///
/// # Errors
///
/// Fails when the directory cannot be created, a stale file cannot be
/// removed, or the socket cannot be bound.
pub fn bind_owner_only(path: &Path) -> std::io::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}
