use std::path::Path;

/// Deletes a scratch file if present. A missing file is not an error: every
/// exit path (upload success, permanent failure, shutdown drop, cancellation)
/// calls this so cleanup is safe to invoke more than once for the same path.
pub fn delete(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(target: "recorder", "removed {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(target: "recorder", "failed to remove {}: {err}", path.display()),
    }
}

/// Removes every regular file directly inside `dir`, ignoring subdirectories.
/// Run once at startup to clear clips orphaned by an unclean prior shutdown.
pub fn sweep(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
        Err(err) => {
            tracing::warn!(target: "recorder", "could not sweep scratch dir {}: {err}", dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            delete(&path);
        }
    }
}
