//! Reclamation of shared memory artifacts left behind by a crashed instance.
//!
//! The storage engine names its POSIX shared memory and semaphore objects
//! after a sanitized form of the application identity. Those objects outlive
//! the creating process, so a crash leaves them in the shared memory
//! directory (`/dev/shm` on Linux) where a restarted instance would pick
//! them up again. [`reclaim`] removes them before the session is set up.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Derive the shared memory name token for an application identity.
///
/// Every byte that is not an ASCII letter or digit becomes `_`. The
/// transformation is byte-wise, so the token has exactly as many bytes as
/// the identity. The storage engine uses the same scheme when it creates
/// its named objects.
pub fn shm_token(app: &str) -> String {
    let mut token = String::with_capacity(app.len());
    token.extend(app.bytes().map(|b| {
        if b.is_ascii_alphanumeric() {
            char::from(b)
        } else {
            '_'
        }
    }));
    token
}

/// Remove every entry of `base_dir` whose name contains the application's
/// shared memory token.
///
/// Best effort: enumeration and deletion failures are logged and skipped.
/// Returns the paths that were removed.
pub fn reclaim(base_dir: &Path, app: &str) -> Vec<PathBuf> {
    let token = shm_token(app);
    let mut removed = Vec::new();

    // An empty token is a substring of every name.
    if token.is_empty() {
        warn!("Skipping artifact reclamation for empty application identity");
        return removed;
    }

    let entries = match std::fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(
                "Cannot scan {} for stale artifacts: {e}",
                base_dir.display()
            );
            return removed;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to read entry in {}: {e}", base_dir.display());
                continue;
            }
        };

        let name = entry.file_name();
        if !name.to_string_lossy().contains(&token) {
            continue;
        }

        let path = entry.path();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                warn!("Removed stale shared memory artifact: {}", path.display());
                removed.push(path);
            }
            Err(e) => {
                warn!("Failed to remove stale artifact {}: {e}", path.display());
            }
        }
    }

    debug!(
        "Artifact reclamation for token {token} removed {} entries",
        removed.len()
    );
    removed
}
