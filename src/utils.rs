//! Shared utility functions for the ssmanager daemon.

use std::io;
use std::path::Path;

/// Remove a Unix socket file left behind by a bound endpoint.
///
/// Absence is not an error; any other failure is logged and ignored.
pub fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed socket file {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove socket file {:?}: {}", path, e),
    }
}
