//! Process lifecycle helpers.
//!
//! The daemon writes its PID to `vest-daemon-<port>.pid` in the OS temp
//! directory once the listening socket is bound, so launchers and scripts can
//! find (and stop) the instance serving a given port.  The file is removed
//! when the [`PidFile`] guard is dropped during a clean shutdown.
//!
//! The file is written only after a successful bind, so any file already
//! present for the same port belongs to a process that is gone; it is
//! replaced.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("failed to write PID file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Removes its file on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Default location for the PID file of the instance on `port`.
    pub fn default_path(port: u16) -> PathBuf {
        std::env::temp_dir().join(format!("vest-daemon-{port}.pid"))
    }

    /// Writes the current process id to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Write`] if the file cannot be written.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, LifecycleError> {
        let path = path.into();
        if let Ok(previous) = std::fs::read_to_string(&path) {
            warn!(
                "replacing stale PID file {} (pid {})",
                path.display(),
                previous.trim()
            );
        }
        std::fs::write(&path, format!("{}\n", std::process::id())).map_err(|source| {
            LifecycleError::Write {
                path: path.clone(),
                source,
            }
        })?;
        debug!("wrote PID file {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("removed PID file {}", self.path.display()),
            Err(e) => warn!("could not remove PID file {}: {e}", self.path.display()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
