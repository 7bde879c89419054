//! Named byte channel: a filesystem FIFO owned by one capture session.
//!
//! The channel path is timestamp-suffixed so a crashed-and-restarted
//! session never collides with a lingering handle from its predecessor.

use std::ffi::CString;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use super::{RelayError, RelayResult};

/// One live FIFO on disk, exclusively owned by a session instance.
///
/// Dropping the channel unlinks the path as a best-effort backstop; the
/// owning session unlinks explicitly during teardown.
#[derive(Debug)]
pub struct RelayChannel {
    path: PathBuf,
}

impl RelayChannel {
    /// Builds the per-session channel path: `<dir>/<site_id>_<timestamp>.pipe`
    /// with ISO 8601 colons and dots replaced so the name is filesystem-safe.
    pub fn session_path(dir: &Path, site_id: &str) -> PathBuf {
        let timestamp = Utc::now()
            .to_rfc3339()
            .replace([':', '.'], "-");
        dir.join(format!("{site_id}_{timestamp}.pipe"))
    }

    /// Creates the FIFO, replacing any stale entry at the path.
    ///
    /// The created node is verified to actually be a FIFO; a regular file
    /// at the path would silently break the streaming contract.
    ///
    /// # Errors
    /// - `RelayError::ChannelCreation` - Directory or FIFO creation failed
    /// - `RelayError::NotAChannel` - The created node is not a FIFO
    pub fn create(dir: &Path, site_id: &str) -> RelayResult<Self> {
        std::fs::create_dir_all(dir).map_err(|source| RelayError::ChannelCreation {
            path: dir.to_path_buf(),
            source,
        })?;

        let path = Self::session_path(dir, site_id);

        if path.exists() {
            warn!("Removing stale entry at channel path: {}", path.display());
            std::fs::remove_file(&path).map_err(|source| RelayError::ChannelCreation {
                path: path.clone(),
                source,
            })?;
        }

        let c_path = CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| {
            RelayError::ChannelCreation {
                path: path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path contains interior NUL",
                ),
            }
        })?;

        // SAFETY: c_path is a valid NUL-terminated path for the lifetime of the call.
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
        if rc != 0 {
            return Err(RelayError::ChannelCreation {
                path,
                source: std::io::Error::last_os_error(),
            });
        }

        // mkfifo mode is filtered by the umask; the capture process may run
        // as a different user, so widen explicitly.
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666)).map_err(
            |source| RelayError::ChannelCreation {
                path: path.clone(),
                source,
            },
        )?;

        let channel = Self { path };
        channel.validate()?;
        debug!("Created named channel: {}", channel.path.display());
        Ok(channel)
    }

    /// Wraps an existing path without creating anything.
    pub fn from_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verifies the path exists and is a FIFO.
    ///
    /// # Errors
    /// - `RelayError::ChannelMissing` - Nothing at the path
    /// - `RelayError::NotAChannel` - The node is not a FIFO
    pub fn validate(&self) -> RelayResult<()> {
        let metadata = std::fs::metadata(&self.path).map_err(|_| RelayError::ChannelMissing {
            path: self.path.clone(),
        })?;

        if !metadata.file_type().is_fifo() {
            return Err(RelayError::NotAChannel {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    /// Removes the FIFO from disk. Idempotent: a missing path is not an
    /// error, so double-unlink during overlapping teardowns is harmless.
    pub fn unlink(&self) -> RelayResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Unlinked channel: {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RelayError::Io {
                operation: format!("unlink {}", self.path.display()),
                source,
            }),
        }
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        // Best-effort: the path is unique to this session instance, so a
        // late drop can never remove a successor's channel.
        if self.path.exists() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_produces_a_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let channel = RelayChannel::create(dir.path(), "arena").unwrap();

        let metadata = std::fs::metadata(channel.path()).unwrap();
        assert!(metadata.file_type().is_fifo());
        assert!(channel.validate().is_ok());
    }

    #[test]
    fn session_path_is_unique_and_safe() {
        let dir = Path::new("/tmp/pipes");
        let path = RelayChannel::session_path(dir, "arena");
        let name = path.file_name().unwrap().to_str().unwrap();

        assert!(name.starts_with("arena_"));
        assert!(name.ends_with(".pipe"));
        assert!(!name.contains(':'));
    }

    #[test]
    fn validate_rejects_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_pipe.pipe");
        std::fs::write(&path, b"regular file").unwrap();

        let channel = RelayChannel::from_path(path);
        assert!(matches!(
            channel.validate(),
            Err(RelayError::NotAChannel { .. })
        ));
    }

    #[test]
    fn validate_reports_missing_channel() {
        let channel = RelayChannel::from_path(PathBuf::from("/nonexistent/missing.pipe"));
        assert!(matches!(
            channel.validate(),
            Err(RelayError::ChannelMissing { .. })
        ));
    }

    #[test]
    fn unlink_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let channel = RelayChannel::create(dir.path(), "arena").unwrap();

        channel.unlink().unwrap();
        assert!(!channel.path().exists());
        // Second unlink sees nothing at the path and succeeds.
        channel.unlink().unwrap();
    }

    #[test]
    fn drop_removes_leftover_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let channel = RelayChannel::create(dir.path(), "arena").unwrap();
            channel.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
