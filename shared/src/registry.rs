use std::io::Write;
use std::path::{Path, PathBuf};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::liveness::ProcessIdentity;
use crate::protocol::{self, REGISTRY_FILE};
use crate::types::ServiceDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("could not determine a per-user state directory")]
    NoStateDir,

    #[error("registry file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Result of a full discovery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    Running(ServiceDescriptor),
    NotRunning,
}

/// `server.json` in the state directory. Only the service writes it.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    path: PathBuf,
    identity: ProcessIdentity,
}

impl ServiceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            identity: ProcessIdentity::default(),
        }
    }

    /// Registry at `<dir>/server.json`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(REGISTRY_FILE))
    }

    /// Registry at the per-user default location
    pub fn default_location() -> Result<Self, RegistryError> {
        let dir = protocol::state_dir().ok_or(RegistryError::NoStateDir)?;
        Ok(Self::in_dir(dir))
    }

    /// Use a different identity when judging whether a recorded pid is live.
    pub fn with_identity(mut self, identity: ProcessIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the current process as the service listening on `port`.
    pub fn write(&self, port: u16) -> Result<ServiceDescriptor, RegistryError> {
        let descriptor = ServiceDescriptor {
            address: protocol::local_address(port),
            port,
            pid: i64::from(std::process::id()),
            started_at: Utc::now(),
        };
        self.write_descriptor(&descriptor)?;
        Ok(descriptor)
    }

    /// Atomically replace the registry file with `descriptor`. The file is
    /// created owner-only and renamed into place, so readers never observe a
    /// partial write.
    pub fn write_descriptor(&self, descriptor: &ServiceDescriptor) -> Result<(), RegistryError> {
        let io_err = |source| RegistryError::Io { path: self.path.clone(), source };

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(io_err)?;

        let json = serde_json::to_vec_pretty(descriptor)
            .map_err(|source| RegistryError::Corrupt { path: self.path.clone(), source })?;

        // NamedTempFile is created 0600 on unix
        let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        restrict_to_owner(tmp.path()).map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;

        debug!("Wrote registry entry {:?} to {}", descriptor, self.path.display());
        Ok(())
    }

    /// Read the registry. An absent file is `Ok(None)`, the normal first-run case.
    pub fn read(&self) -> Result<Option<ServiceDescriptor>, RegistryError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(RegistryError::Io { path: self.path.clone(), source }),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| RegistryError::Corrupt { path: self.path.clone(), source })
    }

    /// Delete the registry file.
    ///
    /// Best effort: this runs on shutdown and cleanup paths where nobody can
    /// act on a failure, so errors are logged and dropped rather than returned.
    pub fn remove(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed registry entry {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove registry entry {}: {}", self.path.display(), e),
        }
    }

    /// Remove the entry only if it still names `pid`. A service shutting down
    /// must not delete an entry a newer instance has since written.
    pub fn remove_if_owned(&self, pid: i64) {
        match self.read() {
            Ok(Some(descriptor)) if descriptor.pid != pid => {
                debug!("Registry entry belongs to pid {}, leaving it", descriptor.pid);
            }
            _ => self.remove(),
        }
    }

    /// Read the registry and verify the recorded process. Stale or corrupt
    /// entries are deleted on the spot so the next reader does not repeat the work.
    pub fn discover(&self) -> Discovery {
        match self.read() {
            Ok(None) => Discovery::NotRunning,
            Ok(Some(descriptor)) => {
                if self.identity.is_live(descriptor.pid) {
                    Discovery::Running(descriptor)
                } else {
                    info!("Removing stale registry entry for pid {}", descriptor.pid);
                    self.remove();
                    Discovery::NotRunning
                }
            }
            Err(RegistryError::Corrupt { path, source }) => {
                warn!("Removing corrupt registry entry {}: {}", path.display(), source);
                self.remove();
                Discovery::NotRunning
            }
            Err(e) => {
                warn!("Failed to read registry: {}", e);
                Discovery::NotRunning
            }
        }
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own_identity() -> ProcessIdentity {
        let exe = std::env::current_exe().unwrap();
        ProcessIdentity::new(exe.file_stem().unwrap().to_string_lossy().into_owned())
    }

    #[test]
    fn test_read_absent_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::in_dir(dir.path());
        assert!(registry.read().unwrap().is_none());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::in_dir(dir.path().join("nested").join("state"));

        let written = registry.write(47311).unwrap();
        assert_eq!(written.address, "localhost:47311");
        assert_eq!(written.pid, i64::from(std::process::id()));

        let read = registry.read().unwrap().unwrap();
        assert_eq!(read, written);
    }

    #[cfg(unix)]
    #[test]
    fn test_registry_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::in_dir(dir.path());
        registry.write(47312).unwrap();

        let mode = std::fs::metadata(registry.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_remove_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::in_dir(dir.path());
        registry.remove();
        registry.write(47313).unwrap();
        registry.remove();
        assert!(!registry.path().exists());
        registry.remove();
    }

    #[test]
    fn test_discover_removes_entry_with_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::in_dir(dir.path());
        registry
            .write_descriptor(&ServiceDescriptor {
                address: "localhost:47314".to_string(),
                port: 47314,
                pid: 999_999_999,
                started_at: Utc::now(),
            })
            .unwrap();

        assert_eq!(registry.discover(), Discovery::NotRunning);
        assert!(!registry.path().exists(), "stale entry should be deleted");
    }

    #[test]
    fn test_discover_rejects_live_pid_of_other_program() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::in_dir(dir.path())
            .with_identity(ProcessIdentity::new("some-other-daemon"));
        registry.write(47315).unwrap();

        assert_eq!(registry.discover(), Discovery::NotRunning);
        assert!(!registry.path().exists());
    }

    #[test]
    fn test_discover_keeps_live_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::in_dir(dir.path()).with_identity(own_identity());
        let written = registry.write(47316).unwrap();

        assert_eq!(registry.discover(), Discovery::Running(written));
        assert!(registry.path().exists());
    }

    #[test]
    fn test_discover_removes_corrupt_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::in_dir(dir.path());
        std::fs::write(registry.path(), b"{not json").unwrap();

        assert!(matches!(registry.read(), Err(RegistryError::Corrupt { .. })));
        assert_eq!(registry.discover(), Discovery::NotRunning);
        assert!(!registry.path().exists());
    }

    #[test]
    fn test_remove_if_owned_keeps_newer_instance() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::in_dir(dir.path());
        registry.write(47317).unwrap();

        registry.remove_if_owned(1);
        assert!(registry.path().exists());

        registry.remove_if_owned(i64::from(std::process::id()));
        assert!(!registry.path().exists());
    }
}
