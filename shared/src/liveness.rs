use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::trace;

use crate::protocol::APP_NAME;

/// Check `pid` against the default application identity.
pub fn is_live(pid: i64) -> bool {
    ProcessIdentity::default().is_live(pid)
}

/// The image name a live service process must carry. The OS may reuse a
/// crashed service's pid, so a bare pid check is not enough.
#[derive(Debug, Clone)]
pub struct ProcessIdentity {
    name: String,
}

impl Default for ProcessIdentity {
    fn default() -> Self {
        Self::new(APP_NAME)
    }
}

impl ProcessIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into().to_lowercase() }
    }

    /// Returns true only when `pid` names a running process that looks like
    /// this application. Never fails: "gone", "not ours" and "not allowed to
    /// look" all answer false.
    pub fn is_live(&self, pid: i64) -> bool {
        if pid <= 0 {
            return false;
        }
        let Ok(pid) = u32::try_from(pid) else {
            return false;
        };

        if !process_exists(pid) {
            trace!("Process {} does not exist", pid);
            return false;
        }

        match image_names(pid) {
            Some(names) => {
                let matched = names.iter().any(|n| n.to_lowercase().contains(&self.name));
                if !matched {
                    trace!("Process {} ({:?}) is not {}", pid, names, self.name);
                }
                matched
            }
            None => {
                // Metadata unavailable: treat as not ours
                trace!("Cannot query process info for PID {}, rejecting", pid);
                false
            }
        }
    }
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid as NixPid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks for existence; EPERM counts as "not ours"
    kill(NixPid::from_raw(raw), None).is_ok()
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    // No cheap probe here; the sysinfo lookup below decides
    true
}

/// Executable file name and process name for `pid`, if the OS lets us see them.
fn image_names(pid: u32) -> Option<Vec<String>> {
    let mut sys = System::new();
    let sysinfo_pid = Pid::from_u32(pid);
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sysinfo_pid]),
        true,
        ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet),
    );
    let process = sys.process(sysinfo_pid)?;

    let mut names = Vec::with_capacity(2);
    if let Some(file_name) = process.exe().and_then(|exe| exe.file_name()) {
        names.push(file_name.to_string_lossy().into_owned());
    }
    let process_name = process.name().to_string_lossy().into_owned();
    if !process_name.is_empty() {
        names.push(process_name);
    }

    if names.is_empty() {
        None
    } else {
        Some(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_positive_pids_are_never_live() {
        assert!(!is_live(0));
        assert!(!is_live(-1));
        assert!(!is_live(i64::MIN));
    }

    #[test]
    fn test_unallocated_pid_is_not_live() {
        assert!(!is_live(999_999_999));
        assert!(!is_live(i64::from(u32::MAX) + 1));
    }

    #[test]
    fn test_own_process_matches_own_image_name() {
        let exe = std::env::current_exe().unwrap();
        let stem = exe.file_stem().unwrap().to_string_lossy().into_owned();
        let identity = ProcessIdentity::new(stem);
        assert!(identity.is_live(i64::from(std::process::id())));
    }

    #[test]
    fn test_live_pid_with_other_identity_is_rejected() {
        let identity = ProcessIdentity::new("definitely-not-this-test-binary");
        assert!(!identity.is_live(i64::from(std::process::id())));
    }
}
