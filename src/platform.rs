//! Platform helpers for agentdeck
//!
//! - Home and config directory paths
//! - Process liveness probes and termination
//! - Display-name extraction from working directories

use std::path::{Path, PathBuf};

/// Get the user's home directory in a cross-platform way.
pub fn home_dir() -> Option<PathBuf> {
    dirs_next::home_dir()
}

/// Get the agentdeck config directory (`~/.agentdeck`).
///
/// A dot-prefix directory is used on every platform so paths stay predictable
/// for the hook command that agents invoke.
pub fn config_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agentdeck")
}

/// Check if a process is still alive.
///
/// `kill(pid, 0)` delivers no signal; it only reports whether the pid exists.
/// EPERM means the process exists but belongs to someone else.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    // Conservative default - assume alive
    true
}

/// Send SIGTERM to a process.
///
/// Returns true when the process is gone or the signal was delivered. A pid
/// that already exited (ESRCH) counts as success: the desired end state holds.
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if pid <= 1 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(Errno::ESRCH) => {
            tracing::debug!("Process {} already exited before SIGTERM", pid);
            true
        }
        Err(e) => {
            tracing::warn!("Failed to signal process {}: {}", pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
pub fn terminate_process(_pid: u32) -> bool {
    false
}

/// Extract the last component from a path string, handling both
/// forward slashes and backslashes.
pub fn extract_path_basename(path: &str) -> &str {
    path.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
}

/// Display name for a session rooted at `dir`.
pub fn display_name_for(dir: &Path) -> String {
    let raw = dir.to_string_lossy();
    let name = extract_path_basename(&raw);
    if name.is_empty() {
        raw.to_string()
    } else {
        name.to_string()
    }
}
