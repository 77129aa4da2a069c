//! Small process-introspection helpers shared across the workspace.
//!
//! The relay needs to know which files its external consumer process holds
//! open, which is only observable on Linux through `/proc/<pid>/fd`; on
//! other targets [`open_paths`] reports nothing and callers must fall back
//! to a log-based observer.

use std::ffi::OsStr;
use std::io;
use std::path::PathBuf;

/// Enumerate the regular-file paths a process currently has open.
///
/// Reads the `/proc/<pid>/fd` symlink table. Pipes, sockets and deleted
/// files are skipped. Returns an empty list on non-Linux targets.
///
/// The snapshot is inherently racy: a descriptor can close between the
/// directory read and the link resolution, so missing entries are normal
/// and not an error.
pub fn open_paths(pid: u32) -> io::Result<Vec<PathBuf>> {
    #[cfg(target_os = "linux")]
    {
        let fd_dir = PathBuf::from(format!("/proc/{pid}/fd"));
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(fd_dir)? {
            let Ok(entry) = entry else { continue };
            let Ok(target) = std::fs::read_link(entry.path()) else {
                continue;
            };
            // Anonymous descriptors resolve to "pipe:[n]", "socket:[n]", etc.
            if target.is_absolute() && !target.to_string_lossy().ends_with(" (deleted)") {
                paths.push(target);
            }
        }
        Ok(paths)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        Ok(Vec::new())
    }
}

/// Create a `tokio::process::Command` with stdout/stderr piped and
/// `kill_on_drop` set, the shape every consumer spawn in the workspace
/// wants: piped output feeds the log-tail playback observer, and
/// `kill_on_drop` keeps an abandoned child from outliving a crashed
/// supervisor task.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    cmd
}
