//! Runtime and log directory resolution.
//!
//! All per-panel sockets and state files live under a per-user runtime
//! directory:
//!
//! ```text
//! ${XDG_RUNTIME_DIR or /run/user/<uid>}/shine/
//!   prism-<instance>.sock    # panel controller IPC socket
//!   prism-<instance>.state   # panel controller mmap state region
//!   shined.sock              # supervisor JSON-RPC socket
//!   shined.state             # supervisor mmap state region
//! ```
//!
//! Logs go to `~/.local/share/shine/logs/` so PTY traffic on stdout is
//! never polluted by log output.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Get the per-user runtime directory, creating it if needed.
///
/// Honors `XDG_RUNTIME_DIR` when set, falling back to `/run/user/<uid>`.
/// Tests can override the whole tree with `SHINE_RUNTIME_DIR`.
pub fn runtime_dir() -> Result<PathBuf> {
    let base = if let Ok(dir) = std::env::var("SHINE_RUNTIME_DIR") {
        PathBuf::from(dir)
    } else if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(dir).join("shine")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/run/user/{uid}")).join("shine")
    };

    if !base.exists() {
        // Restrictive umask before mkdir to avoid a TOCTOU race between
        // mkdir and chmod on a shared parent.
        let old_umask = unsafe { libc::umask(0o077) };
        let result = fs::create_dir_all(&base);
        unsafe {
            libc::umask(old_umask);
        }
        result.with_context(|| format!("Failed to create runtime directory: {}", base.display()))?;
    }
    Ok(base)
}

/// Unix socket path for a panel controller instance.
pub fn prism_socket(instance: &str) -> Result<PathBuf> {
    Ok(runtime_dir()?.join(format!("prism-{instance}.sock")))
}

/// Mmap state file path for a panel controller instance.
pub fn prism_state(instance: &str) -> Result<PathBuf> {
    Ok(runtime_dir()?.join(format!("prism-{instance}.state")))
}

/// Unix socket path for the supervisor daemon.
pub fn shined_socket() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("shined.sock"))
}

/// Mmap state file path for the supervisor daemon.
pub fn shined_state() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("shined.state"))
}

/// Log directory, created on first use.
pub fn log_dir() -> Result<PathBuf> {
    let dir = if let Ok(d) = std::env::var("SHINE_LOG_DIR") {
        PathBuf::from(d)
    } else {
        dirs::home_dir()
            .context("No home directory")?
            .join(".local")
            .join("share")
            .join("shine")
            .join("logs")
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    Ok(dir)
}

/// Check whether a process is alive via `kill(pid, 0)`.
///
/// Sends no signal; only probes for existence.
pub fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Remove runtime files left behind by a crashed controller.
///
/// A fresh controller with the same instance name overwrites the state
/// region anyway, but a stale socket would make `bind` fail with
/// `EADDRINUSE`. Safe to call when the files don't exist.
pub fn remove_stale_panel_files(instance: &str) {
    for path in [prism_socket(instance), prism_state(instance)]
        .into_iter()
        .flatten()
    {
        if path.exists() && fs::remove_file(&path).is_ok() {
            log::debug!("Removed stale runtime file: {}", path.display());
        }
    }
}
