//! PTY allocation, window-size propagation, and prism spawning.
//!
//! The controller holds the master end of every child PTY; the prism runs
//! with the slave as its controlling terminal. Masters close when their
//! `OwnedFd` drops — there is no separate close call — and the slave is
//! owned by the child process once spawned.
//!
//! Window sizes always flow from the real PTY: once at child creation and
//! again to every child on SIGWINCH.

// Rust guideline compliant 2026-02

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use nix::pty::openpty;

/// A freshly allocated PTY pair.
///
/// The master stays with the controller; the slave is handed to the child
/// and dropped on the controller side after spawn.
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a pseudo-terminal pair.
///
/// Both ends get `FD_CLOEXEC` so a spawned child only ever sees the slave
/// that was explicitly dup'd onto its stdio.
pub fn allocate() -> Result<PtyPair> {
    let pty = openpty(None, None).context("Failed to open PTY pair")?;
    set_cloexec(pty.master.as_raw_fd())?;
    set_cloexec(pty.slave.as_raw_fd())?;
    Ok(PtyPair {
        master: pty.master,
        slave: pty.slave,
    })
}

/// Read the window size of `fd`.
///
/// # Errors
///
/// Fails with `ENOTTY` when `fd` is not a terminal.
pub fn window_size(fd: RawFd) -> Result<libc::winsize> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
    if rc < 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("TIOCGWINSZ failed on fd {fd}"));
    }
    Ok(ws)
}

/// Set the window size of `fd`.
pub fn set_window_size(fd: RawFd, ws: &libc::winsize) -> Result<()> {
    let rc = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, ws) };
    if rc < 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("TIOCSWINSZ failed on fd {fd}"));
    }
    Ok(())
}

/// Copy the window size of `src` onto `dst`. Fails if either fd is not a
/// terminal.
pub fn sync_size(src: RawFd, dst: RawFd) -> Result<()> {
    let ws = window_size(src)?;
    set_window_size(dst, &ws)
}

/// Duplicate `fd` into a fresh non-blocking, close-on-exec descriptor.
///
/// Mirror tasks wrap the duplicate in an `AsyncFd`; duplicating keeps
/// reactor registrations distinct across swaps while the MRU entry retains
/// ownership of the original master.
pub fn dup_nonblocking(fd: BorrowedFd<'_>) -> Result<OwnedFd> {
    let raw = unsafe { libc::dup(fd.as_raw_fd()) };
    if raw < 0 {
        return Err(io::Error::last_os_error()).context("dup failed");
    }
    let owned = unsafe { OwnedFd::from_raw_fd(raw) };
    set_cloexec(raw)?;
    set_nonblocking(raw)?;
    Ok(owned)
}

/// Set `O_NONBLOCK` on `fd`.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error()).context("F_GETFL failed");
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("F_SETFL failed");
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("F_SETFD failed");
    }
    Ok(())
}

/// Non-blocking-aware read. `WouldBlock` surfaces as an `io::Error` for
/// the caller's `AsyncFd::try_io` to interpret.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Non-blocking-aware write.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Fork/exec a prism with `slave` as its controlling terminal.
///
/// The child gets a new session (`setsid`) and claims the slave via
/// `TIOCSCTTY` before exec; stdio is the slave on all three fds. The
/// environment (including `TERM`) is inherited. Returns the child pid —
/// the caller never waits on the handle; reaping happens exclusively
/// through the SIGCHLD drain.
pub fn spawn_prism(path: &Path, args: &[String], slave: OwnedFd) -> Result<i32> {
    let stdin = slave
        .try_clone()
        .context("Failed to clone slave for stdin")?;
    let stdout = slave
        .try_clone()
        .context("Failed to clone slave for stdout")?;

    let mut cmd = Command::new(path);
    cmd.args(args)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(slave));

    // Safety: setsid and ioctl are async-signal-safe; the closure runs
    // between fork and exec after stdio has been dup'd onto 0/1/2.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn prism: {}", path.display()))?;
    let pid = child.id() as i32;

    // Drop the handle without waiting; dropping a Child does not reap.
    drop(child);

    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn test_allocate_returns_distinct_fds() {
        let pair = allocate().unwrap();
        assert!(pair.master.as_raw_fd() >= 0);
        assert!(pair.slave.as_raw_fd() >= 0);
        assert_ne!(pair.master.as_raw_fd(), pair.slave.as_raw_fd());
    }

    #[test]
    fn test_master_write_slave_read() {
        let pair = allocate().unwrap();

        let data = b"test data\n";
        let n = write_fd(pair.master.as_raw_fd(), data).unwrap();
        assert_eq!(n, data.len());

        let mut buf = [0u8; 32];
        let n = read_fd(pair.slave.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], data);
    }

    #[test]
    fn test_slave_write_master_read() {
        let pair = allocate().unwrap();

        // The line discipline may convert \n to \r\n on the way out.
        let data = b"reverse test";
        write_fd(pair.slave.as_raw_fd(), data).unwrap();

        let mut buf = [0u8; 32];
        let n = read_fd(pair.master.as_raw_fd(), &mut buf).unwrap();
        assert!(n >= data.len());
        assert_eq!(&buf[..data.len()], data);
    }

    #[test]
    fn test_sync_size_copies_dimensions() {
        let src = allocate().unwrap();
        let dst = allocate().unwrap();

        let ws = libc::winsize {
            ws_row: 50,
            ws_col: 120,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        set_window_size(src.master.as_raw_fd(), &ws).unwrap();

        sync_size(src.master.as_raw_fd(), dst.master.as_raw_fd()).unwrap();

        let got = window_size(dst.master.as_raw_fd()).unwrap();
        assert_eq!(got.ws_row, 50);
        assert_eq!(got.ws_col, 120);
    }

    #[test]
    fn test_sync_size_rejects_invalid_fds() {
        let pair = allocate().unwrap();
        assert!(sync_size(-1, pair.master.as_raw_fd()).is_err());
        assert!(sync_size(pair.master.as_raw_fd(), -1).is_err());
        assert!(sync_size(-1, -1).is_err());
    }

    #[test]
    fn test_window_size_rejects_regular_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        assert!(window_size(tmp.as_file().as_raw_fd()).is_err());
    }

    #[test]
    fn test_dup_nonblocking_is_independent() {
        let pair = allocate().unwrap();
        let dup = dup_nonblocking(pair.master.as_fd()).unwrap();
        assert_ne!(dup.as_raw_fd(), pair.master.as_raw_fd());

        // Non-blocking read on the dup with nothing buffered -> WouldBlock.
        let mut buf = [0u8; 8];
        let err = read_fd(dup.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        // Data written to the slave is readable through the dup.
        write_fd(pair.slave.as_raw_fd(), b"x").unwrap();
        let n = read_fd(dup.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"x");
    }

    #[test]
    fn test_spawn_prism_runs_on_slave_tty() {
        let pair = allocate().unwrap();

        // `tty` prints its controlling terminal and exits 0 only on a tty.
        let pid = spawn_prism(Path::new("/bin/sh"), &["-c".into(), "tty".into()], pair.slave)
            .unwrap();
        assert!(pid > 0);

        let mut buf = [0u8; 128];
        let mut out = Vec::new();
        // Read until EOF/EIO (child exited and released the slave).
        loop {
            match read_fd(pair.master.as_raw_fd(), &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
            }
        }
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("/dev/pts/") || text.contains("/dev/tty"), "got: {text}");

        // Reap so the test binary doesn't accumulate zombies.
        unsafe { libc::waitpid(pid, std::ptr::null_mut(), 0) };
    }

    #[test]
    fn test_spawn_prism_missing_binary_fails() {
        let pair = allocate().unwrap();
        let result = spawn_prism(Path::new("/nonexistent/prism"), &[], pair.slave);
        assert!(result.is_err());
    }

    #[test]
    fn test_spawn_inherits_term() {
        // Spawn via the same pre_exec dance and confirm TERM passes through.
        let pair = allocate().unwrap();
        std::env::set_var("TERM", "xterm-shine-test");

        let pid = spawn_prism(
            Path::new("/bin/sh"),
            &["-c".into(), "printf %s \"$TERM\"".into()],
            pair.slave,
        )
        .unwrap();

        let mut buf = [0u8; 128];
        let mut out = Vec::new();
        loop {
            match read_fd(pair.master.as_raw_fd(), &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
            }
        }
        assert!(String::from_utf8_lossy(&out).contains("xterm-shine-test"));

        unsafe { libc::waitpid(pid, std::ptr::null_mut(), 0) };
    }
}
