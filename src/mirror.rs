//! Bidirectional I/O mirroring between the real PTY and the foreground
//! prism's PTY master.
//!
//! An active mirror owns two copy tasks:
//!
//! - **up-stream**: real PTY → foreground child master (user input)
//! - **down-stream**: child master → real PTY (prism output)
//!
//! The mirror borrows the child master: activation duplicates the fd (so
//! reactor registrations never collide across swaps) while the MRU entry
//! keeps ownership and closes it on removal. Deactivation aborts both
//! tasks at their suspension points without waiting for them — it must
//! return immediately so swaps stay fast. A task
//! that had already won a read races it to completion; its write to a
//! no-longer-foreground child is harmless and it terminates right after.
//!
//! Nothing here buffers, records, or replays bytes. Background prisms keep
//! writing into their PTY's kernel buffer until it fills, at which point
//! their writes block; that backpressure is intended.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;

use crate::pty::{dup_nonblocking, read_fd, write_fd};

/// A non-blocking fd registered with the reactor, shareable across tasks.
pub type SharedFd = Arc<AsyncFd<OwnedFd>>;

const COPY_BUF_SIZE: usize = 8192;

/// Wrap an already non-blocking fd for mirror use.
pub fn shared_fd(fd: OwnedFd) -> Result<SharedFd> {
    Ok(Arc::new(
        AsyncFd::new(fd).context("Failed to register fd with the reactor")?,
    ))
}

/// The active binding between the real PTY and one child PTY master.
pub struct Mirror {
    up: JoinHandle<()>,
    down: JoinHandle<()>,
    active: bool,
}

impl Mirror {
    /// Spawn the two copy tasks. Does not block the caller.
    ///
    /// # Errors
    ///
    /// Fails if the child master cannot be duplicated or registered.
    pub fn activate(
        real_in: SharedFd,
        real_out: SharedFd,
        child_master: BorrowedFd<'_>,
    ) -> Result<Self> {
        let child: SharedFd = shared_fd(dup_nonblocking(child_master)?)?;

        log::debug!(
            "[Mirror] Activated: real PTY <-> child master (fd {})",
            child_master.as_raw_fd()
        );

        let up = tokio::spawn(copy_stream(real_in, Arc::clone(&child), "real->child"));
        let down = tokio::spawn(copy_stream(child, real_out, "child->real"));

        Ok(Self {
            up,
            down,
            active: true,
        })
    }

    /// Tear down the binding. Non-blocking and idempotent.
    ///
    /// Both tasks are cancelled at their next suspension point; the caller
    /// never waits. An up-stream task mid-write finishes that write into
    /// the stale child first, which is tolerated — at most one such task
    /// exists per in-flight swap.
    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.up.abort();
        self.down.abort();
        self.active = false;
        log::debug!("[Mirror] Deactivated");
    }

    /// Whether the copy tasks are live.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for Mirror {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// Copy bytes from one fd to another until EOF or error.
async fn copy_stream(from: SharedFd, to: SharedFd, label: &'static str) {
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        let n = match read_some(&from, &mut buf).await {
            Ok(0) => break, // EOF
            Ok(n) => n,
            Err(e) => {
                if !is_expected_pty_error(&e) {
                    log::warn!("[Mirror] ({label}) read error: {e}");
                }
                break;
            }
        };

        if let Err(e) = write_all(&to, &buf[..n]).await {
            if !is_expected_pty_error(&e) {
                log::warn!("[Mirror] ({label}) write error: {e}");
            }
            break;
        }
    }
    log::trace!("[Mirror] ({label}) copy task exiting");
}

async fn read_some(fd: &SharedFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| read_fd(inner.get_ref().as_raw_fd(), buf)) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn write_all(fd: &SharedFd, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let mut guard = fd.writable().await?;
        match guard.try_io(|inner| write_fd(inner.get_ref().as_raw_fd(), data)) {
            Ok(Ok(n)) => data = &data[n..],
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

/// Errors that are routine during a swap or shutdown: the closed-PTY
/// family (EOF surfaces as `Ok(0)`, the rest as errno) plus the timeout
/// class. Anything else is an anomaly worth a log line, though never fatal
/// to the controller.
fn is_expected_pty_error(e: &io::Error) -> bool {
    if matches!(
        e.raw_os_error(),
        Some(libc::EIO) | Some(libc::ENXIO) | Some(libc::EPIPE)
    ) {
        return true;
    }
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof | io::ErrorKind::TimedOut
    )
}
