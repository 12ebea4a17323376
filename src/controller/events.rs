//! Unified event channel for the controller event loop.
//!
//! Every state mutation — IPC requests, reaped children, signals — arrives
//! as a `ControllerEvent` on one `mpsc::UnboundedSender`. The event loop
//! is the single serialization point: producers never touch the MRU, the
//! mirror, or the state region directly.

// Rust guideline compliant 2026-02

use tokio::sync::oneshot;

use crate::ipc::{Request, Response};

/// Event from a background producer delivered to the controller loop.
#[derive(Debug)]
pub enum ControllerEvent {
    /// One decoded IPC request with its reply channel.
    Ipc {
        request: Request,
        reply: oneshot::Sender<Response>,
    },

    /// A child was reaped; `code` is the exit code for a normal exit or
    /// `128 + signal` for a signalled death.
    ChildExited { pid: i32, code: i32 },

    /// SIGINT: kill the foreground prism, or shut down when none remain.
    Interrupt,

    /// SIGTERM or SIGHUP: graceful shutdown.
    Shutdown,

    /// SIGWINCH: propagate the real PTY size onto every child.
    Resize,
}
