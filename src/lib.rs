//! shine - PTY panel multiplexer.
//!
//! One supervisor daemon (`shined`) spawns one panel controller
//! (`prismctl`) per configured panel. Each controller owns a real PTY
//! provided by the terminal emulator and hosts a set of interactive
//! programs ("prisms"), each on its own PTY. Exactly one prism is
//! foreground at a time; the rest keep running with their output parked in
//! their PTY's kernel buffer until they're swapped back in.
//!
//! # Architecture
//!
//! - **Controller** - owns the real PTY, the MRU of live prisms, and the
//!   Mirror binding the foreground prism to the terminal; serves per-panel
//!   IPC and publishes an mmap state region
//! - **Supervisor** - spawns controllers, monitors health, applies restart
//!   policy, serves the aggregation RPC
//! - **Mirror** - two copy tasks moving bytes between the real PTY and
//!   the foreground child's PTY master
//!
//! # Modules
//!
//! - [`controller`] - MRU, swap engine, reaping, signal handling
//! - [`mirror`] - the foreground I/O binding
//! - [`pty`] - PTY allocation, resize propagation, prism spawning
//! - [`ipc`] - per-panel request/response over Unix sockets
//! - [`rpc`] - supervisor JSON-RPC and controller notifications
//! - [`state`] - seq-lock mmap regions for external tooling
//! - [`restart`] - crash-window restart policy engine
//! - [`supervisor`] - panel manager and config reload

pub mod config;
pub mod controller;
pub mod ipc;
pub mod mirror;
pub mod paths;
pub mod pty;
pub mod restart;
pub mod rpc;
pub mod state;
pub mod supervisor;

// Re-export commonly used types
pub use config::{Config, PrismConfig};
pub use controller::{Controller, ControllerEvent};
pub use mirror::Mirror;
pub use restart::RestartPolicy;
pub use supervisor::{Supervisor, SupervisorEvent};

/// Crate version, reported by `service/status` and `--version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
