//! Per-panel IPC over Unix domain sockets.
//!
//! Wire format is newline-terminated JSON. Each connection carries exactly
//! one request and one response, then closes; requests across connections
//! are serialized by the controller's event loop, so a client that saw a
//! successful `start` response will observe the new foreground in its next
//! `status` call on any connection.
//!
//! Per-connection deadline is five seconds end-to-end (read and write).

mod client;
mod protocol;
mod server;

pub use client::IpcClient;
pub use protocol::{Action, PrismStatus, Request, Response, StatusData};
pub use server::{IpcRequest, IpcServer, CONNECTION_DEADLINE};
