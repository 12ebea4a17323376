//! Shared mmap state regions.
//!
//! Each controller publishes a fixed-layout, memory-mapped record of its
//! live prisms; the supervisor publishes one for its panels. External
//! tooling reads these without ever blocking the writer.
//!
//! # Seq-lock protocol
//!
//! The first word of every region is a 64-bit version counter. Writers
//! bracket every update with two increments: odd while writing, even when
//! the record is consistent. Readers load the version, copy the record,
//! load the version again, and accept the copy only when both loads match
//! and are even. Readers retry a bounded number of times and then report
//! failure; callers fall back to the IPC `status` request, which is always
//! authoritative.
//!
//! # File lifecycle
//!
//! Created with `O_CREAT|O_TRUNC` and truncated to [`REGION_SIZE`] on
//! writer startup, unlinked on graceful shutdown. A region left behind by
//! a crash is simply overwritten by the next writer with the same name.

mod layout;
mod reader;
mod writer;

pub use layout::{
    DaemonRegion, PanelRegion, PanelSlot, PrismSlot, MAX_PANEL_SLOTS, MAX_PRISM_SLOTS, NAME_BYTES,
    REGION_SIZE, STATE_BACKGROUND, STATE_FOREGROUND,
};
pub use reader::{DaemonStateReader, PanelStateReader, MAX_READ_RETRIES};
pub use writer::{DaemonStateWriter, PanelStateWriter};

/// Longest publishable name. One byte shorter than the field so names are
/// always NUL-padded.
pub const PRISM_NAME_MAX: usize = NAME_BYTES - 1;

/// One prism as published by a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrismSnapshot {
    pub name: String,
    pub pid: i32,
    pub start_unix_ms: i64,
    pub foreground: bool,
}

/// Decoded controller region.
#[derive(Debug, Clone)]
pub struct PanelStateSnapshot {
    pub version: u64,
    pub foreground: String,
    pub prisms: Vec<PrismSnapshot>,
}

/// One panel as published by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelSnapshot {
    pub instance: String,
    pub name: String,
    pub pid: i32,
    pub healthy: bool,
    pub start_unix_ms: i64,
}

/// Decoded supervisor region.
#[derive(Debug, Clone)]
pub struct DaemonStateSnapshot {
    pub version: u64,
    pub panels: Vec<PanelSnapshot>,
}

/// Encode a name into a fixed NUL-padded field, truncating at the field
/// boundary. The shared-state array is best-effort; the IPC status payload
/// carries full names.
pub(crate) fn encode_name(name: &str) -> ([u8; NAME_BYTES], u32) {
    let mut field = [0u8; NAME_BYTES];
    let len = name.len().min(PRISM_NAME_MAX);
    field[..len].copy_from_slice(&name.as_bytes()[..len]);
    (field, len as u32)
}

/// Decode a NUL-padded name field.
pub(crate) fn decode_name(field: &[u8; NAME_BYTES], len: u32) -> String {
    let len = (len as usize).min(NAME_BYTES);
    String::from_utf8_lossy(&field[..len]).into_owned()
}
