//! Fixed on-disk layout of the state regions.
//!
//! Little-endian, naturally aligned, `#[repr(C)]`. Both regions are padded
//! to [`REGION_SIZE`]; the version word sits at offset 0 so writers and
//! readers agree on it without any other layout knowledge.

/// Size of every name field, NUL-padded.
pub const NAME_BYTES: usize = 64;

/// Prism slots in a controller region. Starts beyond this count succeed;
/// the array truncates and the IPC status response stays authoritative.
pub const MAX_PRISM_SLOTS: usize = 32;

/// Panel slots in the supervisor region.
pub const MAX_PANEL_SLOTS: usize = 16;

/// Mapped size of both region files.
pub const REGION_SIZE: usize = 4096;

/// Slot state tag: prism is running in the background.
pub const STATE_BACKGROUND: u8 = 0;

/// Slot state tag: prism owns the mirror.
pub const STATE_FOREGROUND: u8 = 1;

/// One prism slot in a controller region.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PrismSlot {
    pub name_len: u32,
    pub name: [u8; NAME_BYTES],
    pub pid: i32,
    pub start_unix_ms: i64,
    pub state: u8,
    pub _pad: [u8; 7],
}

impl PrismSlot {
    pub(crate) const ZERO: PrismSlot = PrismSlot {
        name_len: 0,
        name: [0; NAME_BYTES],
        pid: 0,
        start_unix_ms: 0,
        state: STATE_BACKGROUND,
        _pad: [0; 7],
    };
}

/// Controller region header + slots.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PanelRegion {
    pub version: u64,
    pub prism_count: u32,
    pub foreground_name_len: u32,
    pub foreground_name: [u8; NAME_BYTES],
    pub prisms: [PrismSlot; MAX_PRISM_SLOTS],
}

/// One panel slot in the supervisor region.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PanelSlot {
    pub instance_len: u32,
    pub instance: [u8; NAME_BYTES],
    pub name_len: u32,
    pub name: [u8; NAME_BYTES],
    pub pid: i32,
    pub healthy: u8,
    pub _pad: [u8; 3],
    pub start_unix_ms: i64,
}

impl PanelSlot {
    pub(crate) const ZERO: PanelSlot = PanelSlot {
        instance_len: 0,
        instance: [0; NAME_BYTES],
        name_len: 0,
        name: [0; NAME_BYTES],
        pid: 0,
        healthy: 0,
        _pad: [0; 3],
        start_unix_ms: 0,
    };
}

/// Supervisor region header + slots.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DaemonRegion {
    pub version: u64,
    pub panel_count: u32,
    pub _pad: u32,
    pub panels: [PanelSlot; MAX_PANEL_SLOTS],
}
