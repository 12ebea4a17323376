//! Lock-free readers for the state regions.
//!
//! Readers never block the writer: they spin on the version word for a
//! bounded number of attempts and report failure past the cap, at which
//! point callers fall back to the IPC `status` request.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use memmap2::Mmap;

use super::layout::{DaemonRegion, PanelRegion, REGION_SIZE};
use super::{decode_name, DaemonStateSnapshot, PanelSnapshot, PanelStateSnapshot, PrismSnapshot};

/// Maximum attempts at a consistent read before giving up.
pub const MAX_READ_RETRIES: usize = 10;

fn open_region(path: &Path) -> Result<Mmap> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open state region: {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("Failed to stat state region: {}", path.display()))?
        .len();
    if (len as usize) < REGION_SIZE {
        bail!(
            "state region {} is truncated ({len} bytes, want {REGION_SIZE})",
            path.display()
        );
    }
    // Safety: the mapping is read-only and outlives no references handed out.
    let map = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to mmap state region: {}", path.display()))?;
    Ok(map)
}

/// Seq-lock read loop shared by both region types.
///
/// Safety: `T` must be the `#[repr(C)]` region struct whose version word
/// is at offset 0, and the mapping must be at least `size_of::<T>()` bytes.
unsafe fn consistent_read<T: Copy>(map: &Mmap) -> Result<T> {
    let version = &*(map.as_ptr() as *const AtomicU64);
    let region = map.as_ptr() as *const T;

    for _ in 0..MAX_READ_RETRIES {
        let v1 = version.load(Ordering::Acquire);
        if v1 % 2 != 0 {
            // Writer in progress.
            std::hint::spin_loop();
            continue;
        }

        let copy = ptr::read_volatile(region);

        // Order the copy before the confirming version load.
        fence(Ordering::Acquire);
        let v2 = version.load(Ordering::Acquire);

        if v1 == v2 {
            return Ok(copy);
        }
    }

    bail!("failed to get consistent read after {MAX_READ_RETRIES} retries")
}

/// Reader for a controller's `prism-<instance>.state` region.
pub struct PanelStateReader {
    map: Mmap,
    path: PathBuf,
}

impl PanelStateReader {
    /// Open an existing region for reading.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            map: open_region(path)?,
            path: path.to_path_buf(),
        })
    }

    /// Perform a consistent read.
    ///
    /// # Errors
    ///
    /// Returns an error after [`MAX_READ_RETRIES`] torn or in-progress
    /// attempts; the caller should fall back to IPC.
    pub fn read(&self) -> Result<PanelStateSnapshot> {
        // Safety: open_region validated the size; PanelRegion's version word
        // is at offset 0 (layout tests).
        let region: PanelRegion = unsafe { consistent_read(&self.map) }?;

        let count = (region.prism_count as usize).min(region.prisms.len());
        let prisms = region.prisms[..count]
            .iter()
            .map(|slot| PrismSnapshot {
                name: decode_name(&slot.name, slot.name_len),
                pid: slot.pid,
                start_unix_ms: slot.start_unix_ms,
                foreground: slot.state == super::STATE_FOREGROUND,
            })
            .collect();

        Ok(PanelStateSnapshot {
            version: region.version,
            foreground: decode_name(&region.foreground_name, region.foreground_name_len),
            prisms,
        })
    }

    /// Current version word without a consistency check.
    #[must_use]
    pub fn version(&self) -> u64 {
        unsafe { &*(self.map.as_ptr() as *const AtomicU64) }.load(Ordering::Acquire)
    }

    /// Region file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reader for the supervisor's `shined.state` region.
pub struct DaemonStateReader {
    map: Mmap,
}

impl DaemonStateReader {
    /// Open an existing region for reading.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            map: open_region(path)?,
        })
    }

    /// Perform a consistent read.
    pub fn read(&self) -> Result<DaemonStateSnapshot> {
        // Safety: as in PanelStateReader::read.
        let region: DaemonRegion = unsafe { consistent_read(&self.map) }?;

        let count = (region.panel_count as usize).min(region.panels.len());
        let panels = region.panels[..count]
            .iter()
            .map(|slot| PanelSnapshot {
                instance: decode_name(&slot.instance, slot.instance_len),
                name: decode_name(&slot.name, slot.name_len),
                pid: slot.pid,
                healthy: slot.healthy != 0,
                start_unix_ms: slot.start_unix_ms,
            })
            .collect();

        Ok(DaemonStateSnapshot {
            version: region.version,
            panels,
        })
    }
}
