//! Seq-lock writers for the controller and supervisor regions.
//!
//! Writing is single-threaded by construction: the controller publishes
//! from its event loop, the supervisor from its main loop. The version
//! word is the only shared-memory synchronization; field stores go through
//! volatile writes so the copy is performed as written.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use memmap2::MmapMut;

use super::layout::{
    DaemonRegion, PanelRegion, PanelSlot, PrismSlot, MAX_PANEL_SLOTS, MAX_PRISM_SLOTS,
    REGION_SIZE, STATE_BACKGROUND, STATE_FOREGROUND,
};
use super::{encode_name, PanelSnapshot, PrismSnapshot};

fn create_region(path: &Path) -> Result<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("Failed to create state region: {}", path.display()))?;
    file.set_len(REGION_SIZE as u64)
        .with_context(|| format!("Failed to size state region: {}", path.display()))?;
    // Safety: the file stays open for the lifetime of the mapping and is
    // sized to REGION_SIZE above.
    let map = unsafe { MmapMut::map_mut(&file) }
        .with_context(|| format!("Failed to mmap state region: {}", path.display()))?;
    Ok(map)
}

/// Version word of a mapped region, viewed atomically.
///
/// Safety: the caller guarantees the mapping is at least 8 bytes and the
/// version word sits at offset 0 (see `layout` tests).
unsafe fn version_word(map: &MmapMut) -> &AtomicU64 {
    &*(map.as_ptr() as *const AtomicU64)
}

/// Writer for a controller's `prism-<instance>.state` region.
pub struct PanelStateWriter {
    map: MmapMut,
    path: PathBuf,
}

impl PanelStateWriter {
    /// Create (or overwrite) the region file and map it.
    pub fn create(path: &Path) -> Result<Self> {
        let map = create_region(path)?;
        Ok(Self {
            map,
            path: path.to_path_buf(),
        })
    }

    /// Publish the current MRU. `prisms` is in MRU order (head first);
    /// entries beyond [`MAX_PRISM_SLOTS`] are dropped from the region.
    pub fn publish(&mut self, foreground: &str, prisms: &[PrismSnapshot]) {
        let count = prisms.len().min(MAX_PRISM_SLOTS);
        let (fg_name, fg_len) = encode_name(foreground);

        let region = self.map.as_mut_ptr() as *mut PanelRegion;
        // Safety: the mapping is REGION_SIZE bytes, PanelRegion fits (layout
        // tests), and this process is the only writer.
        unsafe {
            let version = version_word(&self.map);
            version.fetch_add(1, Ordering::AcqRel); // odd: write in progress

            ptr::write_volatile(ptr::addr_of_mut!((*region).prism_count), count as u32);
            ptr::write_volatile(ptr::addr_of_mut!((*region).foreground_name_len), fg_len);
            ptr::write_volatile(ptr::addr_of_mut!((*region).foreground_name), fg_name);

            for (i, prism) in prisms.iter().take(count).enumerate() {
                let (name, name_len) = encode_name(&prism.name);
                let slot = PrismSlot {
                    name_len,
                    name,
                    pid: prism.pid,
                    start_unix_ms: prism.start_unix_ms,
                    state: if prism.foreground {
                        STATE_FOREGROUND
                    } else {
                        STATE_BACKGROUND
                    },
                    _pad: [0; 7],
                };
                ptr::write_volatile(ptr::addr_of_mut!((*region).prisms[i]), slot);
            }
            for i in count..MAX_PRISM_SLOTS {
                ptr::write_volatile(ptr::addr_of_mut!((*region).prisms[i]), PrismSlot::ZERO);
            }

            version.fetch_add(1, Ordering::AcqRel); // even: consistent
        }
    }

    /// Current version word (test observability).
    #[must_use]
    pub fn version(&self) -> u64 {
        unsafe { version_word(&self.map) }.load(Ordering::Acquire)
    }

    /// Region file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlink the region file. Called on graceful shutdown; the mapping
    /// itself is released on drop.
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::debug!("Failed to remove state region {}: {e}", self.path.display());
        }
    }
}

/// Writer for the supervisor's `shined.state` region.
pub struct DaemonStateWriter {
    map: MmapMut,
    path: PathBuf,
}

impl DaemonStateWriter {
    /// Create (or overwrite) the region file and map it.
    pub fn create(path: &Path) -> Result<Self> {
        let map = create_region(path)?;
        Ok(Self {
            map,
            path: path.to_path_buf(),
        })
    }

    /// Publish the live panel set.
    pub fn publish(&mut self, panels: &[PanelSnapshot]) {
        let count = panels.len().min(MAX_PANEL_SLOTS);

        let region = self.map.as_mut_ptr() as *mut DaemonRegion;
        // Safety: same as PanelStateWriter::publish.
        unsafe {
            let version = version_word(&self.map);
            version.fetch_add(1, Ordering::AcqRel);

            ptr::write_volatile(ptr::addr_of_mut!((*region).panel_count), count as u32);
            for (i, panel) in panels.iter().take(count).enumerate() {
                let (instance, instance_len) = encode_name(&panel.instance);
                let (name, name_len) = encode_name(&panel.name);
                let slot = PanelSlot {
                    instance_len,
                    instance,
                    name_len,
                    name,
                    pid: panel.pid,
                    healthy: u8::from(panel.healthy),
                    _pad: [0; 3],
                    start_unix_ms: panel.start_unix_ms,
                };
                ptr::write_volatile(ptr::addr_of_mut!((*region).panels[i]), slot);
            }
            for i in count..MAX_PANEL_SLOTS {
                ptr::write_volatile(ptr::addr_of_mut!((*region).panels[i]), PanelSlot::ZERO);
            }

            version.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Region file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlink the region file on graceful shutdown.
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::debug!("Failed to remove state region {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_sizes_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("panel.state");
        let writer = PanelStateWriter::create(&path).unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), REGION_SIZE as u64);
        assert_eq!(writer.version(), 0);
    }

    #[test]
    fn test_publish_bumps_version_twice() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut writer = PanelStateWriter::create(&tmp.path().join("panel.state")).unwrap();

        writer.publish("", &[]);
        assert_eq!(writer.version(), 2);
        writer.publish("", &[]);
        assert_eq!(writer.version(), 4);
    }

    #[test]
    fn test_remove_unlinks_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("panel.state");
        let writer = PanelStateWriter::create(&path).unwrap();

        writer.remove();
        assert!(!path.exists());
    }
}
