//! Configuration loading and validation.
//!
//! The config file is JSON under the config directory
//! (`~/.config/shine/prisms.json` by default, `SHINE_CONFIG_DIR` override
//! for tests). It carries one descriptor per prism plus the command the
//! supervisor uses to open a panel window.
//!
//! Descriptors are immutable per load: the supervisor re-loads and
//! re-validates the whole file on reload, and only a file that validates
//! end-to-end replaces the live set.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::restart::RestartPolicy;
use crate::state::PRISM_NAME_MAX;

fn default_restart_delay_ms() -> u64 {
    1000
}

/// Immutable descriptor for one prism.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PrismConfig {
    /// Unique prism name; doubles as the default panel instance name.
    pub name: String,
    /// Resolved executable path. Discovery happens outside the core; by the
    /// time a descriptor reaches us this must point at a real binary.
    pub path: PathBuf,
    /// Optional argument vector.
    #[serde(default)]
    pub args: Vec<String>,
    /// Restart policy applied by the supervisor.
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Delay before a policy-driven respawn, in milliseconds.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Maximum restarts per rolling hour; 0 = unlimited.
    #[serde(default)]
    pub max_restarts: u32,
    /// Panel geometry hints, passed opaquely to the panel spawn command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<serde_json::Value>,
}

impl PrismConfig {
    /// Restart delay as a [`Duration`].
    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Validate this descriptor in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty or over-long name, a missing
    /// executable, or a file without the executable bit.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("prism name must not be empty");
        }
        if self.name.len() > PRISM_NAME_MAX {
            bail!(
                "prism name {:?} exceeds {} bytes",
                self.name,
                PRISM_NAME_MAX
            );
        }
        let meta = std::fs::metadata(&self.path)
            .with_context(|| format!("prism {:?}: binary not found: {}", self.name, self.path.display()))?;
        if !meta.is_file() {
            bail!("prism {:?}: {} is not a regular file", self.name, self.path.display());
        }
        if meta.permissions().mode() & 0o111 == 0 {
            bail!("prism {:?}: {} is not executable", self.name, self.path.display());
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
    /// All configured prisms, one panel each.
    #[serde(default)]
    pub prisms: Vec<PrismConfig>,
    /// Command prefix the supervisor uses to open a panel window. The
    /// controller binary, prism name, and instance name are appended. Empty
    /// means "run the controller directly" (useful for tests and headless
    /// setups where the caller provides the terminal).
    #[serde(default)]
    pub panel_command: Vec<String>,
}

impl Config {
    /// Config directory (`SHINE_CONFIG_DIR` override, else `~/.config/shine`).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(test_dir) = std::env::var("SHINE_CONFIG_DIR") {
            PathBuf::from(test_dir)
        } else {
            dirs::config_dir()
                .context("No config directory")?
                .join("shine")
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Default config file path.
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("prisms.json"))
    }

    /// Load from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// Validate the whole file: every descriptor, plus name uniqueness.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for prism in &self.prisms {
            prism.validate()?;
            if !seen.insert(prism.name.as_str()) {
                bail!("duplicate prism name: {:?}", prism.name);
            }
        }
        Ok(())
    }

    /// Look up a descriptor by name.
    #[must_use]
    pub fn prism(&self, name: &str) -> Option<&PrismConfig> {
        self.prisms.iter().find(|p| p.name == name)
    }

    /// Save to a specific file (pretty-printed, test convenience).
    pub fn save_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }
}
