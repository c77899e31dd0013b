//! Configuration management.
//!
//! Settings are read from a TOML file. Every section and field has a default,
//! so an empty file (or no file at all) yields a working configuration.
//!
//! ```toml
//! log_level = "debug"
//! escalation = "sudo"
//!
//! [monitor]
//! poll_interval_ms = 1000
//! media_root = "/run/media"
//! excluded_majors = [7, 11]
//! unmount_on_exit = false
//!
//! [steam]
//! registry_path = "/home/deck/.local/share/Steam/steamapps/libraryfolders.vdf"
//! backup = true
//! restart_steam = false
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{ConfigParseSnafu, ConfigReadSnafu, Error, Result};
use crate::executor::PrivilegeEscalation;
use crate::inspect::DEFAULT_EXCLUDED_MAJORS;
use crate::mount::DEFAULT_MEDIA_ROOT;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_log_level")]
    pub log_level: String,
    /// How mount and umount are elevated.
    #[serde(default)]
    pub escalation: PrivilegeEscalation,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub steam: SteamSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            escalation: PrivilegeEscalation::default(),
            monitor: MonitorSettings::default(),
            steam: SteamSettings::default(),
        }
    }
}

/// Reconciliation loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Delay between two ticks, in milliseconds
    #[serde(default = "MonitorSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Directory under which `<serial>` mount points are created
    #[serde(default = "MonitorSettings::default_media_root")]
    pub media_root: PathBuf,
    /// Block device major numbers never enumerated
    #[serde(default = "MonitorSettings::default_excluded_majors")]
    pub excluded_majors: Vec<u32>,
    /// Unmount everything the monitor mounted when it stops
    #[serde(default)]
    pub unmount_on_exit: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval(),
            media_root: Self::default_media_root(),
            excluded_majors: Self::default_excluded_majors(),
            unmount_on_exit: false,
        }
    }
}

impl MonitorSettings {
    fn default_poll_interval() -> u64 {
        1000
    }

    fn default_media_root() -> PathBuf {
        PathBuf::from(DEFAULT_MEDIA_ROOT)
    }

    fn default_excluded_majors() -> Vec<u32> {
        DEFAULT_EXCLUDED_MAJORS.to_vec()
    }

    /// Tick period; zero is clamped to one millisecond.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteamSettings {
    /// Overrides `~/.local/share/Steam/steamapps/libraryfolders.vdf`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_path: Option<PathBuf>,
    /// Copy the registry aside before editing it
    #[serde(default = "SteamSettings::default_backup")]
    pub backup: bool,
    /// Stop a running Steam before editing the registry and relaunch it after
    #[serde(default)]
    pub restart_steam: bool,
}

impl Default for SteamSettings {
    fn default() -> Self {
        Self {
            registry_path: None,
            backup: Self::default_backup(),
            restart_steam: false,
        }
    }
}

impl SteamSettings {
    fn default_backup() -> bool {
        true
    }
}

impl Config {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// `<config_dir>/steamos-usb-mount/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("steamos-usb-mount")
            .join("config.toml")
    }

    /// Loads configuration from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context(ConfigReadSnafu { path })?;
        Self::from_toml(&content, path)
    }

    /// Loads the default file if it exists, otherwise returns defaults.
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    fn from_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).context(ConfigParseSnafu { path })
    }

    /// Writes the configuration as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        let write_error = |message: String| Error::ConfigWrite {
            path: path.to_path_buf(),
            message,
        };

        let content = toml::to_string_pretty(self).map_err(|e| write_error(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| write_error(e.to_string()))?;
        }
        fs::write(path, content).map_err(|e| write_error(e.to_string()))
    }
}
