//! Caller-facing device queries and commands.
//!
//! [`DeviceService`] is the interface for UI layers. It reports every
//! USB storage device currently attached, and offers explicit mount, unmount
//! and Steam library registration. Commands never fail across this boundary:
//! they return a [`CommandOutcome`] and log the underlying error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::executor::Host;
use crate::inspect::{self, DEFAULT_EXCLUDED_MAJORS};
use crate::mount::{self, MountPointResolver};
use crate::reconcile::Snapshot;
use crate::steam::{self, SteamCommands, SteamControl};

/// Status of one attached USB storage device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDeviceInfo {
    pub serial_number: Option<String>,
    /// The device or one of its partitions is in the live mount table.
    pub is_mounted: bool,
    /// Kernel device name (e.g., "sda").
    pub device_path: String,
    /// Mount point derived from the serial, if there is one.
    pub mount_point: Option<PathBuf>,
    /// Filesystem type, empty if unformatted or unknown.
    pub filesystem: String,
    /// The monitor mounted this device and tracks it.
    pub managed: bool,
}

/// Result of a caller-facing command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

impl<T> From<Result<T>> for CommandOutcome {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(_) => Self::ok(),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

/// Query and command facade over a [`Host`].
#[derive(Debug, Clone)]
pub struct DeviceService<H, S = SteamCommands> {
    host: H,
    resolver: MountPointResolver,
    excluded_majors: Vec<u32>,
    registry_path: Option<PathBuf>,
    backup_registry: bool,
    steam: S,
    restart_steam: bool,
}

impl<H: Host> DeviceService<H> {
    pub fn new(host: H, resolver: MountPointResolver) -> Self {
        Self {
            host,
            resolver,
            excluded_majors: DEFAULT_EXCLUDED_MAJORS.to_vec(),
            registry_path: None,
            backup_registry: true,
            steam: SteamCommands,
            restart_steam: false,
        }
    }
}

impl<H: Host, S: SteamControl> DeviceService<H, S> {
    /// Replaces how the Steam client is detected, stopped and started.
    pub fn with_steam_control<T: SteamControl>(self, steam: T) -> DeviceService<H, T> {
        DeviceService {
            host: self.host,
            resolver: self.resolver,
            excluded_majors: self.excluded_majors,
            registry_path: self.registry_path,
            backup_registry: self.backup_registry,
            steam,
            restart_steam: self.restart_steam,
        }
    }

    /// Stops a running Steam before editing the registry and relaunches it
    /// afterwards. Without this, `add_library` refuses while Steam runs.
    pub fn with_steam_restart(mut self, restart: bool) -> Self {
        self.restart_steam = restart;
        self
    }

    pub fn with_excluded_majors(mut self, excluded_majors: Vec<u32>) -> Self {
        self.excluded_majors = excluded_majors;
        self
    }

    /// Uses `path` instead of Steam's default registry location.
    pub fn with_registry_path(mut self, path: Option<PathBuf>) -> Self {
        self.registry_path = path;
        self
    }

    pub fn with_registry_backup(mut self, backup: bool) -> Self {
        self.backup_registry = backup;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn resolver(&self) -> &MountPointResolver {
        &self.resolver
    }

    /// Lists every attached USB storage device.
    ///
    /// `managed` is a snapshot of the monitor's mapping (empty if no monitor
    /// runs). Per-device lookup failures degrade the entry instead of dropping
    /// the list; an enumeration failure yields an empty list.
    pub fn list_usb_devices(&self, managed: &Snapshot) -> Vec<UsbDeviceInfo> {
        let names = match inspect::list_block_devices(&self.host, &self.excluded_majors) {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "cannot list block devices");
                return Vec::new();
            }
        };

        names
            .into_iter()
            .filter_map(|name| {
                let device = inspect::inspect_device(&self.host, &name).ok()?;
                if !device.is_managed() {
                    return None;
                }

                let is_mounted = mount::is_mounted(&self.host, &name).unwrap_or_else(|e| {
                    warn!(device = %name, error = %e, "cannot read mount table");
                    false
                });
                let filesystem = inspect::get_filesystem_type(&self.host, &name)
                    .unwrap_or_else(|e| {
                        warn!(device = %name, error = %e, "cannot probe filesystem");
                        None
                    })
                    .unwrap_or_default();
                let mount_point = device
                    .serial_number
                    .as_deref()
                    .map(|serial| self.resolver.mount_point_for_serial(serial));

                Some(UsbDeviceInfo {
                    serial_number: device.serial_number.clone(),
                    is_mounted,
                    managed: managed.contains_key(&name),
                    device_path: name,
                    mount_point,
                    filesystem,
                })
            })
            .collect()
    }

    /// Mounts `device` at `mount_point` with the given filesystem type.
    pub fn mount_usb(&self, device: &str, mount_point: &Path, filesystem: &str) -> CommandOutcome {
        let result = mount::mount(&self.host, device, mount_point, filesystem);
        log_failure("mount", device, &result);
        result.into()
    }

    /// Unmounts `device` from `mount_point` and removes the directory.
    pub fn unmount_usb(&self, device: &str, mount_point: &Path) -> CommandOutcome {
        let result = mount::unmount(&self.host, device, mount_point);
        log_failure("unmount", device, &result);
        result.into()
    }

    /// Returns true if `mount_point` holds a Steam library.
    pub fn verify_library(&self, mount_point: &Path) -> bool {
        steam::has_library_metadata(mount_point)
    }

    /// Registers `mount_point` as a Steam library.
    ///
    /// Succeeds without writing if the registry already lists it. Fails with
    /// [`Error::SteamRunning`] while Steam runs, unless restarting is enabled.
    pub fn add_library(&self, mount_point: &Path) -> CommandOutcome {
        let result = self.try_add_library(mount_point);
        log_failure("add library", &mount_point.display().to_string(), &result);
        result.into()
    }

    fn try_add_library(&self, mount_point: &Path) -> Result<()> {
        if !self.verify_library(mount_point) {
            return Err(Error::MalformedMetadata {
                path: steam::library_metadata_path(mount_point),
                message: "not a Steam library folder".to_string(),
            });
        }

        let registry = self.registry_path()?;

        match steam::is_library_registered(&registry, mount_point) {
            Ok(true) => {
                info!(library = %mount_point.display(), "library already registered");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "cannot parse registry, appending anyway"),
        }

        let was_running = self.steam.is_running();
        if was_running {
            if !self.restart_steam {
                return Err(Error::SteamRunning);
            }
            self.steam.shutdown()?;
        }

        let written = self.write_library(&registry, mount_point);

        if was_running {
            match self.steam.start() {
                Err(e) if written.is_ok() => return Err(e),
                Err(e) => warn!(error = %e, "failed to relaunch Steam"),
                Ok(()) => {}
            }
        }
        written
    }

    fn write_library(&self, registry: &Path, mount_point: &Path) -> Result<()> {
        if self.backup_registry {
            let backup = steam::backup_registry(registry)?;
            info!(backup = %backup.display(), "registry backed up");
        }

        steam::append_library(registry, mount_point)?;
        Ok(())
    }

    /// Returns the configured registry path, or Steam's default one.
    pub fn registry_path(&self) -> Result<PathBuf> {
        match &self.registry_path {
            Some(path) => Ok(path.clone()),
            None => steam::steam_library_vdf_path(),
        }
    }
}

fn log_failure<T>(action: &str, target: &str, result: &Result<T>) {
    if let Err(e) = result {
        warn!(action, target, error = %e, "command failed");
    }
}
