//! In-memory [`Host`] used by unit tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::executor::Host;

/// A mount or unmount performed against the fake host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Mount {
        fs_type: String,
        partition: String,
        mount_point: PathBuf,
    },
    Unmount {
        mount_point: PathBuf,
    },
}

#[derive(Debug, Clone)]
struct FakeDevice {
    properties: String,
    fs_type: String,
    partitions: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct FakeState {
    devices: BTreeMap<String, FakeDevice>,
    mounted: BTreeMap<PathBuf, String>,
    calls: Vec<Call>,
    fail_enumeration: bool,
    fail_mount: bool,
    fail_unmount: bool,
    fail_properties: bool,
}

/// Cloneable fake; clones share state so tests can mutate devices while a
/// reconciler owns another handle.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<FakeState>>,
}

fn exit_error(command: &str, stderr: &str) -> Error {
    Error::CommandExit {
        command: command.to_string(),
        code: 1,
        stderr: stderr.to_string(),
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Adds a USB stick; an empty `fs_type` models unformatted media with no partition.
    pub fn add_usb_device(&self, name: &str, serial: &str, fs_type: &str) {
        let properties = format!(
            "DEVNAME=/dev/{name}\nDEVTYPE=disk\nID_BUS=usb\nID_SERIAL_SHORT={serial}\nID_TYPE=disk\n"
        );
        self.add_device(name, &properties, fs_type);
    }

    /// Adds an internal (non-USB) disk.
    pub fn add_other_device(&self, name: &str) {
        let properties = format!("DEVNAME=/dev/{name}\nDEVTYPE=disk\nID_BUS=ata\n");
        self.add_device(name, &properties, "ext4");
    }

    pub fn add_device(&self, name: &str, properties: &str, fs_type: &str) {
        let mut partitions = vec![(format!("/dev/{name}"), "disk".to_string())];
        if !fs_type.is_empty() {
            partitions.push((format!("/dev/{name}1"), "part".to_string()));
        }
        self.state().devices.insert(
            name.to_string(),
            FakeDevice {
                properties: properties.to_string(),
                fs_type: fs_type.to_string(),
                partitions,
            },
        );
    }

    pub fn remove_device(&self, name: &str) {
        self.state().devices.remove(name);
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.state().fail_enumeration = fail;
    }

    pub fn fail_mount(&self, fail: bool) {
        self.state().fail_mount = fail;
    }

    pub fn fail_unmount(&self, fail: bool) {
        self.state().fail_unmount = fail;
    }

    /// Makes every udev property query fail while devices stay enumerated.
    pub fn fail_properties(&self, fail: bool) {
        self.state().fail_properties = fail;
    }

    /// Marks a partition as mounted without going through [`Host::mount`].
    pub fn mark_mounted(&self, partition: &str, mount_point: &Path) {
        self.state()
            .mounted
            .insert(mount_point.to_path_buf(), partition.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }
}

impl Host for FakeHost {
    fn list_block_devices(&self, _excluded_majors: &[u32]) -> Result<String> {
        let state = self.state();
        if state.fail_enumeration {
            return Err(exit_error("lsblk", "lsblk: failed to access sysfs"));
        }
        Ok(state
            .devices
            .keys()
            .map(|name| format!("{name}\n"))
            .collect())
    }

    fn device_properties(&self, name: &str) -> Result<String> {
        let state = self.state();
        if state.fail_properties {
            return Err(exit_error("udevadm", "device node busy"));
        }
        state
            .devices
            .get(name)
            .map(|d| d.properties.clone())
            .ok_or_else(|| exit_error("udevadm", "Unknown device"))
    }

    fn filesystem_type(&self, name: &str) -> Result<String> {
        self.state()
            .devices
            .get(name)
            .map(|d| format!("\n{}\n", d.fs_type))
            .ok_or_else(|| exit_error("lsblk", "not a block device"))
    }

    fn list_partitions(&self, device_path: &str) -> Result<String> {
        let state = self.state();
        let name = device_path.trim_start_matches("/dev/");
        let device = state
            .devices
            .get(name)
            .ok_or_else(|| exit_error("lsblk", "not a block device"))?;
        Ok(device
            .partitions
            .iter()
            .map(|(path, kind)| format!("{path} {kind}\n"))
            .collect())
    }

    fn mount(&self, fs_type: &str, partition: &str, mount_point: &Path) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::Mount {
            fs_type: fs_type.to_string(),
            partition: partition.to_string(),
            mount_point: mount_point.to_path_buf(),
        });
        if state.fail_mount {
            return Err(exit_error("mount", "wrong fs type, bad option, bad superblock"));
        }
        state
            .mounted
            .insert(mount_point.to_path_buf(), partition.to_string());
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        let mut state = self.state();
        state.calls.push(Call::Unmount {
            mount_point: mount_point.to_path_buf(),
        });
        if state.fail_unmount {
            return Err(exit_error("umount", "target is busy"));
        }
        state.mounted.remove(mount_point);
        Ok(())
    }

    fn mount_table(&self) -> Result<String> {
        Ok(self
            .state()
            .mounted
            .iter()
            .map(|(target, source)| format!("{source} {} auto rw 0 0\n", target.display()))
            .collect())
    }
}
