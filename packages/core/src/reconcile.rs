//! Reconciliation of mounted USB devices against the devices actually present.
//!
//! The [`Reconciler`] owns the authoritative mapping of devices this process
//! has mounted. Each [`Reconciler::tick`] enumerates block devices once,
//! mounts managed devices it has not seen yet, and unmounts devices that
//! disappeared, stopped being managed or were replaced by another serial.
//! Devices are processed one at a time, additions first, and a failure on one
//! device never stops the tick for the others. A mapped device that cannot be
//! classified keeps its record until a later tick.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use tracing::{debug, error, warn};

use crate::error::Result;
use crate::executor::Host;
use crate::inspect::{self, DEFAULT_EXCLUDED_MAJORS, Device};
use crate::mount::{self, MountPointResolver};

/// A device mounted by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    pub device: Device,
    /// Derived solely from the device serial.
    pub mount_point: PathBuf,
    /// Partition that was attached (e.g., "/dev/sda1").
    pub primary_partition: String,
}

/// Owned copy of the live mapping, keyed by device name.
pub type Snapshot = BTreeMap<String, MountRecord>;

/// What a single tick changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Devices newly mounted and added to the mapping.
    pub mounted: Vec<String>,
    /// Devices unmounted (or gone) and dropped from the mapping.
    pub removed: Vec<String>,
    /// Devices whose mount or unmount failed this tick.
    pub failed: Vec<String>,
    /// Enumeration was unavailable and the tick did nothing.
    pub enumeration_failed: bool,
}

impl TickReport {
    /// Returns true if the mapping changed.
    pub fn changed(&self) -> bool {
        !self.mounted.is_empty() || !self.removed.is_empty()
    }
}

/// Keeps the set of devices mounted by this process in line with the system.
#[derive(Debug)]
pub struct Reconciler<H> {
    host: H,
    resolver: MountPointResolver,
    excluded_majors: Vec<u32>,
    live: Snapshot,
}

impl<H: Host> Reconciler<H> {
    pub fn new(host: H, resolver: MountPointResolver) -> Self {
        Self {
            host,
            resolver,
            excluded_majors: DEFAULT_EXCLUDED_MAJORS.to_vec(),
            live: Snapshot::new(),
        }
    }

    /// Overrides the major-number classes skipped during enumeration.
    pub fn with_excluded_majors(mut self, excluded_majors: Vec<u32>) -> Self {
        self.excluded_majors = excluded_majors;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn resolver(&self) -> &MountPointResolver {
        &self.resolver
    }

    /// Borrows the live mapping.
    pub fn live(&self) -> &Snapshot {
        &self.live
    }

    /// Returns an owned copy of the live mapping.
    pub fn snapshot(&self) -> Snapshot {
        self.live.clone()
    }

    /// Runs one reconciliation pass.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        let present = match inspect::list_block_devices(&self.host, &self.excluded_majors) {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "device enumeration unavailable, skipping tick");
                report.enumeration_failed = true;
                return report;
            }
        };
        let present_set: BTreeSet<&str> = present.iter().map(String::as_str).collect();
        let previously_live: Vec<String> = self.live.keys().cloned().collect();

        for name in &present {
            if self.live.contains_key(name) {
                continue;
            }
            match self.try_mount(name) {
                Ok(Some(record)) => {
                    self.live.insert(name.clone(), record);
                    report.mounted.push(name.clone());
                }
                Ok(None) => {}
                Err(e) => {
                    error!(device = %name, error = %e, "failed to mount device, will retry");
                    report.failed.push(name.clone());
                }
            }
        }

        for name in previously_live {
            if !present_set.contains(name.as_str()) {
                self.release(&name, false, &mut report);
                continue;
            }

            match inspect::inspect_device(&self.host, &name) {
                Err(e) => {
                    debug!(
                        device = %name,
                        error = %e,
                        "classification indeterminate, keeping record"
                    );
                }
                Ok(device) if !device.is_managed() => self.release(&name, true, &mut report),
                Ok(device) if self.is_replaced(&name, &device) => {
                    warn!(
                        device = %name,
                        serial = ?device.serial_number,
                        "different device under the same name, releasing old mount"
                    );
                    self.release(&name, false, &mut report);
                }
                Ok(_) => {}
            }
        }

        report
    }

    /// The name now belongs to a device with another serial number.
    fn is_replaced(&self, name: &str, current: &Device) -> bool {
        self.live
            .get(name)
            .is_some_and(|record| record.device.serial_number != current.serial_number)
    }

    /// Unmounts every device in the mapping, e.g. on shutdown.
    ///
    /// Records whose unmount fails stay in the mapping.
    pub fn release_all(&mut self) -> TickReport {
        let mut report = TickReport::default();
        let names: Vec<String> = self.live.keys().cloned().collect();
        for name in names {
            self.release(&name, true, &mut report);
        }
        report
    }

    /// Attempts the Present-Managed-Unmounted to Mounted transition.
    ///
    /// `Ok(None)` means the device is not eligible this tick.
    fn try_mount(&self, name: &str) -> Result<Option<MountRecord>> {
        let mut device = match inspect::inspect_device(&self.host, name) {
            Ok(device) => device,
            Err(e) => {
                debug!(device = name, error = %e, "classification indeterminate");
                return Ok(None);
            }
        };
        if !device.is_managed() {
            return Ok(None);
        }

        if mount::is_mounted(&self.host, name)? {
            debug!(device = name, "already mounted outside this process, leaving alone");
            return Ok(None);
        }

        let Some(fs_type) = inspect::get_filesystem_type(&self.host, name)? else {
            debug!(device = name, "no filesystem found, skipping");
            return Ok(None);
        };

        let Some(mount_point) = self.resolver.resolve_mount_point(&self.host, name)? else {
            return Ok(None);
        };

        let primary_partition = match mount::mount(&self.host, name, &mount_point, &fs_type) {
            Ok(partition) => partition,
            Err(e) => {
                // Only an empty directory is removed; the next attempt recreates it.
                if let Err(rm) = fs::remove_dir(&mount_point) {
                    debug!(path = %mount_point.display(), error = %rm, "left mount point in place");
                }
                return Err(e);
            }
        };

        device.filesystem_type = Some(fs_type);
        Ok(Some(MountRecord {
            device,
            mount_point,
            primary_partition,
        }))
    }

    /// Unmounts a tracked device and drops its record.
    ///
    /// A failed unmount keeps the record while the device is still enumerable;
    /// once the device is gone the record is dropped regardless.
    fn release(&mut self, name: &str, still_present: bool, report: &mut TickReport) {
        let Some(mount_point) = self.live.get(name).map(|r| r.mount_point.clone()) else {
            return;
        };

        match mount::unmount(&self.host, name, &mount_point) {
            Ok(()) => {
                self.live.remove(name);
                report.removed.push(name.to_string());
            }
            Err(e) if still_present => {
                error!(
                    device = name,
                    mount_point = %mount_point.display(),
                    error = %e,
                    "failed to unmount device, keeping record"
                );
                report.failed.push(name.to_string());
            }
            Err(e) => {
                warn!(
                    device = name,
                    mount_point = %mount_point.display(),
                    error = %e,
                    "device removed but unmount failed, dropping record"
                );
                self.live.remove(name);
                report.removed.push(name.to_string());
                report.failed.push(name.to_string());
            }
        }
    }
}
