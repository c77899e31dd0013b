//! Mount point resolution and mount operations.
//!
//! Mount points are derived from the device's hardware serial number so that
//! a stick plugged back in later lands on the same directory. Mounting
//! attaches the device's primary partition; unmounting lazily detaches it and
//! removes the directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, IoResultExt, Result};
use crate::executor::Host;
use crate::inspect::{self, PROP_SERIAL_SHORT};

/// Default directory under which removable media is mounted.
pub const DEFAULT_MEDIA_ROOT: &str = "/run/media";

/// Derives deterministic mount points from serial numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPointResolver {
    media_root: PathBuf,
}

impl Default for MountPointResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MEDIA_ROOT)
    }
}

impl MountPointResolver {
    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        Self {
            media_root: media_root.into(),
        }
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    /// Returns `<media_root>/<serial>`, with the serial sanitized to one path component.
    pub fn mount_point_for_serial(&self, serial: &str) -> PathBuf {
        self.media_root.join(sanitize_mount_name(serial))
    }

    /// Computes the mount point for a device without touching the filesystem.
    ///
    /// Returns `None` if the device reports no serial number.
    pub fn mount_point_for(&self, host: &impl Host, name: &str) -> Result<Option<PathBuf>> {
        let serial = inspect::get_property(host, name, PROP_SERIAL_SHORT)?;

        Ok(serial
            .filter(|s| !s.trim().is_empty())
            .map(|s| self.mount_point_for_serial(s.trim())))
    }

    /// Computes the mount point for a device and makes sure the directory exists.
    pub fn resolve_mount_point(&self, host: &impl Host, name: &str) -> Result<Option<PathBuf>> {
        let Some(mount_point) = self.mount_point_for(host, name)? else {
            debug!(device = name, "no serial number, cannot derive a mount point");
            return Ok(None);
        };

        create_mount_point(&mount_point)?;
        Ok(Some(mount_point))
    }
}

/// Sanitize a string for use as a mount point directory name.
///
/// Anything outside `[A-Za-z0-9_-]` becomes an underscore.
fn sanitize_mount_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Creates a mount point directory if it doesn't exist.
pub fn create_mount_point(path: &Path) -> Result<()> {
    fs::create_dir_all(path).mount_point_context(path)
}

/// Mounts the primary partition of `device` at `mount_point`.
///
/// Returns the partition path that was mounted. A device without partitions
/// fails with [`Error::NoPartitionFound`] before anything is attached.
pub fn mount(
    host: &impl Host,
    device: &str,
    mount_point: &Path,
    filesystem_type: &str,
) -> Result<String> {
    let device_path = inspect::device_path(device);
    let partition = inspect::get_primary_partition(host, &device_path)?;

    create_mount_point(mount_point)?;

    host.mount(filesystem_type, &partition, mount_point)
        .map_err(|e| Error::MountFailed {
            device: device.to_string(),
            mount_point: mount_point.to_path_buf(),
            message: e.to_string(),
        })?;

    info!(
        device,
        partition = %partition,
        mount_point = %mount_point.display(),
        "USB mounted"
    );
    Ok(partition)
}

/// Lazily unmounts `mount_point` and removes the directory.
///
/// The directory is only removed once the detach succeeded.
pub fn unmount(host: &impl Host, device: &str, mount_point: &Path) -> Result<()> {
    host.unmount(mount_point).map_err(|e| Error::UnmountFailed {
        device: device.to_string(),
        mount_point: mount_point.to_path_buf(),
        message: e.to_string(),
    })?;

    match fs::remove_dir_all(mount_point) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::MountPointRemoval {
                path: mount_point.to_path_buf(),
                source: e,
            });
        }
    }

    info!(device, mount_point = %mount_point.display(), "USB unmounted");
    Ok(())
}

/// One line of the mounted-filesystems table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fs_type: String,
}

/// Parses `/proc/mounts` content. Lines with fewer than three fields are skipped.
pub fn parse_mount_table(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                source: unescape_mount_field(source),
                target: PathBuf::from(unescape_mount_field(target)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

/// Returns true if the device, or one of its partitions, is in the live mount table.
pub fn is_mounted(host: &impl Host, device: &str) -> Result<bool> {
    Ok(find_mount(host, device)?.is_some())
}

/// Returns the first mount table entry belonging to the device or its partitions.
pub fn find_mount(host: &impl Host, device: &str) -> Result<Option<MountEntry>> {
    let device_path = inspect::device_path(device);
    let table = host.mount_table()?;

    Ok(parse_mount_table(&table)
        .into_iter()
        .find(|entry| belongs_to_device(&entry.source, &device_path)))
}

/// Matches `/dev/sda` against `/dev/sda` and `/dev/sda1`, and `/dev/nvme0n1`
/// against `/dev/nvme0n1p1`, but not `/dev/sdaa1`.
fn belongs_to_device(source: &str, device_path: &str) -> bool {
    let Some(rest) = source.strip_prefix(device_path) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }

    let digits = match rest.strip_prefix('p') {
        Some(after_p) if device_path.ends_with(|c: char| c.is_ascii_digit()) => after_p,
        _ => rest,
    };
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// Unescapes octal sequences (`\040` for space) used in the mount table.
fn unescape_mount_field(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            let octal: String = chars.clone().take(3).collect();
            if octal.len() == 3
                && octal.chars().all(|d| d.is_digit(8))
                && let Ok(byte) = u8::from_str_radix(&octal, 8)
            {
                result.push(byte as char);
                for _ in 0..3 {
                    chars.next();
                }
                continue;
            }
        }
        result.push(c);
    }
    result
}
