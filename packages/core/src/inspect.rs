//! Block device inspection using `lsblk` and `udevadm`.
//!
//! This module enumerates the top-level block devices on the system and
//! classifies each one as removable USB storage (managed by this tool) or not.
//! All command output is parsed here, tolerating malformed lines.

use std::collections::HashMap;

use snafu::ResultExt;
use tracing::{debug, trace};

use crate::error::{ClassificationIndeterminateSnafu, EnumerationSnafu, Error, Result};
use crate::executor::Host;

/// Major numbers excluded from enumeration: loop devices (7) and SCSI CD-ROM (11).
pub const DEFAULT_EXCLUDED_MAJORS: [u32; 2] = [7, 11];

/// udev property carrying the bus a device is attached through.
pub const PROP_BUS: &str = "ID_BUS";
/// udev property present on optical drives.
pub const PROP_CDROM: &str = "ID_CDROM";
/// udev property describing the device type (`disk`, `cd`, ...).
pub const PROP_TYPE: &str = "ID_TYPE";
/// udev property carrying the short hardware serial number.
pub const PROP_SERIAL_SHORT: &str = "ID_SERIAL_SHORT";

/// Bus a block device is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    Usb,
    Other,
}

impl Bus {
    fn from_property(value: Option<&str>) -> Self {
        match value {
            Some(bus) if bus.trim().eq_ignore_ascii_case("usb") => Bus::Usb,
            _ => Bus::Other,
        }
    }
}

/// A top-level block device as seen by udev.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Kernel device name (e.g., "sda"). Unique among enumerated devices only.
    pub name: String,
    /// Bus the device is attached through.
    pub bus: Bus,
    /// Whether the device is an optical drive.
    pub is_optical_media: bool,
    /// Hardware-reported short serial, used as the mount path key.
    pub serial_number: Option<String>,
    /// Filesystem type, empty until a partition is probed.
    pub filesystem_type: Option<String>,
}

impl Device {
    /// Builds a device from its parsed udev properties.
    pub fn from_properties(name: impl Into<String>, properties: &HashMap<String, String>) -> Self {
        let is_optical_media = properties.contains_key(PROP_CDROM)
            || properties.get(PROP_TYPE).map(String::as_str) == Some("cd");

        Self {
            name: name.into(),
            bus: Bus::from_property(properties.get(PROP_BUS).map(String::as_str)),
            is_optical_media,
            serial_number: properties
                .get(PROP_SERIAL_SHORT)
                .filter(|s| !s.is_empty())
                .cloned(),
            filesystem_type: None,
        }
    }

    /// Returns true if this tool manages the device: USB-attached and not optical.
    pub fn is_managed(&self) -> bool {
        self.bus == Bus::Usb && !self.is_optical_media
    }

    /// Full device node path (e.g., "/dev/sda").
    pub fn path(&self) -> String {
        device_path(&self.name)
    }
}

/// Returns the device node path for a kernel device name.
pub fn device_path(name: &str) -> String {
    if name.starts_with("/dev/") {
        name.to_string()
    } else {
        format!("/dev/{}", name)
    }
}

/// Parses a newline-delimited `KEY=VALUE` property dump.
///
/// Lines without exactly one `=` are skipped.
pub fn parse_properties(dump: &str) -> HashMap<String, String> {
    let mut properties = HashMap::new();

    for line in dump.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.split('=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) if !key.is_empty() => {
                properties.insert(key.to_string(), value.to_string());
            }
            _ => trace!(line, "skipping malformed property line"),
        }
    }

    properties
}

/// Lists top-level block device names.
pub fn list_block_devices(host: &impl Host, excluded_majors: &[u32]) -> Result<Vec<String>> {
    let output = host
        .list_block_devices(excluded_majors)
        .context(EnumerationSnafu)?;

    Ok(output
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect())
}

/// Reads udev properties for a device and builds a [`Device`].
pub fn inspect_device(host: &impl Host, name: &str) -> Result<Device> {
    let dump = host
        .device_properties(name)
        .context(ClassificationIndeterminateSnafu { device: name })?;

    Ok(Device::from_properties(name, &parse_properties(&dump)))
}

/// Returns true if the device is USB-attached, non-optical storage.
///
/// Any failure to read properties (device vanished, permission denied, ...)
/// classifies the device as unmanaged.
pub fn is_managed_usb(host: &impl Host, name: &str) -> bool {
    match inspect_device(host, name) {
        Ok(device) => device.is_managed(),
        Err(e) => {
            debug!(device = name, error = %e, "treating device as unmanaged");
            false
        }
    }
}

/// Looks up a single udev property for a device.
pub fn get_property(host: &impl Host, name: &str, key: &str) -> Result<Option<String>> {
    let dump = host
        .device_properties(name)
        .context(ClassificationIndeterminateSnafu { device: name })?;

    Ok(parse_properties(&dump).remove(key))
}

/// Returns the filesystem type of a device, or `None` if it has no formatted partition.
///
/// `lsblk` prints one line per node (disk first, then partitions); the first
/// non-empty value wins.
pub fn get_filesystem_type(host: &impl Host, name: &str) -> Result<Option<String>> {
    let output = host.filesystem_type(name)?;

    Ok(output
        .lines()
        .map(str::trim)
        .find(|fs| !fs.is_empty())
        .map(String::from))
}

/// Returns the path of the first descendant of `device_path` with type "part".
pub fn get_primary_partition(host: &impl Host, device_path: &str) -> Result<String> {
    let output = host.list_partitions(device_path)?;

    parse_primary_partition(&output).ok_or_else(|| Error::NoPartitionFound {
        device: device_path.to_string(),
    })
}

fn parse_primary_partition(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(path), Some("part")) => Some(path.to_string()),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    const USB_PROPERTIES: &str = "DEVPATH=/devices/pci0000:00/usb1/1-1/block/sda
DEVNAME=/dev/sda
DEVTYPE=disk
ID_BUS=usb
ID_MODEL=Ultra
ID_SERIAL=SanDisk_Ultra_ABC123-0:0
ID_SERIAL_SHORT=ABC123
ID_TYPE=disk
";

    #[test]
    fn test_parse_properties() {
        let props = parse_properties(USB_PROPERTIES);
        assert_eq!(props.get("ID_BUS"), Some(&"usb".to_string()));
        assert_eq!(props.get("ID_SERIAL_SHORT"), Some(&"ABC123".to_string()));
        assert_eq!(props.len(), 8);
    }

    #[test]
    fn test_parse_properties_skips_malformed_lines() {
        let dump = "ID_BUS=usb\nGARBAGE LINE\nID_SERIAL_SHORT=XYZ\nA=B=C\n=novalue\n";
        let props = parse_properties(dump);

        assert_eq!(props.len(), 2);
        assert_eq!(props.get("ID_BUS"), Some(&"usb".to_string()));
        assert_eq!(props.get("ID_SERIAL_SHORT"), Some(&"XYZ".to_string()));
    }

    #[test]
    fn test_device_classification() {
        let usb = Device::from_properties("sda", &parse_properties(USB_PROPERTIES));
        assert_eq!(usb.bus, Bus::Usb);
        assert!(!usb.is_optical_media);
        assert_eq!(usb.serial_number.as_deref(), Some("ABC123"));
        assert!(usb.is_managed());
        assert_eq!(usb.path(), "/dev/sda");

        let optical = Device::from_properties(
            "sr1",
            &parse_properties("ID_BUS=usb\nID_CDROM=1\nID_TYPE=cd\n"),
        );
        assert!(optical.is_optical_media);
        assert!(!optical.is_managed());

        let sata = Device::from_properties("nvme0n1", &parse_properties("ID_BUS=ata\n"));
        assert_eq!(sata.bus, Bus::Other);
        assert!(!sata.is_managed());
    }

    #[test]
    fn test_empty_serial_is_none() {
        let device = Device::from_properties("sda", &parse_properties("ID_SERIAL_SHORT=\n"));
        assert_eq!(device.serial_number, None);
    }

    #[test]
    fn test_list_block_devices() {
        let host = FakeHost::new();
        host.add_usb_device("sda", "ABC123", "ext4");
        host.add_other_device("nvme0n1");

        let devices = list_block_devices(&host, &DEFAULT_EXCLUDED_MAJORS).unwrap();
        assert_eq!(devices, vec!["nvme0n1".to_string(), "sda".to_string()]);
    }

    #[test]
    fn test_list_block_devices_enumeration_error() {
        let host = FakeHost::new();
        host.fail_enumeration(true);

        let err = list_block_devices(&host, &DEFAULT_EXCLUDED_MAJORS).unwrap_err();
        assert!(matches!(err, Error::Enumeration { .. }));
    }

    #[test]
    fn test_is_managed_usb_false_on_lookup_failure() {
        let host = FakeHost::new();
        assert!(!is_managed_usb(&host, "sdz"));

        host.add_usb_device("sda", "ABC123", "ext4");
        assert!(is_managed_usb(&host, "sda"));
    }

    #[test]
    fn test_get_property() {
        let host = FakeHost::new();
        host.add_usb_device("sda", "ABC123", "ext4");

        assert_eq!(
            get_property(&host, "sda", PROP_SERIAL_SHORT).unwrap(),
            Some("ABC123".to_string())
        );
        assert_eq!(get_property(&host, "sda", "ID_MISSING").unwrap(), None);
        assert!(matches!(
            get_property(&host, "sdz", PROP_BUS).unwrap_err(),
            Error::ClassificationIndeterminate { .. }
        ));
    }

    #[test]
    fn test_get_filesystem_type() {
        let host = FakeHost::new();
        host.add_usb_device("sda", "ABC123", "exfat");
        host.add_usb_device("sdb", "RAW001", "");

        assert_eq!(
            get_filesystem_type(&host, "sda").unwrap(),
            Some("exfat".to_string())
        );
        assert_eq!(get_filesystem_type(&host, "sdb").unwrap(), None);
    }

    #[test]
    fn test_parse_primary_partition() {
        let output = "/dev/sda  disk\n/dev/sda1 part\n/dev/sda2 part\n";
        assert_eq!(
            parse_primary_partition(output),
            Some("/dev/sda1".to_string())
        );

        // Malformed lines are skipped
        let output = "garbage\n/dev/sdb disk\n/dev/sdb1 part\n";
        assert_eq!(
            parse_primary_partition(output),
            Some("/dev/sdb1".to_string())
        );

        assert_eq!(parse_primary_partition("/dev/sdc disk\n"), None);
    }

    #[test]
    fn test_get_primary_partition_none_found() {
        let host = FakeHost::new();
        host.add_usb_device("sdb", "RAW001", "");

        let err = get_primary_partition(&host, "/dev/sdb").unwrap_err();
        assert!(matches!(err, Error::NoPartitionFound { .. }));
    }
}
