//! steamos-usb-mount-core: Core library for USB storage auto-mounting on SteamOS.
//!
//! This library watches attached block devices, mounts USB mass-storage media
//! under a per-serial directory, unmounts them when they disappear, and
//! registers mounted drives as Steam library folders.
//!
//! # Modules
//!
//! - [`executor`]: Host capabilities (`lsblk`, `udevadm`, `mount`, `umount`)
//! - [`inspect`]: Device enumeration and classification
//! - [`mount`]: Mount point resolution, mount/unmount, mount table queries
//! - [`reconcile`]: Per-tick reconciliation of devices and mounts
//! - [`monitor`]: Background task running the reconciler periodically
//! - [`device`]: Caller-facing device queries and commands
//! - [`steam`]: Steam library registry editing
//! - [`config`]: TOML configuration
//! - [`logging`]: Tracing subscriber setup
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use steamos_usb_mount_core::{CommandHost, MountPointResolver, Reconciler};
//!
//! let mut reconciler = Reconciler::new(CommandHost::new(), MountPointResolver::default());
//! let report = reconciler.tick();
//! for name in &report.mounted {
//!     println!("mounted {name} at {}", reconciler.live()[name].mount_point.display());
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod inspect;
pub mod logging;
pub mod monitor;
pub mod mount;
pub mod reconcile;
pub mod steam;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::Config;
pub use device::{CommandOutcome, DeviceService, UsbDeviceInfo};
pub use error::{Error, Result};
pub use executor::{CommandHost, Host, PrivilegeEscalation};
pub use inspect::Device;
pub use monitor::MonitorHandle;
pub use mount::MountPointResolver;
pub use reconcile::{MountRecord, Reconciler, Snapshot, TickReport};
pub use steam::LibraryFolder;
