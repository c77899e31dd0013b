//! Host capability interface and its process-backed implementation.
//!
//! Everything the reconciler needs from the operating system goes through the
//! [`Host`] trait: enumerating block devices, reading udev properties, probing
//! filesystems and partitions, mounting, unmounting and reading the live mount
//! table. [`CommandHost`] implements it by shelling out to `lsblk`, `udevadm`,
//! `mount` and `umount`, with optional privilege escalation via `pkexec` (GUI)
//! or `sudo` (TTY) for the commands that need root.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

/// Default location of the kernel's mounted-filesystem table.
pub const MOUNT_TABLE_PATH: &str = "/proc/mounts";

/// Operations the core performs against the host system.
///
/// Query methods return the raw command output; parsing lives in
/// [`crate::inspect`] and [`crate::mount`] so that it can be tested
/// without a real system.
pub trait Host {
    /// Lists top-level block device names, one per line, excluding the given
    /// major-number classes.
    fn list_block_devices(&self, excluded_majors: &[u32]) -> Result<String>;

    /// Returns the `KEY=VALUE` udev property dump for a device name.
    fn device_properties(&self, name: &str) -> Result<String>;

    /// Returns the filesystem type column for a device name and its descendants.
    fn filesystem_type(&self, name: &str) -> Result<String>;

    /// Returns `PATH TYPE` lines for a device path and its descendants.
    fn list_partitions(&self, device_path: &str) -> Result<String>;

    /// Attaches `partition` at `mount_point` using filesystem `fs_type`.
    fn mount(&self, fs_type: &str, partition: &str, mount_point: &Path) -> Result<()>;

    /// Lazily detaches whatever is mounted at `mount_point`.
    fn unmount(&self, mount_point: &Path) -> Result<()>;

    /// Returns the contents of the live mount table.
    fn mount_table(&self) -> Result<String>;
}

/// Privilege escalation method for executing commands that require root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeEscalation {
    /// Execute directly without privilege escalation.
    #[default]
    None,
    /// Use `pkexec` for GUI-based privilege escalation (polkit).
    Pkexec,
    /// Use `sudo` for TTY-based privilege escalation.
    Sudo,
}

impl PrivilegeEscalation {
    fn wrapper(self) -> Option<&'static str> {
        match self {
            PrivilegeEscalation::None => None,
            PrivilegeEscalation::Pkexec => Some("pkexec"),
            PrivilegeEscalation::Sudo => Some("sudo"),
        }
    }
}

/// [`Host`] backed by real system commands.
///
/// # Example
///
/// ```
/// use steamos_usb_mount_core::executor::{CommandHost, PrivilegeEscalation};
///
/// // Default: no privilege escalation
/// let host = CommandHost::default();
/// assert_eq!(host.escalation(), PrivilegeEscalation::None);
///
/// // For terminal applications
/// let tty_host = CommandHost::with_escalation(PrivilegeEscalation::Sudo);
/// assert_eq!(tty_host.escalation(), PrivilegeEscalation::Sudo);
/// ```
#[derive(Debug, Clone)]
pub struct CommandHost {
    escalation: PrivilegeEscalation,
    mount_table_path: PathBuf,
}

impl Default for CommandHost {
    fn default() -> Self {
        Self {
            escalation: PrivilegeEscalation::None,
            mount_table_path: PathBuf::from(MOUNT_TABLE_PATH),
        }
    }
}

impl CommandHost {
    /// Creates a host with no privilege escalation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a host with a specific escalation method for mount and unmount.
    pub fn with_escalation(escalation: PrivilegeEscalation) -> Self {
        Self {
            escalation,
            ..Self::default()
        }
    }

    /// Returns the current privilege escalation method.
    pub fn escalation(&self) -> PrivilegeEscalation {
        self.escalation
    }

    /// Executes a command that requires root privileges, checking for success.
    ///
    /// Returns an error if the command fails or if authentication is cancelled.
    fn run_privileged_checked(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let output = match self.escalation.wrapper() {
            None => run_command(cmd, args)?,
            Some(wrapper) => run_with_wrapper(wrapper, cmd, args)?,
        };

        // pkexec returns 126 when the dialog is dismissed
        if self.escalation == PrivilegeEscalation::Pkexec && output.status.code() == Some(126) {
            return Err(Error::AuthenticationCancelled);
        }

        check_output(cmd, output)
    }
}

impl Host for CommandHost {
    fn list_block_devices(&self, excluded_majors: &[u32]) -> Result<String> {
        let mut args = vec!["-ndo".to_string(), "NAME".to_string()];
        if !excluded_majors.is_empty() {
            let majors: Vec<String> = excluded_majors.iter().map(|m| m.to_string()).collect();
            args.push(format!("-e{}", majors.join(",")));
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_checked("lsblk", &args)
    }

    fn device_properties(&self, name: &str) -> Result<String> {
        run_checked("udevadm", &["info", "-q", "property", "-n", name])
    }

    fn filesystem_type(&self, name: &str) -> Result<String> {
        let device_path = format!("/dev/{}", name);
        run_checked("lsblk", &["-no", "FSTYPE", &device_path])
    }

    fn list_partitions(&self, device_path: &str) -> Result<String> {
        run_checked("lsblk", &["-lnpo", "NAME,TYPE", device_path])
    }

    fn mount(&self, fs_type: &str, partition: &str, mount_point: &Path) -> Result<()> {
        let target = mount_point.to_string_lossy();
        self.run_privileged_checked("mount", &["-t", fs_type, partition, &target])?;
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        let target = mount_point.to_string_lossy();
        self.run_privileged_checked("umount", &["--lazy", &target])?;
        Ok(())
    }

    fn mount_table(&self) -> Result<String> {
        fs::read_to_string(&self.mount_table_path).map_err(|e| Error::MountTable {
            path: self.mount_table_path.clone(),
            source: e,
        })
    }
}

/// Runs a command directly and returns its stdout if it exited successfully.
fn run_checked(cmd: &str, args: &[&str]) -> Result<String> {
    let output = run_command(cmd, args)?;
    check_output(cmd, output)
}

fn check_output(cmd: &str, output: Output) -> Result<String> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(Error::CommandExit {
            command: cmd.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Runs a command directly without any wrapper.
fn run_command(cmd: &str, args: &[&str]) -> Result<Output> {
    Command::new(cmd).args(args).output().command_context(cmd)
}

/// Runs a command with a privilege escalation wrapper (pkexec or sudo).
fn run_with_wrapper(wrapper: &str, cmd: &str, args: &[&str]) -> Result<Output> {
    let mut wrapper_args = vec![cmd];
    wrapper_args.extend(args);

    Command::new(wrapper)
        .args(&wrapper_args)
        .output()
        .command_context(format!("{} {}", wrapper, cmd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_host() {
        let host = CommandHost::default();
        assert_eq!(host.escalation(), PrivilegeEscalation::None);
        assert_eq!(host.mount_table_path, PathBuf::from("/proc/mounts"));
    }

    #[test]
    fn test_escalation_wrapper() {
        assert_eq!(PrivilegeEscalation::None.wrapper(), None);
        assert_eq!(PrivilegeEscalation::Pkexec.wrapper(), Some("pkexec"));
        assert_eq!(PrivilegeEscalation::Sudo.wrapper(), Some("sudo"));
    }

    #[test]
    fn test_escalation_serde_names() {
        let parsed: PrivilegeEscalation = serde_json::from_str("\"pkexec\"").unwrap();
        assert_eq!(parsed, PrivilegeEscalation::Pkexec);
        assert_eq!(
            serde_json::to_string(&PrivilegeEscalation::Sudo).unwrap(),
            "\"sudo\""
        );
    }

    #[test]
    fn test_missing_command_is_execution_error() {
        let err = run_checked("definitely-not-a-real-command-xyz", &[]).unwrap_err();
        assert!(matches!(err, Error::CommandExecution { .. }));
    }

    #[test]
    fn test_mount_table_read_error() {
        let host = CommandHost {
            escalation: PrivilegeEscalation::None,
            mount_table_path: PathBuf::from("/nonexistent/mounts"),
        };
        assert!(matches!(
            host.mount_table().unwrap_err(),
            Error::MountTable { .. }
        ));
    }
}
