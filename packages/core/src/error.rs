//! Unified error types for the steamos-usb-mount-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Failed to execute a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {stderr}"))]
    CommandExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// User cancelled authentication dialog.
    #[snafu(display("authentication cancelled by user"))]
    AuthenticationCancelled,

    /// Block device enumeration is unavailable.
    #[snafu(display("failed to enumerate block devices"))]
    Enumeration {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// Device properties could not be read, so the device cannot be classified.
    #[snafu(display("cannot classify device {device}"))]
    ClassificationIndeterminate {
        device: String,
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// Device has no partition of type "part".
    #[snafu(display("no partition found on {device}"))]
    NoPartitionFound { device: String },

    /// Mount point creation failed.
    #[snafu(display("failed to create mount point at {}", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Mount point directory could not be removed after detaching.
    #[snafu(display("failed to remove mount point at {}", path.display()))]
    MountPointRemoval {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Mount operation failed.
    #[snafu(display("failed to mount {device} at {}: {message}", mount_point.display()))]
    MountFailed {
        device: String,
        mount_point: PathBuf,
        message: String,
    },

    /// Unmount operation failed.
    #[snafu(display("failed to unmount {device} from {}: {message}", mount_point.display()))]
    UnmountFailed {
        device: String,
        mount_point: PathBuf,
        message: String,
    },

    /// The live mount table could not be read.
    #[snafu(display("failed to read mount table at {}", path.display()))]
    MountTable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Home directory not found.
    #[snafu(display("Could not determine home directory"))]
    HomeDirNotFound,

    /// Steam library folders VDF not found.
    #[snafu(display("Steam library folders VDF not found at {}", path.display()))]
    SteamVdfNotFound { path: PathBuf },

    /// Steam would overwrite the registry on exit.
    #[snafu(display("Steam is running; close it or allow a restart to register the library"))]
    SteamRunning,

    /// Steam process control error.
    #[snafu(display("Steam process control error: {message}"))]
    SteamProcess { message: String },

    /// Failed to read a VDF file (registry or library metadata).
    #[snafu(display("failed to read VDF at {}", path.display()))]
    RegistryRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write Steam VDF file.
    #[snafu(display("failed to write Steam VDF at {}", path.display()))]
    RegistryWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to create backup.
    #[snafu(display("failed to create backup at {}", path.display()))]
    Backup {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Per-library metadata file lacks the expected block.
    #[snafu(display("malformed library metadata at {}: {message}", path.display()))]
    MalformedMetadata { path: PathBuf, message: String },

    /// Registry file has no outer structure to append into.
    #[snafu(display("invalid library registry at {}: {message}", path.display()))]
    InvalidRegistryFormat { path: PathBuf, message: String },

    /// Failed to parse Steam VDF file.
    #[snafu(display("failed to parse Steam VDF: {message}"))]
    VdfParse { message: String },

    /// Configuration file cannot be read.
    #[snafu(display("failed to read config at {}", path.display()))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML for [`crate::config::Config`].
    #[snafu(display("failed to parse config at {}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Configuration file cannot be written.
    #[snafu(display("failed to write config at {}: {message}", path.display()))]
    ConfigWrite { path: PathBuf, message: String },

    /// Logging could not be initialised.
    #[snafu(display("failed to set up logging: {message}"))]
    Logging { message: String },

    /// The monitor task stopped abnormally.
    #[snafu(display("monitor task failed: {message}"))]
    Monitor { message: String },
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for mount point creation errors.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for VDF read errors.
    fn vdf_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for VDF write errors.
    fn vdf_write_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for backup errors.
    fn backup_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }

    fn vdf_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(RegistryReadSnafu { path: path.into() })
    }

    fn vdf_write_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(RegistryWriteSnafu { path: path.into() })
    }

    fn backup_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(BackupSnafu { path: path.into() })
    }
}
