//! SteamOS USB Mount CLI - Command line interface for USB auto-mounting.
//!
//! `monitor` runs the reconciliation loop in the foreground until Ctrl+C.
//! The other commands query devices or perform one-shot operations.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use nix::unistd::Uid;
use steamos_usb_mount_core::{
    CommandHost, CommandOutcome, Config, DeviceService, Error, MountPointResolver,
    PrivilegeEscalation, Reconciler, Result, Snapshot, inspect, logging, monitor, steam,
};
use tracing::{info, warn};

/// SteamOS USB Mount CLI tool.
#[derive(Parser)]
#[command(name = "steamos-usb-mount")]
#[command(
    about = "Automatically mount USB drives and register Steam libraries",
    long_about = None
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(long)]
    log_level: Option<String>,

    /// Privilege escalation for mount and umount (none, pkexec, sudo)
    #[arg(long, value_parser = parse_escalation)]
    escalation: Option<PrivilegeEscalation>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch for USB drives and mount them until interrupted.
    Monitor,

    /// List attached USB storage devices.
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Mount a device's primary partition.
    Mount {
        /// Kernel device name (e.g., sda)
        device: String,
        /// Defaults to `<media_root>/<serial>`
        #[arg(long)]
        mount_point: Option<PathBuf>,
        /// Defaults to the probed filesystem type
        #[arg(long)]
        filesystem: Option<String>,
    },

    /// Unmount a device and remove its mount point.
    Unmount {
        /// Kernel device name (e.g., sda)
        device: String,
        /// Defaults to `<media_root>/<serial>`
        #[arg(long)]
        mount_point: Option<PathBuf>,
    },

    /// Register a mounted drive as a Steam library folder.
    AddLibrary {
        mount_point: PathBuf,
        /// Stop Steam if it is running and relaunch it afterwards
        #[arg(long)]
        restart_steam: bool,
    },

    /// Check whether a directory holds a Steam library.
    VerifyLibrary {
        mount_point: PathBuf,
    },

    /// List library folders registered with Steam.
    Libraries,
}

fn parse_escalation(value: &str) -> std::result::Result<PrivilegeEscalation, String> {
    match value {
        "none" => Ok(PrivilegeEscalation::None),
        "pkexec" => Ok(PrivilegeEscalation::Pkexec),
        "sudo" => Ok(PrivilegeEscalation::Sudo),
        other => Err(format!("unknown escalation method '{other}'")),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(escalation) = cli.escalation {
        config.escalation = escalation;
    }

    logging::setup_logging(&config.log_level)?;

    let host = CommandHost::with_escalation(config.escalation);
    let service = DeviceService::new(host.clone(), resolver(&config))
        .with_excluded_majors(config.monitor.excluded_majors.clone())
        .with_registry_path(config.steam.registry_path.clone())
        .with_registry_backup(config.steam.backup);

    match cli.command {
        Commands::Monitor => {
            run_monitor(host, &config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::List { json } => {
            let devices = service.list_usb_devices(&Snapshot::new());
            if json {
                match serde_json::to_string_pretty(&devices) {
                    Ok(output) => println!("{}", output),
                    Err(e) => {
                        eprintln!("Failed to serialize devices: {}", e);
                        return Ok(ExitCode::FAILURE);
                    }
                }
            } else if devices.is_empty() {
                println!("No USB storage devices found");
            } else {
                println!(
                    "{:<10} {:<24} {:<8} {:<8} MOUNT POINT",
                    "DEVICE", "SERIAL", "FS", "MOUNTED"
                );
                for device in &devices {
                    let filesystem = if device.filesystem.is_empty() {
                        "-"
                    } else {
                        device.filesystem.as_str()
                    };
                    println!(
                        "{:<10} {:<24} {:<8} {:<8} {}",
                        device.device_path,
                        device.serial_number.as_deref().unwrap_or("-"),
                        filesystem,
                        if device.is_mounted { "yes" } else { "no" },
                        device
                            .mount_point
                            .as_ref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| "-".to_string()),
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Mount {
            device,
            mount_point,
            filesystem,
        } => {
            warn_if_unprivileged(config.escalation);
            let mount_point = match mount_point {
                Some(path) => path,
                None => default_mount_point(&service, &device)?,
            };
            let filesystem = match filesystem {
                Some(fs) => fs,
                None => inspect::get_filesystem_type(service.host(), &device)?
                    .ok_or_else(|| Error::NoPartitionFound {
                        device: inspect::device_path(&device),
                    })?,
            };
            Ok(report(service.mount_usb(&device, &mount_point, &filesystem)))
        }
        Commands::Unmount {
            device,
            mount_point,
        } => {
            warn_if_unprivileged(config.escalation);
            let mount_point = match mount_point {
                Some(path) => path,
                None => default_mount_point(&service, &device)?,
            };
            Ok(report(service.unmount_usb(&device, &mount_point)))
        }
        Commands::AddLibrary {
            mount_point,
            restart_steam,
        } => {
            let service = service.with_steam_restart(restart_steam || config.steam.restart_steam);
            Ok(report(service.add_library(&mount_point)))
        }
        Commands::VerifyLibrary { mount_point } => {
            if service.verify_library(&mount_point) {
                println!("{} is a Steam library", mount_point.display());
                Ok(ExitCode::SUCCESS)
            } else {
                println!("{} is not a Steam library", mount_point.display());
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Libraries => {
            let registry = service.registry_path()?;
            for (id, folder) in steam::parse_library_folders(&registry)? {
                println!("{:<4} {}", id, folder.path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_monitor(host: CommandHost, config: &Config) -> Result<()> {
    warn_if_unprivileged(config.escalation);

    let reconciler = Reconciler::new(host, resolver(config))
        .with_excluded_majors(config.monitor.excluded_majors.clone());
    let handle = monitor::spawn(reconciler, config.monitor.poll_interval());

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl+C, stopping");
    }
    info!("Shutdown requested");

    let mut reconciler = handle.shutdown().await?;
    if config.monitor.unmount_on_exit {
        let released = reconciler.release_all();
        info!(
            unmounted = ?released.removed,
            failed = ?released.failed,
            "Released managed devices"
        );
    }
    Ok(())
}

fn resolver(config: &Config) -> MountPointResolver {
    MountPointResolver::new(config.monitor.media_root.clone())
}

fn default_mount_point(service: &DeviceService<CommandHost>, device: &str) -> Result<PathBuf> {
    service
        .resolver()
        .mount_point_for(service.host(), device)?
        .ok_or_else(|| Error::MountFailed {
            device: device.to_string(),
            mount_point: PathBuf::new(),
            message: "device reports no serial number, pass --mount-point".to_string(),
        })
}

fn warn_if_unprivileged(escalation: PrivilegeEscalation) {
    if escalation == PrivilegeEscalation::None && !Uid::effective().is_root() {
        warn!("Not running as root; mount and umount will likely fail");
    }
}

fn report(outcome: CommandOutcome) -> ExitCode {
    match outcome.error {
        None => ExitCode::SUCCESS,
        Some(message) => {
            eprintln!("Error: {}", message);
            ExitCode::FAILURE
        }
    }
}
