use anyhow::Result;
use bootsmith_core::{parse_filesystem, BootModeRequest, DeviceGraph, FileSystem};
use bootsmith_engine::{create_boot_drive, CreateParams, Services, DEFAULT_LABEL};
use bootsmith_report::write_report_bundle;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bootsmith", about = "Writes bootable USB drives from install images")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wipe a USB drive and make it boot the given image.
    Create(CreateArgs),
    /// Print the attached-disk graph as JSON.
    Devices {
        #[arg(long)]
        pretty: bool,
    },
}

#[derive(Args)]
struct CreateArgs {
    /// Install image (ISO) to put on the drive.
    #[arg(long)]
    image: PathBuf,

    /// Target volume: a drive letter on Windows, a block device or mount
    /// point on Linux.
    #[arg(long)]
    volume: String,

    /// Firmware to target: auto, bios, or uefi.
    #[arg(long, default_value = "auto", value_parser = parse_boot_mode)]
    boot_mode: BootModeRequest,

    /// Filesystem for the new partition: fat32, ntfs, or exfat.
    #[arg(long, default_value = "fat32", value_parser = parse_fs)]
    filesystem: FileSystem,

    /// Volume label.
    #[arg(long, default_value = DEFAULT_LABEL)]
    label: String,

    /// Directory holding boot-manager sources, overriding detection.
    #[arg(long)]
    source: Option<PathBuf>,

    /// Allow writing to a non-removable disk.
    #[arg(long)]
    force: bool,

    /// Confirmation token acknowledging that the target will be erased.
    #[arg(long)]
    confirm: Option<String>,

    /// Resolve and report the plan without touching the device.
    #[arg(long)]
    dry_run: bool,

    /// Record a SHA-256 manifest of every copied file.
    #[arg(long)]
    hash_manifest: bool,

    /// Where the run-<id> report directory is written.
    #[arg(long, default_value = ".")]
    report_base: PathBuf,
}

fn parse_boot_mode(value: &str) -> Result<BootModeRequest, String> {
    bootsmith_core::parse_boot_mode(value)
        .ok_or_else(|| format!("unknown boot mode '{}'", value))
}

fn parse_fs(value: &str) -> Result<FileSystem, String> {
    parse_filesystem(value).ok_or_else(|| format!("unknown filesystem '{}'", value))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Create(args) => run_create(args),
        Command::Devices { pretty } => run_devices(pretty),
    }
}

fn run_create(args: CreateArgs) -> Result<()> {
    let mut params = CreateParams::new(args.image, args.volume);
    params.boot_mode = args.boot_mode;
    params.filesystem = args.filesystem;
    params.label = args.label;
    params.source_override = args.source;
    params.force = args.force;
    params.confirmation_token = args.confirm;
    params.dry_run = args.dry_run;
    params.hash_manifest = args.hash_manifest;

    let outcome = with_platform_services(|services| Ok(create_boot_drive(&params, services)))?;

    for stage in &outcome.report.stages {
        let state = if stage.success { "ok" } else { "failed" };
        eprintln!("{:>6}  {}: {}", state, stage.stage.as_str(), stage.message);
    }

    let paths = write_report_bundle(
        &args.report_base,
        &outcome.report,
        &outcome.logs,
        outcome.manifest.as_deref(),
    )?;
    println!("report: {}", paths.run_json.display());

    if outcome.report.succeeded() {
        Ok(())
    } else {
        if let Some(failure) = outcome.report.first_failure() {
            eprintln!("{}: {}", failure.stage.as_str(), failure.message);
        }
        std::process::exit(1);
    }
}

fn run_devices(pretty: bool) -> Result<()> {
    let graph = build_device_graph()?;
    if pretty {
        println!("{}", serde_json::to_string_pretty(&graph)?);
    } else {
        println!("{}", serde_json::to_string(&graph)?);
    }
    Ok(())
}

fn with_platform_services<T>(run: impl FnOnce(&Services) -> Result<T>) -> Result<T> {
    #[cfg(windows)]
    {
        let host = bootsmith_host_windows::WindowsServices::new();
        run(&Services {
            host: &host,
            disk: &host,
            mounter: &host,
            boot: &host,
        })
    }
    #[cfg(target_os = "linux")]
    {
        let host = bootsmith_host_linux::LinuxServices::new();
        run(&Services {
            host: &host,
            disk: &host,
            mounter: &host,
            boot: &host,
        })
    }
    #[cfg(not(any(windows, target_os = "linux")))]
    {
        let _ = run;
        Err(anyhow::anyhow!("unsupported OS for drive creation"))
    }
}

fn build_device_graph() -> Result<DeviceGraph> {
    #[cfg(windows)]
    {
        return bootsmith_host_windows::build_device_graph();
    }
    #[cfg(target_os = "linux")]
    {
        return bootsmith_host_linux::build_device_graph();
    }
    #[cfg(not(any(windows, target_os = "linux")))]
    {
        Err(anyhow::anyhow!("unsupported OS for device enumeration"))
    }
}
