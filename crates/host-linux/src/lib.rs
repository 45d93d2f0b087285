//! Linux implementations of the platform services: a sysfs device graph,
//! parted/mkfs device preparation, loop mounts for images, and
//! grub-install/syslinux boot services.

use anyhow::{anyhow, bail, Context, Result};
use bootsmith_bootloader::{BOOTSECT_ENV_OVERRIDE, SECTOR_TOOL_ALTERNATES, SECTOR_TOOL_NAME};
use bootsmith_core::{
    DeviceGraph, DeviceTarget, Disk, FileSystem, HostInfo, Partition, PartitionScheme,
};
use bootsmith_engine::{BootServices, DiskPreparer, HostContext, ImageMounter, ServiceExit};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

pub fn build_device_graph() -> Result<DeviceGraph> {
    let host = HostInfo {
        os: "linux".to_string(),
        os_version: read_os_release(),
        machine: read_machine(),
    };
    let disks = enumerate_disks()?;
    Ok(DeviceGraph::new(host, disks))
}

/// The Linux service bundle handed to the engine. Image mounts are tracked
/// by image path so unmount can find the loop mountpoint again; target-volume
/// mounts made by `format_volume` are tracked too and flushed and released
/// when the bundle is dropped at the end of the run.
pub struct LinuxServices {
    mounts: Mutex<HashMap<PathBuf, PathBuf>>,
    volume_mounts: Mutex<Vec<PathBuf>>,
}

impl LinuxServices {
    pub fn new() -> Self {
        Self {
            mounts: Mutex::new(HashMap::new()),
            volume_mounts: Mutex::new(Vec::new()),
        }
    }

    fn take_volume_mounts(&self) -> Vec<PathBuf> {
        std::mem::take(&mut *self.volume_mounts.lock().expect("volume table poisoned"))
    }

    /// Syncs written data and unmounts every target volume this run mounted.
    pub fn release_volumes(&self) {
        let mounts = self.take_volume_mounts();
        if mounts.is_empty() {
            return;
        }
        let _ = run_checked("sync", &[]);
        for mountpoint in mounts {
            let _ = run_checked("umount", &[&mountpoint.display().to_string()]);
            let _ = fs::remove_dir(&mountpoint);
        }
    }
}

impl Drop for LinuxServices {
    fn drop(&mut self) {
        self.release_volumes();
    }
}

impl Default for LinuxServices {
    fn default() -> Self {
        Self::new()
    }
}

impl HostContext for LinuxServices {
    fn is_elevated(&self) -> Result<bool> {
        #[cfg(unix)]
        {
            Ok(unsafe { libc::geteuid() } == 0)
        }
        #[cfg(not(unix))]
        {
            bail!("elevation check requires a unix host")
        }
    }

    fn device_graph(&self) -> Result<DeviceGraph> {
        build_device_graph()
    }

    fn resolve_target(&self, volume: &str) -> Result<DeviceTarget> {
        let graph = build_device_graph()?;
        for (index, disk) in graph.disks.iter().enumerate() {
            let matches = disk.device_path == volume
                || disk.partitions.iter().any(|partition| {
                    format!("/dev/{}", partition.id) == volume
                        || partition.mount_points.iter().any(|mount| mount == volume)
                });
            if matches {
                return Ok(DeviceTarget {
                    volume: volume.to_string(),
                    disk_number: index as u32,
                    device_path: disk.device_path.clone(),
                });
            }
        }
        bail!("{} does not map to an attached block device", volume)
    }

    fn default_source_root(&self) -> PathBuf {
        // grub-install derives its boot content from the copied tree, so
        // there is no Windows-style system source on this host.
        PathBuf::from("/")
    }
}

impl DiskPreparer for LinuxServices {
    fn wipe_and_partition(&self, target: &DeviceTarget, scheme: PartitionScheme) -> Result<()> {
        let device = &target.device_path;
        let label = match scheme {
            PartitionScheme::Mbr => "msdos",
            PartitionScheme::Gpt => "gpt",
        };
        run_checked("parted", &["-s", device, "mklabel", label])?;
        run_checked(
            "parted",
            &["-s", device, "mkpart", "primary", "fat32", "1MiB", "100%"],
        )?;
        if scheme == PartitionScheme::Mbr {
            run_checked("parted", &["-s", device, "set", "1", "boot", "on"])?;
        }
        Ok(())
    }

    fn format_volume(
        &self,
        target: &DeviceTarget,
        fs_kind: FileSystem,
        label: &str,
    ) -> Result<PathBuf> {
        let partition = partition_device(&target.device_path);
        match fs_kind {
            FileSystem::Fat32 => {
                run_checked("mkfs.vfat", &["-F", "32", "-n", label, &partition])?
            }
            FileSystem::Ntfs => run_checked("mkfs.ntfs", &["-f", "-L", label, &partition])?,
            FileSystem::ExFat => run_checked("mkfs.exfat", &["-n", label, &partition])?,
        }

        let mountpoint = std::env::temp_dir().join(format!(
            "bootsmith-vol-{}",
            Path::new(&partition)
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "target".to_string())
        ));
        fs::create_dir_all(&mountpoint)
            .with_context(|| format!("create {}", mountpoint.display()))?;
        run_checked("mount", &[&partition, &mountpoint.display().to_string()])?;
        self.volume_mounts
            .lock()
            .expect("volume table poisoned")
            .push(mountpoint.clone());
        Ok(mountpoint)
    }
}

impl ImageMounter for LinuxServices {
    fn mount(&self, image: &Path) -> Result<PathBuf> {
        let stem = image
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "image".to_string());
        let mountpoint = std::env::temp_dir().join(format!(
            "bootsmith-img-{}-{}",
            stem,
            std::process::id()
        ));
        fs::create_dir_all(&mountpoint)
            .with_context(|| format!("create {}", mountpoint.display()))?;
        run_checked(
            "mount",
            &[
                "-o",
                "loop,ro",
                &image.display().to_string(),
                &mountpoint.display().to_string(),
            ],
        )?;
        self.mounts
            .lock()
            .expect("mount table poisoned")
            .insert(image.to_path_buf(), mountpoint.clone());
        Ok(mountpoint)
    }

    fn unmount(&self, image: &Path) -> Result<()> {
        let mountpoint = self
            .mounts
            .lock()
            .expect("mount table poisoned")
            .remove(image)
            .ok_or_else(|| anyhow!("{} is not mounted", image.display()))?;
        run_checked("umount", &[&mountpoint.display().to_string()])?;
        let _ = fs::remove_dir(&mountpoint);
        Ok(())
    }
}

impl BootServices for LinuxServices {
    fn copy_boot_manager(&self, _source_root: &Path, volume_root: &Path) -> Result<ServiceExit> {
        let efi_dir = volume_root.display().to_string();
        let boot_dir = volume_root.join("boot").display().to_string();
        run_tool(
            "grub-install",
            &[
                &format!("--target={}", grub_efi_target()),
                &format!("--efi-directory={}", efi_dir),
                &format!("--boot-directory={}", boot_dir),
                "--removable",
            ],
        )
    }

    fn sector_tool_candidates(&self, image_root: &Path) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Ok(found) = which::which(SECTOR_TOOL_NAME) {
            candidates.push(found);
        }
        candidates.push(image_root.join("boot").join(SECTOR_TOOL_NAME));
        candidates.push(image_root.join("sources").join(SECTOR_TOOL_NAME));
        if let Ok(value) = std::env::var(BOOTSECT_ENV_OVERRIDE) {
            candidates.push(PathBuf::from(value));
        }
        for alternate in SECTOR_TOOL_ALTERNATES {
            candidates.push(PathBuf::from(alternate));
        }
        candidates
    }

    fn write_boot_sector(
        &self,
        tool: &Path,
        target: &DeviceTarget,
        _volume_root: &Path,
    ) -> Result<ServiceExit> {
        let partition = partition_device(&target.device_path);
        run_tool(&tool.display().to_string(), &["--install", &partition])
    }
}

fn grub_efi_target() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "arm64-efi"
    } else {
        "x86_64-efi"
    }
}

/// First partition of a whole-disk device: `/dev/sdb` -> `/dev/sdb1`,
/// `/dev/nvme0n1` -> `/dev/nvme0n1p1`.
fn partition_device(device: &str) -> String {
    if device.chars().last().map_or(false, |ch| ch.is_ascii_digit()) {
        format!("{}p1", device)
    } else {
        format!("{}1", device)
    }
}

fn run_checked(cmd: &str, args: &[&str]) -> Result<()> {
    let exit = run_tool(cmd, args)?;
    if exit.success() {
        Ok(())
    } else {
        bail!("{} failed: {}", cmd, exit.detail)
    }
}

fn run_tool(cmd: &str, args: &[&str]) -> Result<ServiceExit> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("run {}", cmd))?;
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let detail = if stderr.is_empty() {
        format!("{} exited {:?}", cmd, output.status.code())
    } else {
        stderr
    };
    Ok(ServiceExit {
        code: output.status.code(),
        detail,
    })
}

fn enumerate_disks() -> Result<Vec<Disk>> {
    let mounts = read_mounts();
    let labels = read_labels();
    let mut disks = Vec::new();
    let entries = fs::read_dir("/sys/block").context("read /sys/block")?;
    for entry in entries {
        let entry = entry?;
        let disk_name = entry.file_name().to_string_lossy().to_string();
        if is_virtual_disk(&disk_name, entry.path()) {
            continue;
        }
        let size_bytes = read_u64(entry.path().join("size"))
            .map(|sectors| sectors.saturating_mul(512))
            .unwrap_or(0);
        let removable = read_u64(entry.path().join("removable")).unwrap_or(0) == 1;
        let model = read_string(entry.path().join("device/model"))
            .unwrap_or_else(|| disk_name.clone());
        let partitions = enumerate_partitions(entry.path(), &mounts, &labels)?;
        let is_system_disk = partitions
            .iter()
            .any(|partition| partition.mount_points.iter().any(|mount| mount == "/"));
        disks.push(Disk {
            id: disk_name.clone(),
            friendly_name: model,
            device_path: format!("/dev/{}", disk_name),
            size_bytes,
            removable,
            is_system_disk,
            partitions,
        });
    }
    disks.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(disks)
}

fn enumerate_partitions(
    disk_path: PathBuf,
    mounts: &HashMap<String, Vec<MountInfo>>,
    labels: &HashMap<String, String>,
) -> Result<Vec<Partition>> {
    let mut partitions = Vec::new();
    let entries = fs::read_dir(&disk_path).context("read disk entries")?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.join("partition").exists() {
            continue;
        }
        let part_name = entry.file_name().to_string_lossy().to_string();
        let size_bytes = read_u64(path.join("size"))
            .map(|sectors| sectors.saturating_mul(512))
            .unwrap_or(0);
        let mount_infos = mounts.get(&part_name).cloned().unwrap_or_default();
        let mount_points = mount_infos
            .iter()
            .map(|info| info.mount_point.clone())
            .collect();
        let fs_type = mount_infos.first().map(|info| info.fs_type.clone());
        let label = labels.get(&part_name).cloned();
        partitions.push(Partition {
            id: part_name,
            label,
            fs: fs_type,
            size_bytes,
            mount_points,
        });
    }
    partitions.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(partitions)
}

#[derive(Debug, Clone)]
struct MountInfo {
    mount_point: String,
    fs_type: String,
}

fn read_mounts() -> HashMap<String, Vec<MountInfo>> {
    let mut mounts: HashMap<String, Vec<MountInfo>> = HashMap::new();
    let data = fs::read_to_string("/proc/self/mounts").unwrap_or_default();
    for line in data.lines() {
        let mut parts = line.split_whitespace();
        let device = match parts.next() {
            Some(value) => value,
            None => continue,
        };
        let mount_point = match parts.next() {
            Some(value) => unescape_mount(value),
            None => continue,
        };
        let fs_type = match parts.next() {
            Some(value) => value.to_string(),
            None => continue,
        };
        if !device.starts_with("/dev/") {
            continue;
        }
        let name = Path::new(device)
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("")
            .to_string();
        if name.is_empty() {
            continue;
        }
        mounts.entry(name).or_default().push(MountInfo {
            mount_point,
            fs_type,
        });
    }
    mounts
}

fn read_labels() -> HashMap<String, String> {
    let mut labels = HashMap::new();
    let path = Path::new("/dev/disk/by-label");
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            if let Ok(target) = fs::read_link(entry.path()) {
                if let Some(name) = target.file_name().and_then(|v| v.to_str()) {
                    labels.insert(
                        name.to_string(),
                        entry.file_name().to_string_lossy().to_string(),
                    );
                }
            }
        }
    }
    labels
}

fn read_os_release() -> String {
    let data = fs::read_to_string("/etc/os-release").unwrap_or_default();
    let mut name = None;
    let mut version = None;
    for line in data.lines() {
        if line.starts_with("NAME=") && name.is_none() {
            name = Some(trim_os_value(line));
        } else if line.starts_with("VERSION=") && version.is_none() {
            version = Some(trim_os_value(line));
        }
    }
    match (name, version) {
        (Some(name), Some(version)) => format!("{} {}", name, version),
        (Some(name), None) => name,
        _ => "unknown".to_string(),
    }
}

fn trim_os_value(line: &str) -> String {
    let value = line.splitn(2, '=').nth(1).unwrap_or("").trim();
    value.trim_matches('"').to_string()
}

fn read_machine() -> String {
    let vendor = read_string("/sys/devices/virtual/dmi/id/sys_vendor");
    let product = read_string("/sys/devices/virtual/dmi/id/product_name");
    match (vendor, product) {
        (Some(vendor), Some(product)) => format!("{} {}", vendor, product),
        (Some(vendor), None) => vendor,
        (None, Some(product)) => product,
        _ => read_string("/proc/sys/kernel/hostname").unwrap_or_else(|| "unknown".to_string()),
    }
}

fn read_string(path: impl AsRef<Path>) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|value| value.trim().to_string())
}

fn read_u64(path: impl AsRef<Path>) -> Option<u64> {
    read_string(path).and_then(|value| value.parse::<u64>().ok())
}

fn unescape_mount(value: &str) -> String {
    let mut output = String::new();
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let mut octal = String::new();
            for _ in 0..3 {
                if let Some(next) = chars.peek() {
                    if next.is_ascii_digit() {
                        octal.push(*next);
                        chars.next();
                    } else {
                        break;
                    }
                }
            }
            if octal.len() == 3 {
                if let Ok(byte) = u8::from_str_radix(&octal, 8) {
                    output.push(byte as char);
                    continue;
                }
            }
            output.push('\\');
            output.push_str(&octal);
        } else {
            output.push(ch);
        }
    }
    output
}

fn is_virtual_disk(name: &str, path: PathBuf) -> bool {
    if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
        return true;
    }
    if let Ok(target) = fs::canonicalize(path.join("device")) {
        if target.to_string_lossy().contains("/virtual/") {
            return true;
        }
    }
    false
}
