//! Windows implementations of the platform services: physical-disk
//! enumeration over DeviceIoControl, disk layout and fmifs formatting,
//! virtual-disk ISO attach, and bcdboot/bootsect invocation.

use anyhow::Result;
use bootsmith_core::DeviceGraph;
use bootsmith_engine::{BootServices, DiskPreparer, HostContext, ImageMounter, ServiceExit};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[cfg(windows)]
mod boot;
#[cfg(windows)]
mod format;
#[cfg(windows)]
mod iso;
#[cfg(windows)]
mod volumes;
#[cfg(windows)]
mod win;

#[cfg(windows)]
pub fn build_device_graph() -> Result<DeviceGraph> {
    use bootsmith_core::HostInfo;

    let host = HostInfo {
        os: "windows".to_string(),
        os_version: win::os_version_string(),
        machine: win::machine_name_string(),
    };
    let disks = win::enumerate_physical_disks()?;
    Ok(DeviceGraph::new(host, disks))
}

#[cfg(not(windows))]
pub fn build_device_graph() -> Result<DeviceGraph> {
    anyhow::bail!("device enumeration requires Windows")
}

/// The Windows service bundle handed to the engine. Repartitioning drops
/// the old drive letter, so the letters present beforehand are remembered
/// and the format step waits for the one that appears afterwards.
pub struct WindowsServices {
    letters_before_partition: Mutex<Option<Vec<char>>>,
}

impl WindowsServices {
    pub fn new() -> Self {
        Self {
            letters_before_partition: Mutex::new(None),
        }
    }
}

impl Default for WindowsServices {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(windows)]
impl HostContext for WindowsServices {
    fn is_elevated(&self) -> Result<bool> {
        win::is_elevated()
    }

    fn device_graph(&self) -> Result<DeviceGraph> {
        build_device_graph()
    }

    fn resolve_target(&self, volume: &str) -> Result<bootsmith_core::DeviceTarget> {
        let letter = volumes::parse_drive_letter(volume)
            .ok_or_else(|| anyhow::anyhow!("{} is not a drive letter", volume))?;
        for mount in volumes::enumerate_volume_mounts()? {
            if mount.id == format!("Drive{}", letter) {
                return Ok(bootsmith_core::DeviceTarget {
                    volume: format!("{}:", letter),
                    disk_number: mount.disk_number,
                    device_path: format!(r"\\.\PhysicalDrive{}", mount.disk_number),
                });
            }
        }
        anyhow::bail!("no volume mounted at {}:", letter)
    }

    fn default_source_root(&self) -> PathBuf {
        volumes::windows_directory()
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(r"C:\Windows"))
    }
}

#[cfg(windows)]
impl DiskPreparer for WindowsServices {
    fn wipe_and_partition(
        &self,
        target: &bootsmith_core::DeviceTarget,
        scheme: bootsmith_core::PartitionScheme,
    ) -> Result<()> {
        let before = format::logical_drive_letters();
        format::wipe_and_partition(target.disk_number, scheme)?;
        *self
            .letters_before_partition
            .lock()
            .expect("letter snapshot poisoned") = Some(before);
        Ok(())
    }

    fn format_volume(
        &self,
        target: &bootsmith_core::DeviceTarget,
        fs: bootsmith_core::FileSystem,
        label: &str,
    ) -> Result<PathBuf> {
        let before = self
            .letters_before_partition
            .lock()
            .expect("letter snapshot poisoned")
            .take();
        let letter = match before {
            Some(before) => format::wait_for_new_drive_letter(
                &before,
                std::time::Duration::from_secs(15),
            )?,
            None => target
                .volume
                .chars()
                .next()
                .ok_or_else(|| anyhow::anyhow!("target has no drive letter"))?,
        };
        format::format_volume(letter, fs, label)?;
        Ok(PathBuf::from(format!("{}:\\", letter)))
    }
}

#[cfg(windows)]
impl ImageMounter for WindowsServices {
    fn mount(&self, image: &Path) -> Result<PathBuf> {
        iso::attach(image)
    }

    fn unmount(&self, image: &Path) -> Result<()> {
        iso::detach(image)
    }
}

#[cfg(windows)]
impl BootServices for WindowsServices {
    fn copy_boot_manager(&self, source_root: &Path, volume_root: &Path) -> Result<ServiceExit> {
        boot::run_bcdboot(source_root, volume_root)
    }

    fn sector_tool_candidates(&self, image_root: &Path) -> Vec<PathBuf> {
        boot::sector_tool_candidates(image_root)
    }

    fn write_boot_sector(
        &self,
        tool: &Path,
        target: &bootsmith_core::DeviceTarget,
        _volume_root: &Path,
    ) -> Result<ServiceExit> {
        boot::run_bootsect(tool, &target.volume)
    }
}

#[cfg(not(windows))]
impl HostContext for WindowsServices {
    fn is_elevated(&self) -> Result<bool> {
        anyhow::bail!("elevation check requires Windows")
    }

    fn device_graph(&self) -> Result<DeviceGraph> {
        anyhow::bail!("device enumeration requires Windows")
    }

    fn resolve_target(&self, _volume: &str) -> Result<bootsmith_core::DeviceTarget> {
        anyhow::bail!("volume resolution requires Windows")
    }

    fn default_source_root(&self) -> PathBuf {
        PathBuf::from(r"C:\")
    }
}

#[cfg(not(windows))]
impl DiskPreparer for WindowsServices {
    fn wipe_and_partition(
        &self,
        _target: &bootsmith_core::DeviceTarget,
        _scheme: bootsmith_core::PartitionScheme,
    ) -> Result<()> {
        anyhow::bail!("disk preparation requires Windows")
    }

    fn format_volume(
        &self,
        _target: &bootsmith_core::DeviceTarget,
        _fs: bootsmith_core::FileSystem,
        _label: &str,
    ) -> Result<PathBuf> {
        anyhow::bail!("volume formatting requires Windows")
    }
}

#[cfg(not(windows))]
impl ImageMounter for WindowsServices {
    fn mount(&self, _image: &Path) -> Result<PathBuf> {
        anyhow::bail!("ISO mounting requires Windows")
    }

    fn unmount(&self, _image: &Path) -> Result<()> {
        anyhow::bail!("ISO mounting requires Windows")
    }
}

#[cfg(not(windows))]
impl BootServices for WindowsServices {
    fn copy_boot_manager(&self, _source_root: &Path, _volume_root: &Path) -> Result<ServiceExit> {
        anyhow::bail!("bcdboot requires Windows")
    }

    fn sector_tool_candidates(&self, _image_root: &Path) -> Vec<PathBuf> {
        Vec::new()
    }

    fn write_boot_sector(
        &self,
        _tool: &Path,
        _target: &bootsmith_core::DeviceTarget,
        _volume_root: &Path,
    ) -> Result<ServiceExit> {
        anyhow::bail!("bootsect requires Windows")
    }
}
