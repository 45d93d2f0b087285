use anyhow::Result;
use bootsmith_core::{DeviceGraph, DeviceTarget, FileSystem, PartitionScheme};
use std::path::{Path, PathBuf};

/// Exit status of an externally invoked boot service. `code` is `None` when
/// the process was killed before reporting one.
#[derive(Debug, Clone)]
pub struct ServiceExit {
    pub code: Option<i32>,
    pub detail: String,
}

impl ServiceExit {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            detail: detail.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Host identity and device lookups. No side effects.
pub trait HostContext {
    fn is_elevated(&self) -> Result<bool>;
    fn device_graph(&self) -> Result<DeviceGraph>;
    /// Maps a user-chosen volume identifier (drive letter, block device,
    /// mount point) to the physical device behind it.
    fn resolve_target(&self, volume: &str) -> Result<DeviceTarget>;
    /// Source root used when neither the image nor the caller provides one.
    fn default_source_root(&self) -> PathBuf;
}

/// Destructive device preparation: wipe, repartition, format.
pub trait DiskPreparer {
    fn wipe_and_partition(&self, target: &DeviceTarget, scheme: PartitionScheme) -> Result<()>;
    /// Formats the single partition created above and returns the root path
    /// of the mounted volume.
    fn format_volume(
        &self,
        target: &DeviceTarget,
        fs: FileSystem,
        label: &str,
    ) -> Result<PathBuf>;
}

/// Read-only image mounting, keyed by the image path for unmount.
pub trait ImageMounter {
    fn mount(&self, image: &Path) -> Result<PathBuf>;
    fn unmount(&self, image: &Path) -> Result<()>;
}

/// Boot-loader installation services.
pub trait BootServices {
    /// UEFI path: writes boot files from `source_root` onto the volume.
    fn copy_boot_manager(&self, source_root: &Path, volume_root: &Path) -> Result<ServiceExit>;
    /// BIOS path: candidate locations for the boot-sector-writer tool, in
    /// search order. The engine takes the first candidate that exists.
    fn sector_tool_candidates(&self, image_root: &Path) -> Vec<PathBuf>;
    fn write_boot_sector(
        &self,
        tool: &Path,
        target: &DeviceTarget,
        volume_root: &Path,
    ) -> Result<ServiceExit>;
}

/// The platform services consumed by one pipeline run. Host crates provide
/// real implementations; tests substitute fakes.
pub struct Services<'a> {
    pub host: &'a dyn HostContext,
    pub disk: &'a dyn DiskPreparer,
    pub mounter: &'a dyn ImageMounter,
    pub boot: &'a dyn BootServices,
}

/// Scoped image mount: release is guaranteed on every exit path once
/// acquired. A failed release is reported back to the caller for logging,
/// never escalated.
pub struct MountGuard<'a> {
    mounter: &'a dyn ImageMounter,
    image: PathBuf,
    root: PathBuf,
    released: bool,
}

impl<'a> MountGuard<'a> {
    pub fn acquire(mounter: &'a dyn ImageMounter, image: &Path) -> Result<Self> {
        let root = mounter.mount(image)?;
        Ok(Self {
            mounter,
            image: image.to_path_buf(),
            root,
            released: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Idempotent explicit release. Returns the unmount error text, if any.
    pub fn release(&mut self) -> Option<String> {
        if self.released {
            return None;
        }
        self.released = true;
        self.mounter.unmount(&self.image).err().map(|error| error.to_string())
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.mounter.unmount(&self.image);
        }
    }
}
