use crate::services::BootServices;
use bootsmith_bootloader::has_boot_binary;
use bootsmith_core::{DeviceTarget, EngineError, WindowsSource};
use std::path::{Path, PathBuf};

/// UEFI install: the boot-manager copy service's exit status is not fully
/// trustworthy, so a non-zero exit is downgraded to a warning when the
/// expected boot binary landed on the volume anyway. Absence after a
/// non-zero exit is fatal.
pub fn install_uefi(
    boot: &dyn BootServices,
    source: &WindowsSource,
    volume_root: &Path,
) -> Result<String, EngineError> {
    if !source.root.exists() {
        return Err(EngineError::SourceDetectionFailure(format!(
            "windows source root {} ({}) does not exist",
            source.root.display(),
            source.origin.as_str()
        )));
    }

    let exit = boot
        .copy_boot_manager(&source.root, volume_root)
        .map_err(|error| EngineError::BootloaderInstallFailure(error.to_string()))?;

    if exit.success() {
        return Ok(format!(
            "UEFI boot files installed from {}",
            source.root.display()
        ));
    }

    if has_boot_binary(volume_root) {
        Ok(format!(
            "UEFI boot binary present despite exit {:?}: {}",
            exit.code, exit.detail
        ))
    } else {
        Err(EngineError::BootloaderInstallFailure(format!(
            "boot-manager copy exited {:?} and no EFI boot binary found: {}",
            exit.code, exit.detail
        )))
    }
}

/// First existing boot-sector-tool candidate, in the host's search order.
pub fn find_sector_tool(
    boot: &dyn BootServices,
    image_root: &Path,
) -> Result<PathBuf, EngineError> {
    let candidates = boot.sector_tool_candidates(image_root);
    candidates
        .iter()
        .find(|candidate| candidate.is_file())
        .cloned()
        .ok_or_else(|| {
            EngineError::BootloaderToolMissing(format!(
                "no boot-sector tool at any of: {}",
                candidates
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
}

/// BIOS install: any non-zero exit is fatal. There is no cheap post-hoc
/// check for an MBR boot sector, so no secondary verification happens here.
pub fn install_bios(
    boot: &dyn BootServices,
    tool: &Path,
    target: &DeviceTarget,
    volume_root: &Path,
) -> Result<String, EngineError> {
    let exit = boot
        .write_boot_sector(tool, target, volume_root)
        .map_err(|error| EngineError::BootloaderInstallFailure(error.to_string()))?;

    if exit.success() {
        Ok(format!("MBR boot sector written by {}", tool.display()))
    } else {
        Err(EngineError::BootloaderInstallFailure(format!(
            "{} exited {:?}: {}",
            tool.display(),
            exit.code,
            exit.detail
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServiceExit;
    use anyhow::Result;
    use bootsmith_core::SourceOrigin;
    use std::cell::RefCell;
    use std::fs;

    struct ScriptedBoot {
        copy_exit: ServiceExit,
        sector_exit: ServiceExit,
        candidates: Vec<PathBuf>,
        copy_calls: RefCell<usize>,
    }

    impl ScriptedBoot {
        fn new(copy_code: i32, sector_code: i32) -> Self {
            Self {
                copy_exit: ServiceExit {
                    code: Some(copy_code),
                    detail: format!("exit {}", copy_code),
                },
                sector_exit: ServiceExit {
                    code: Some(sector_code),
                    detail: format!("exit {}", sector_code),
                },
                candidates: Vec::new(),
                copy_calls: RefCell::new(0),
            }
        }
    }

    impl BootServices for ScriptedBoot {
        fn copy_boot_manager(&self, _source: &Path, _volume: &Path) -> Result<ServiceExit> {
            *self.copy_calls.borrow_mut() += 1;
            Ok(self.copy_exit.clone())
        }

        fn sector_tool_candidates(&self, _image_root: &Path) -> Vec<PathBuf> {
            self.candidates.clone()
        }

        fn write_boot_sector(
            &self,
            _tool: &Path,
            _target: &DeviceTarget,
            _volume: &Path,
        ) -> Result<ServiceExit> {
            Ok(self.sector_exit.clone())
        }
    }

    fn target() -> DeviceTarget {
        DeviceTarget {
            volume: "E".to_string(),
            disk_number: 2,
            device_path: r"\\.\PhysicalDrive2".to_string(),
        }
    }

    fn detected_source(root: &Path) -> WindowsSource {
        WindowsSource {
            root: root.to_path_buf(),
            origin: SourceOrigin::DetectedFromImage,
        }
    }

    #[test]
    fn uefi_missing_source_root_is_detection_failure() {
        let boot = ScriptedBoot::new(0, 0);
        let volume = tempfile::tempdir().unwrap();
        let source = detected_source(Path::new("/no/such/root"));
        let error = install_uefi(&boot, &source, volume.path()).unwrap_err();
        assert_eq!(error.kind(), "SourceDetectionFailure");
        assert_eq!(*boot.copy_calls.borrow(), 0);
    }

    #[test]
    fn uefi_nonzero_exit_with_binary_present_is_a_warning() {
        let boot = ScriptedBoot::new(1, 0);
        let source_dir = tempfile::tempdir().unwrap();
        let volume = tempfile::tempdir().unwrap();
        let efi = volume.path().join("EFI/BOOT");
        fs::create_dir_all(&efi).unwrap();
        fs::write(efi.join("BOOTX64.EFI"), b"efi").unwrap();

        let message =
            install_uefi(&boot, &detected_source(source_dir.path()), volume.path()).unwrap();
        assert!(message.contains("despite exit"));
    }

    #[test]
    fn uefi_nonzero_exit_without_binary_is_fatal() {
        let boot = ScriptedBoot::new(1, 0);
        let source_dir = tempfile::tempdir().unwrap();
        let volume = tempfile::tempdir().unwrap();

        let error =
            install_uefi(&boot, &detected_source(source_dir.path()), volume.path()).unwrap_err();
        assert_eq!(error.kind(), "BootloaderInstallFailure");
    }

    #[test]
    fn sector_tool_first_existing_candidate_wins() {
        let tools = tempfile::tempdir().unwrap();
        let second = tools.path().join("syslinux");
        fs::write(&second, b"tool").unwrap();

        let mut boot = ScriptedBoot::new(0, 0);
        boot.candidates = vec![tools.path().join("missing"), second.clone()];

        let found = find_sector_tool(&boot, Path::new("/mnt/img")).unwrap();
        assert_eq!(found, second);
    }

    #[test]
    fn no_sector_tool_anywhere_is_tool_missing() {
        let mut boot = ScriptedBoot::new(0, 0);
        boot.candidates = vec![PathBuf::from("/no/a"), PathBuf::from("/no/b")];
        let error = find_sector_tool(&boot, Path::new("/mnt/img")).unwrap_err();
        assert_eq!(error.kind(), "BootloaderToolMissing");
    }

    #[test]
    fn bios_nonzero_exit_is_fatal_without_verification() {
        let boot = ScriptedBoot::new(0, 1);
        let volume = tempfile::tempdir().unwrap();
        let error = install_bios(&boot, Path::new("/usr/bin/syslinux"), &target(), volume.path())
            .unwrap_err();
        assert_eq!(error.kind(), "BootloaderInstallFailure");
    }

    #[test]
    fn bios_zero_exit_succeeds() {
        let boot = ScriptedBoot::new(0, 0);
        let volume = tempfile::tempdir().unwrap();
        let message =
            install_bios(&boot, Path::new("/usr/bin/syslinux"), &target(), volume.path()).unwrap();
        assert!(message.contains("syslinux"));
    }
}
