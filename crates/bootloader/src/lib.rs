use std::path::{Path, PathBuf};

pub const BOOTSECT_ENV_OVERRIDE: &str = "BOOTSMITH_BOOTSECT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootArch {
    X64,
    Aarch64,
    Ia32,
}

impl BootArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootArch::X64 => "x64",
            BootArch::Aarch64 => "aarch64",
            BootArch::Ia32 => "ia32",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BootBinary {
    pub path: String,
    pub arch: BootArch,
}

pub const EFI_BOOT_BINARIES: &[(&str, BootArch)] = &[
    ("EFI/BOOT/BOOTX64.EFI", BootArch::X64),
    ("EFI/BOOT/BOOTAA64.EFI", BootArch::Aarch64),
    ("EFI/BOOT/BOOTIA32.EFI", BootArch::Ia32),
];

// Fixed alternates searched after PATH and the image-relative locations.
#[cfg(windows)]
pub const SECTOR_TOOL_ALTERNATES: &[&str] = &[r"C:\tools\bootsect.exe"];
#[cfg(not(windows))]
pub const SECTOR_TOOL_ALTERNATES: &[&str] = &[
    "/usr/bin/syslinux",
    "/usr/local/bin/syslinux",
    "/sbin/syslinux",
];

#[cfg(windows)]
pub const SECTOR_TOOL_NAME: &str = "bootsect";
#[cfg(not(windows))]
pub const SECTOR_TOOL_NAME: &str = "syslinux";

#[cfg(windows)]
pub const SECTOR_TOOL_FILE: &str = "bootsect.exe";
#[cfg(not(windows))]
pub const SECTOR_TOOL_FILE: &str = "syslinux";

/// Boot binaries actually present under a volume root, in candidate order.
pub fn installed_boot_binaries(volume_root: impl AsRef<Path>) -> Vec<BootBinary> {
    let root = volume_root.as_ref();
    let mut found = Vec::new();
    for (rel, arch) in EFI_BOOT_BINARIES {
        if root.join(rel).is_file() {
            found.push(BootBinary {
                path: (*rel).to_string(),
                arch: *arch,
            });
        }
    }
    found
}

pub fn has_boot_binary(volume_root: impl AsRef<Path>) -> bool {
    !installed_boot_binaries(volume_root).is_empty()
}

/// Where the EFI boot directory is expected on a prepared volume.
pub fn efi_boot_dir(volume_root: impl AsRef<Path>) -> PathBuf {
    volume_root.as_ref().join("EFI").join("BOOT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn finds_present_binaries_in_candidate_order() {
        let dir = tempfile::tempdir().unwrap();
        let boot = dir.path().join("EFI").join("BOOT");
        fs::create_dir_all(&boot).unwrap();
        fs::write(boot.join("BOOTAA64.EFI"), b"efi").unwrap();
        fs::write(boot.join("BOOTX64.EFI"), b"efi").unwrap();

        let found = installed_boot_binaries(dir.path());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].arch, BootArch::X64);
        assert_eq!(found[1].arch, BootArch::Aarch64);
    }

    #[test]
    fn empty_volume_has_no_binaries() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_boot_binary(dir.path()));
    }

    #[test]
    fn directory_named_like_binary_does_not_count() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("EFI/BOOT/BOOTX64.EFI")).unwrap();
        assert!(!has_boot_binary(dir.path()));
    }
}
