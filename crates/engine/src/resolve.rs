use bootsmith_core::{BootMode, BootModeRequest, SourceOrigin, WindowsSource};
use std::path::{Path, PathBuf};

/// Relative locations of an install-image file inside a mounted image, in
/// search order.
pub const INSTALL_IMAGE_CANDIDATES: &[&str] = &[
    "sources/install.wim",
    "sources/install.esd",
    "install.wim",
    "install.esd",
];

/// Effective boot mode. An explicit request passes through; `Auto` is a
/// content heuristic over the populated target volume: an `EFI` directory
/// present after the copy means the image expects UEFI firmware.
pub fn resolve_boot_mode(requested: BootModeRequest, volume_root: &Path) -> BootMode {
    match requested {
        BootModeRequest::Bios => BootMode::Bios,
        BootModeRequest::Uefi => BootMode::Uefi,
        BootModeRequest::Auto => {
            if volume_root.join("EFI").is_dir() {
                BootMode::Uefi
            } else {
                BootMode::Bios
            }
        }
    }
}

/// Finds the installation source root for the UEFI install path. An
/// image-embedded source wins over anything the caller or host supplies.
/// The ladder always lands somewhere, so this cannot fail; whether the
/// chosen root actually exists is checked at install time.
pub fn locate_windows_source(
    image_root: &Path,
    override_root: Option<&Path>,
    default_root: &Path,
) -> WindowsSource {
    for candidate in INSTALL_IMAGE_CANDIDATES {
        let file = image_root.join(candidate);
        if file.is_file() {
            // Source root is the grandparent of the install-image file,
            // clamped to the image root: for a root-level hit the grandparent
            // would be the mount point's parent, outside the image.
            let root = file
                .parent()
                .and_then(Path::parent)
                .filter(|root| root.starts_with(image_root))
                .map(Path::to_path_buf)
                .unwrap_or_else(|| image_root.to_path_buf());
            return WindowsSource {
                root,
                origin: SourceOrigin::DetectedFromImage,
            };
        }
    }

    let windows_dir = image_root.join("Windows");
    if windows_dir.is_dir() {
        return WindowsSource {
            root: windows_dir,
            origin: SourceOrigin::DetectedFromImage,
        };
    }

    if let Some(root) = override_root {
        return WindowsSource {
            root: root.to_path_buf(),
            origin: SourceOrigin::CallerOverride,
        };
    }

    WindowsSource {
        root: PathBuf::from(default_root),
        origin: SourceOrigin::SystemDefault,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn explicit_requests_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("EFI")).unwrap();
        assert_eq!(
            resolve_boot_mode(BootModeRequest::Bios, dir.path()),
            BootMode::Bios
        );
        assert_eq!(
            resolve_boot_mode(BootModeRequest::Uefi, dir.path()),
            BootMode::Uefi
        );
    }

    #[test]
    fn auto_follows_efi_directory_presence() {
        let with_efi = tempfile::tempdir().unwrap();
        fs::create_dir_all(with_efi.path().join("EFI/BOOT")).unwrap();
        assert_eq!(
            resolve_boot_mode(BootModeRequest::Auto, with_efi.path()),
            BootMode::Uefi
        );

        let without = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_boot_mode(BootModeRequest::Auto, without.path()),
            BootMode::Bios
        );
    }

    #[test]
    fn auto_ignores_an_efi_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("EFI"), b"not a directory").unwrap();
        assert_eq!(
            resolve_boot_mode(BootModeRequest::Auto, dir.path()),
            BootMode::Bios
        );
    }

    #[test]
    fn install_image_beats_windows_directory() {
        let image = tempfile::tempdir().unwrap();
        fs::create_dir_all(image.path().join("sources")).unwrap();
        fs::write(image.path().join("sources/install.wim"), b"wim").unwrap();
        fs::create_dir_all(image.path().join("Windows")).unwrap();

        let source = locate_windows_source(image.path(), None, Path::new("/fallback"));
        assert_eq!(source.origin, SourceOrigin::DetectedFromImage);
        assert_eq!(source.root, image.path());
    }

    #[test]
    fn root_level_install_image_keeps_the_image_root() {
        let image = tempfile::tempdir().unwrap();
        fs::write(image.path().join("install.wim"), b"wim").unwrap();

        // The file's grandparent is outside the mounted image; the located
        // root must stay inside it.
        let source = locate_windows_source(image.path(), None, Path::new("/fallback"));
        assert_eq!(source.origin, SourceOrigin::DetectedFromImage);
        assert_eq!(source.root, image.path());
    }

    #[test]
    fn windows_directory_is_second_choice() {
        let image = tempfile::tempdir().unwrap();
        fs::create_dir_all(image.path().join("Windows")).unwrap();

        let source = locate_windows_source(image.path(), None, Path::new("/fallback"));
        assert_eq!(source.origin, SourceOrigin::DetectedFromImage);
        assert_eq!(source.root, image.path().join("Windows"));
    }

    #[test]
    fn override_beats_system_default() {
        let image = tempfile::tempdir().unwrap();
        let source = locate_windows_source(
            image.path(),
            Some(Path::new("/custom/source")),
            Path::new("/fallback"),
        );
        assert_eq!(source.origin, SourceOrigin::CallerOverride);
        assert_eq!(source.root, PathBuf::from("/custom/source"));
    }

    #[test]
    fn empty_image_falls_back_to_system_default() {
        let image = tempfile::tempdir().unwrap();
        let source = locate_windows_source(image.path(), None, Path::new("/fallback"));
        assert_eq!(source.origin, SourceOrigin::SystemDefault);
        assert_eq!(source.root, PathBuf::from("/fallback"));
    }
}
