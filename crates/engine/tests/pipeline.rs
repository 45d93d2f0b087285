use anyhow::{anyhow, Result};
use bootsmith_core::{
    BootMode, BootModeRequest, DeviceGraph, DeviceTarget, Disk, FileSystem, HostInfo,
    PartitionScheme, RunReport, Stage,
};
use bootsmith_engine::{
    create_boot_drive, BootServices, CreateParams, DiskPreparer, HostContext, ImageMounter,
    ServiceExit, Services,
};
use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};

const DEVICE_PATH: &str = r"\\.\PhysicalDrive2";

struct FakeHost {
    elevated: bool,
    system_disk: bool,
    removable: bool,
    resolve_fails: bool,
    default_source: PathBuf,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            elevated: true,
            system_disk: false,
            removable: true,
            resolve_fails: false,
            default_source: PathBuf::from("/nonexistent/default-source"),
        }
    }
}

impl HostContext for FakeHost {
    fn is_elevated(&self) -> Result<bool> {
        Ok(self.elevated)
    }

    fn device_graph(&self) -> Result<DeviceGraph> {
        Ok(DeviceGraph::new(
            HostInfo {
                os: "test".to_string(),
                os_version: "0".to_string(),
                machine: "fixture".to_string(),
            },
            vec![Disk {
                id: "PhysicalDrive2".to_string(),
                friendly_name: "Fixture Flash".to_string(),
                device_path: DEVICE_PATH.to_string(),
                size_bytes: 16 * 1024 * 1024 * 1024,
                is_system_disk: self.system_disk,
                removable: self.removable,
                partitions: vec![],
            }],
        ))
    }

    fn resolve_target(&self, volume: &str) -> Result<DeviceTarget> {
        if self.resolve_fails {
            return Err(anyhow!("no physical device behind {}", volume));
        }
        Ok(DeviceTarget {
            volume: volume.to_string(),
            disk_number: 2,
            device_path: DEVICE_PATH.to_string(),
        })
    }

    fn default_source_root(&self) -> PathBuf {
        self.default_source.clone()
    }
}

struct FakeDisk {
    volume_root: PathBuf,
    fail_partition: bool,
    fail_format: bool,
    wipes: Cell<usize>,
    schemes: RefCell<Vec<PartitionScheme>>,
}

impl FakeDisk {
    fn new(volume_root: PathBuf) -> Self {
        Self {
            volume_root,
            fail_partition: false,
            fail_format: false,
            wipes: Cell::new(0),
            schemes: RefCell::new(Vec::new()),
        }
    }
}

impl DiskPreparer for FakeDisk {
    fn wipe_and_partition(&self, _target: &DeviceTarget, scheme: PartitionScheme) -> Result<()> {
        if self.fail_partition {
            return Err(anyhow!("clean failed"));
        }
        self.wipes.set(self.wipes.get() + 1);
        self.schemes.borrow_mut().push(scheme);
        Ok(())
    }

    fn format_volume(
        &self,
        _target: &DeviceTarget,
        _fs: FileSystem,
        _label: &str,
    ) -> Result<PathBuf> {
        if self.fail_format {
            return Err(anyhow!("FormatEx reported failure"));
        }
        Ok(self.volume_root.clone())
    }
}

struct FakeMounter {
    image_root: PathBuf,
    fail_mount: bool,
    fail_unmount: bool,
    mounts: Cell<usize>,
    unmounts: Cell<usize>,
    active: Cell<i32>,
}

impl FakeMounter {
    fn new(image_root: PathBuf) -> Self {
        Self {
            image_root,
            fail_mount: false,
            fail_unmount: false,
            mounts: Cell::new(0),
            unmounts: Cell::new(0),
            active: Cell::new(0),
        }
    }
}

impl ImageMounter for FakeMounter {
    fn mount(&self, image: &Path) -> Result<PathBuf> {
        if self.fail_mount {
            return Err(anyhow!("cannot attach {}", image.display()));
        }
        self.mounts.set(self.mounts.get() + 1);
        self.active.set(self.active.get() + 1);
        Ok(self.image_root.clone())
    }

    fn unmount(&self, _image: &Path) -> Result<()> {
        self.unmounts.set(self.unmounts.get() + 1);
        self.active.set(self.active.get() - 1);
        if self.fail_unmount {
            return Err(anyhow!("detach failed"));
        }
        Ok(())
    }
}

struct FakeBoot {
    candidates: Vec<PathBuf>,
    copy_code: i32,
    sector_code: i32,
    copy_calls: Cell<usize>,
    sector_calls: Cell<usize>,
}

impl Default for FakeBoot {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
            copy_code: 0,
            sector_code: 0,
            copy_calls: Cell::new(0),
            sector_calls: Cell::new(0),
        }
    }
}

impl BootServices for FakeBoot {
    fn copy_boot_manager(&self, _source: &Path, _volume: &Path) -> Result<ServiceExit> {
        self.copy_calls.set(self.copy_calls.get() + 1);
        Ok(ServiceExit {
            code: Some(self.copy_code),
            detail: format!("boot-manager copy exited {}", self.copy_code),
        })
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
        self.sector_calls.set(self.sector_calls.get() + 1);
        Ok(ServiceExit {
            code: Some(self.sector_code),
            detail: format!("sector tool exited {}", self.sector_code),
        })
    }
}

struct Fixture {
    _image_dir: tempfile::TempDir,
    _volume_dir: tempfile::TempDir,
    tools_dir: tempfile::TempDir,
    host: FakeHost,
    disk: FakeDisk,
    mounter: FakeMounter,
    boot: FakeBoot,
    params: CreateParams,
}

impl Fixture {
    /// A BIOS-style image: no EFI directory, sector tool available.
    fn bios() -> Self {
        let mut fixture = Self::empty();
        write_file(fixture.image_root(), "isolinux/isolinux.cfg", b"default linux");
        write_file(fixture.image_root(), "boot/vmlinuz", b"kernel");
        let tool = fixture.tools_dir.path().join("syslinux");
        fs::write(&tool, b"tool").unwrap();
        fixture.boot.candidates = vec![fixture.tools_dir.path().join("missing"), tool];
        fixture
    }

    /// A Windows-style UEFI image: EFI boot binary plus install.wim.
    fn uefi() -> Self {
        let mut fixture = Self::empty();
        write_file(fixture.image_root(), "EFI/BOOT/BOOTX64.EFI", b"efi");
        write_file(fixture.image_root(), "sources/install.wim", b"wim");
        write_file(fixture.image_root(), "sources/boot.wim", b"wim");
        fixture.params.boot_mode = BootModeRequest::Auto;
        fixture
    }

    fn empty() -> Self {
        let image_dir = tempfile::tempdir().unwrap();
        let volume_dir = tempfile::tempdir().unwrap();
        let tools_dir = tempfile::tempdir().unwrap();
        let disk = FakeDisk::new(volume_dir.path().to_path_buf());
        let mounter = FakeMounter::new(image_dir.path().to_path_buf());
        let mut params = CreateParams::new(image_dir.path().join("win.iso"), "E");
        params.confirmation_token = Some("BSM-test".to_string());
        Self {
            _image_dir: image_dir,
            _volume_dir: volume_dir,
            tools_dir,
            host: FakeHost::default(),
            disk,
            mounter,
            boot: FakeBoot::default(),
            params,
        }
    }

    fn image_root(&self) -> &Path {
        &self.mounter.image_root
    }

    fn volume_root(&self) -> &Path {
        &self.disk.volume_root
    }

    fn run(&self) -> bootsmith_engine::RunOutcome {
        let services = Services {
            host: &self.host,
            disk: &self.disk,
            mounter: &self.mounter,
            boot: &self.boot,
        };
        create_boot_drive(&self.params, &services)
    }
}

fn write_file(root: &Path, rel: &str, data: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

fn stages(report: &RunReport) -> Vec<Stage> {
    report.stages.iter().map(|result| result.stage).collect()
}

fn assert_balanced(fixture: &Fixture) {
    assert_eq!(
        fixture.mounter.active.get(),
        0,
        "image must be unmounted when the pipeline ends"
    );
}

#[test]
fn bios_auto_run_succeeds_end_to_end() {
    let fixture = Fixture::bios();
    let outcome = fixture.run();

    assert!(outcome.report.succeeded(), "{:?}", outcome.report.stages);
    assert_eq!(
        stages(&outcome.report),
        vec![
            Stage::Preflight,
            Stage::ResolveDevice,
            Stage::SafetyCheck,
            Stage::Partition,
            Stage::Format,
            Stage::MountImage,
            Stage::CopyContents,
            Stage::ResolveBootMode,
            Stage::InstallBootloader,
            Stage::ReleaseImage,
        ]
    );
    assert_eq!(outcome.report.plan.resolved, Some(BootMode::Bios));
    assert_eq!(outcome.report.plan.scheme, PartitionScheme::Mbr);
    assert_eq!(fixture.boot.sector_calls.get(), 1);
    assert_eq!(fixture.boot.copy_calls.get(), 0);
    assert_eq!(fixture.mounter.mounts.get(), 1);
    assert_eq!(fixture.mounter.unmounts.get(), 1);
    assert_balanced(&fixture);
}

#[test]
fn copied_tree_round_trips_every_file() {
    let fixture = Fixture::bios();
    fixture.run();

    for rel in ["isolinux/isolinux.cfg", "boot/vmlinuz"] {
        let source = fixture.image_root().join(rel);
        let dest = fixture.volume_root().join(rel);
        assert!(dest.is_file(), "missing {}", rel);
        assert_eq!(
            fs::metadata(&source).unwrap().len(),
            fs::metadata(&dest).unwrap().len()
        );
    }
}

#[test]
fn auto_mode_resolves_uefi_from_copied_efi_directory() {
    let fixture = Fixture::uefi();
    let outcome = fixture.run();

    assert!(outcome.report.succeeded(), "{:?}", outcome.report.stages);
    assert_eq!(outcome.report.plan.resolved, Some(BootMode::Uefi));
    // Auto keeps the MBR layout even when UEFI is resolved afterwards.
    assert_eq!(outcome.report.plan.scheme, PartitionScheme::Mbr);
    assert!(stages(&outcome.report).contains(&Stage::LocateWindowsSource));
    assert_eq!(fixture.boot.copy_calls.get(), 1);
    assert_eq!(fixture.boot.sector_calls.get(), 0);
    assert_balanced(&fixture);

    let locate = outcome
        .report
        .stages
        .iter()
        .find(|result| result.stage == Stage::LocateWindowsSource)
        .unwrap();
    assert!(locate.message.contains("detected-from-image"));
}

#[test]
fn explicit_uefi_request_partitions_gpt() {
    let mut fixture = Fixture::uefi();
    fixture.params.boot_mode = BootModeRequest::Uefi;
    let outcome = fixture.run();

    assert!(outcome.report.succeeded());
    assert_eq!(outcome.report.plan.scheme, PartitionScheme::Gpt);
    assert_eq!(*fixture.disk.schemes.borrow(), vec![PartitionScheme::Gpt]);
}

#[test]
fn uefi_warning_exit_is_tolerated_when_binary_landed() {
    let mut fixture = Fixture::uefi();
    fixture.boot.copy_code = 1;
    let outcome = fixture.run();

    // The copy stage placed EFI/BOOT/BOOTX64.EFI on the volume, so the
    // non-zero service exit is downgraded to a warning.
    assert!(outcome.report.succeeded(), "{:?}", outcome.report.stages);
    let install = outcome
        .report
        .stages
        .iter()
        .find(|result| result.stage == Stage::InstallBootloader)
        .unwrap();
    assert!(install.message.contains("despite exit"));
}

#[test]
fn uefi_warning_exit_without_binary_is_fatal() {
    let mut fixture = Fixture::empty();
    // Explicit UEFI against an image that carries no EFI binary at all.
    write_file(fixture.image_root(), "readme.txt", b"nothing bootable");
    fixture.params.boot_mode = BootModeRequest::Uefi;
    fixture.params.source_override = Some(fixture.image_root().to_path_buf());
    fixture.boot.copy_code = 1;
    let outcome = fixture.run();

    assert!(!outcome.report.succeeded());
    let failure = outcome.report.first_failure().unwrap();
    assert_eq!(failure.stage, Stage::InstallBootloader);
    assert_eq!(failure.error_kind.as_deref(), Some("BootloaderInstallFailure"));
    assert_balanced(&fixture);
}

#[test]
fn missing_sector_tool_halts_with_prior_successes_reported() {
    let mut fixture = Fixture::bios();
    fixture.boot.candidates = vec![fixture.tools_dir.path().join("gone")];
    let outcome = fixture.run();

    assert!(!outcome.report.succeeded());
    let failure = outcome.report.first_failure().unwrap();
    assert_eq!(failure.stage, Stage::InstallBootloader);
    assert_eq!(failure.error_kind.as_deref(), Some("BootloaderToolMissing"));

    // Everything attempted before the failure is still reported as success,
    // the failing stage is last, and nothing is reported twice.
    let seen = stages(&outcome.report);
    assert_eq!(*seen.last().unwrap(), Stage::InstallBootloader);
    let copy = outcome
        .report
        .stages
        .iter()
        .find(|result| result.stage == Stage::CopyContents)
        .unwrap();
    assert!(copy.success);
    let mut unique = seen.clone();
    unique.dedup();
    assert_eq!(unique.len(), seen.len());
    assert_balanced(&fixture);
}

#[test]
fn mount_failure_reports_the_exact_partial_state() {
    let mut fixture = Fixture::bios();
    fixture.mounter.fail_mount = true;
    let outcome = fixture.run();

    // Device prep precedes the mount, so the device was already wiped and
    // formatted; the report must say exactly that.
    assert_eq!(
        stages(&outcome.report),
        vec![
            Stage::Preflight,
            Stage::ResolveDevice,
            Stage::SafetyCheck,
            Stage::Partition,
            Stage::Format,
            Stage::MountImage,
        ]
    );
    assert_eq!(fixture.disk.wipes.get(), 1);
    let failure = outcome.report.first_failure().unwrap();
    assert_eq!(failure.stage, Stage::MountImage);
    assert_eq!(failure.error_kind.as_deref(), Some("MountFailure"));
    assert_balanced(&fixture);
}

#[test]
fn unresolvable_volume_is_device_not_found() {
    let mut fixture = Fixture::bios();
    fixture.host.resolve_fails = true;
    let outcome = fixture.run();

    let failure = outcome.report.first_failure().unwrap();
    assert_eq!(failure.stage, Stage::ResolveDevice);
    assert_eq!(failure.error_kind.as_deref(), Some("DeviceNotFound"));
    assert_eq!(fixture.disk.wipes.get(), 0);
}

#[test]
fn missing_elevation_stops_at_preflight() {
    let mut fixture = Fixture::bios();
    fixture.host.elevated = false;
    let outcome = fixture.run();

    assert_eq!(stages(&outcome.report), vec![Stage::Preflight]);
    let failure = outcome.report.first_failure().unwrap();
    assert_eq!(failure.error_kind.as_deref(), Some("PermissionDenied"));
}

#[test]
fn system_disk_is_refused_before_any_write() {
    let mut fixture = Fixture::bios();
    fixture.host.system_disk = true;
    fixture.params.force = true;
    let outcome = fixture.run();

    let failure = outcome.report.first_failure().unwrap();
    assert_eq!(failure.stage, Stage::SafetyCheck);
    assert_eq!(failure.error_kind.as_deref(), Some("TargetRefused"));
    assert_eq!(fixture.disk.wipes.get(), 0);
    assert_eq!(fixture.mounter.mounts.get(), 0);
}

#[test]
fn dry_run_stops_after_the_plan_stage() {
    let mut fixture = Fixture::bios();
    fixture.params.dry_run = true;
    fixture.params.confirmation_token = None;
    let outcome = fixture.run();

    assert!(outcome.report.succeeded());
    assert_eq!(
        stages(&outcome.report),
        vec![
            Stage::Preflight,
            Stage::ResolveDevice,
            Stage::SafetyCheck,
            Stage::Plan,
        ]
    );
    assert_eq!(fixture.disk.wipes.get(), 0);
    assert_eq!(fixture.mounter.mounts.get(), 0);
}

#[test]
fn release_failure_never_masks_a_successful_run() {
    let mut fixture = Fixture::bios();
    fixture.mounter.fail_unmount = true;
    let outcome = fixture.run();

    assert!(outcome.report.succeeded());
    let release = outcome
        .report
        .stages
        .iter()
        .find(|result| result.stage == Stage::ReleaseImage)
        .unwrap();
    assert!(release.success);
    assert!(release.message.contains("ignored"));
}

#[test]
fn hash_manifest_lists_every_copied_file() {
    let mut fixture = Fixture::bios();
    fixture.params.hash_manifest = true;
    let outcome = fixture.run();

    let manifest = outcome.manifest.expect("manifest requested");
    let entries: serde_json::Value = serde_json::from_slice(&manifest).unwrap();
    assert_eq!(entries.as_array().unwrap().len(), 2);
}

#[test]
fn rerun_skips_files_already_on_the_volume() {
    let fixture = Fixture::bios();
    let first = fixture.run();
    assert!(first.report.succeeded());

    let second = fixture.run();
    assert!(second.report.succeeded());
    let copy = second
        .report
        .stages
        .iter()
        .find(|result| result.stage == Stage::CopyContents)
        .unwrap();
    assert!(copy.message.contains("2 already present"), "{}", copy.message);
}
