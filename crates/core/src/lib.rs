use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

pub const DEVICE_GRAPH_SCHEMA_VERSION: &str = "1.0.0";
pub const RUN_REPORT_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceGraph {
    pub graph_id: Uuid,
    pub schema_version: String,
    pub host: HostInfo,
    pub disks: Vec<Disk>,
    pub generated_at_utc: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostInfo {
    pub os: String,        // "windows", "linux"
    pub os_version: String,
    pub machine: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Disk {
    pub id: String,                // stable id per provider
    pub friendly_name: String,
    pub device_path: String,       // \\.\PhysicalDriveN or /dev/sdX
    pub size_bytes: u64,
    pub is_system_disk: bool,      // provider best-effort
    pub removable: bool,
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Partition {
    pub id: String,
    pub label: Option<String>,
    pub fs: Option<String>,
    pub size_bytes: u64,
    pub mount_points: Vec<String>,
}

impl DeviceGraph {
    pub fn new(host: HostInfo, disks: Vec<Disk>) -> Self {
        Self {
            graph_id: Uuid::new_v4(),
            schema_version: DEVICE_GRAPH_SCHEMA_VERSION.to_string(),
            host,
            disks,
            generated_at_utc: now_utc_rfc3339(),
        }
    }

    pub fn disk_by_device_path(&self, device_path: &str) -> Option<&Disk> {
        self.disks
            .iter()
            .find(|disk| disk.device_path.eq_ignore_ascii_case(device_path))
    }

    /// Looks a disk up by the trailing digits of its device path
    /// (`\\.\PhysicalDrive2`, `/dev/loop7`). Paths without a numeric
    /// suffix never match.
    pub fn disk_by_number(&self, number: u32) -> Option<&Disk> {
        self.disks.iter().find(|disk| {
            let digits: String = disk
                .device_path
                .chars()
                .rev()
                .take_while(|ch| ch.is_ascii_digit())
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            digits.parse::<u32>().map_or(false, |n| n == number)
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceTarget {
    pub volume: String,
    pub disk_number: u32,
    pub device_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum BootModeRequest {
    Auto,
    Bios,
    Uefi,
}

impl BootModeRequest {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootModeRequest::Auto => "auto",
            BootModeRequest::Bios => "bios",
            BootModeRequest::Uefi => "uefi",
        }
    }
}

pub fn parse_boot_mode(value: &str) -> Option<BootModeRequest> {
    match value.trim().to_ascii_lowercase().as_str() {
        "auto" => Some(BootModeRequest::Auto),
        "bios" | "legacy" | "mbr" => Some(BootModeRequest::Bios),
        "uefi" | "efi" => Some(BootModeRequest::Uefi),
        _ => None,
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    Bios,
    Uefi,
}

impl BootMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootMode::Bios => "BIOS",
            BootMode::Uefi => "UEFI",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum PartitionScheme {
    Mbr,
    Gpt,
}

impl PartitionScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionScheme::Mbr => "MBR",
            PartitionScheme::Gpt => "GPT",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum FileSystem {
    Fat32,
    Ntfs,
    ExFat,
}

impl FileSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileSystem::Fat32 => "FAT32",
            FileSystem::Ntfs => "NTFS",
            FileSystem::ExFat => "exFAT",
        }
    }

    pub fn normalize_label(&self, label: &str) -> String {
        let trimmed = label.trim();
        match self {
            // FAT32 labels are limited to 11 bytes, conventionally upper case.
            FileSystem::Fat32 => {
                let upper = trimmed.to_ascii_uppercase();
                upper.chars().take(11).collect()
            }
            _ => trimmed.chars().take(32).collect(),
        }
    }
}

pub fn parse_filesystem(value: &str) -> Option<FileSystem> {
    match value.trim().to_ascii_lowercase().as_str() {
        "fat32" => Some(FileSystem::Fat32),
        "ntfs" => Some(FileSystem::Ntfs),
        "exfat" => Some(FileSystem::ExFat),
        _ => None,
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BootPlan {
    pub requested: BootModeRequest,
    pub scheme: PartitionScheme,
    pub resolved: Option<BootMode>,
}

impl BootPlan {
    // The scheme is fixed before partitioning. Auto keeps MBR: FAT32 on MBR
    // is readable by both firmware classes, so a later UEFI resolution still
    // yields a bootable layout.
    pub fn from_request(requested: BootModeRequest) -> Self {
        let scheme = match requested {
            BootModeRequest::Uefi => PartitionScheme::Gpt,
            BootModeRequest::Bios | BootModeRequest::Auto => PartitionScheme::Mbr,
        };
        Self {
            requested,
            scheme,
            resolved: None,
        }
    }

    pub fn resolve(&mut self, mode: BootMode) {
        if self.resolved.is_none() {
            self.resolved = Some(mode);
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SourceOrigin {
    DetectedFromImage,
    CallerOverride,
    SystemDefault,
}

impl SourceOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceOrigin::DetectedFromImage => "detected-from-image",
            SourceOrigin::CallerOverride => "caller-override",
            SourceOrigin::SystemDefault => "system-default",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WindowsSource {
    pub root: PathBuf,
    pub origin: SourceOrigin,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preflight,
    ResolveDevice,
    SafetyCheck,
    Plan,
    Partition,
    Format,
    MountImage,
    CopyContents,
    ReleaseImage,
    ResolveBootMode,
    LocateWindowsSource,
    InstallBootloader,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preflight => "preflight",
            Stage::ResolveDevice => "resolve-device",
            Stage::SafetyCheck => "safety-check",
            Stage::Plan => "plan",
            Stage::Partition => "partition",
            Stage::Format => "format",
            Stage::MountImage => "mount-image",
            Stage::CopyContents => "copy-contents",
            Stage::ReleaseImage => "release-image",
            Stage::ResolveBootMode => "resolve-boot-mode",
            Stage::LocateWindowsSource => "locate-windows-source",
            Stage::InstallBootloader => "install-bootloader",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageResult {
    pub stage: Stage,
    pub success: bool,
    pub message: String,
    pub error_kind: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub schema_version: String,
    pub started_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub image_path: String,
    pub volume: String,
    pub plan: BootPlan,
    pub dry_run: bool,
    pub stages: Vec<StageResult>,
}

impl RunReport {
    pub fn new(image_path: &str, volume: &str, plan: BootPlan, dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            schema_version: RUN_REPORT_SCHEMA_VERSION.to_string(),
            started_at_utc: now_utc_rfc3339(),
            finished_at_utc: None,
            image_path: image_path.to_string(),
            volume: volume.to_string(),
            plan,
            dry_run,
            stages: Vec::new(),
        }
    }

    pub fn record_success(&mut self, stage: Stage, message: impl Into<String>) {
        self.stages.push(StageResult {
            stage,
            success: true,
            message: message.into(),
            error_kind: None,
        });
    }

    pub fn record_failure(&mut self, stage: Stage, error: &EngineError) {
        self.stages.push(StageResult {
            stage,
            success: false,
            message: error.to_string(),
            error_kind: Some(error.kind().to_string()),
        });
    }

    pub fn finish(&mut self) {
        self.finished_at_utc = Some(now_utc_rfc3339());
    }

    pub fn succeeded(&self) -> bool {
        !self.stages.is_empty() && self.stages.iter().all(|stage| stage.success)
    }

    pub fn first_failure(&self) -> Option<&StageResult> {
        self.stages.iter().find(|stage| !stage.success)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("target refused: {0}")]
    TargetRefused(String),
    #[error("format failure: {0}")]
    FormatFailure(String),
    #[error("mount failure: {0}")]
    MountFailure(String),
    #[error("copy failure: {0}")]
    CopyFailure(String),
    #[error("source detection failure: {0}")]
    SourceDetectionFailure(String),
    #[error("bootloader tool missing: {0}")]
    BootloaderToolMissing(String),
    #[error("bootloader install failure: {0}")]
    BootloaderInstallFailure(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::DeviceNotFound(_) => "DeviceNotFound",
            EngineError::PermissionDenied(_) => "PermissionDenied",
            EngineError::TargetRefused(_) => "TargetRefused",
            EngineError::FormatFailure(_) => "FormatFailure",
            EngineError::MountFailure(_) => "MountFailure",
            EngineError::CopyFailure(_) => "CopyFailure",
            EngineError::SourceDetectionFailure(_) => "SourceDetectionFailure",
            EngineError::BootloaderToolMissing(_) => "BootloaderToolMissing",
            EngineError::BootloaderInstallFailure(_) => "BootloaderInstallFailure",
        }
    }
}

pub fn now_utc_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_follows_requested_mode() {
        assert_eq!(
            BootPlan::from_request(BootModeRequest::Uefi).scheme,
            PartitionScheme::Gpt
        );
        assert_eq!(
            BootPlan::from_request(BootModeRequest::Bios).scheme,
            PartitionScheme::Mbr
        );
        assert_eq!(
            BootPlan::from_request(BootModeRequest::Auto).scheme,
            PartitionScheme::Mbr
        );
    }

    #[test]
    fn resolution_is_sticky() {
        let mut plan = BootPlan::from_request(BootModeRequest::Auto);
        plan.resolve(BootMode::Uefi);
        plan.resolve(BootMode::Bios);
        assert_eq!(plan.resolved, Some(BootMode::Uefi));
    }

    #[test]
    fn fat32_label_is_truncated_and_uppercased() {
        let label = FileSystem::Fat32.normalize_label("my long boot label");
        assert_eq!(label, "MY LONG BOO");
        assert_eq!(FileSystem::Ntfs.normalize_label(" data "), "data");
    }

    #[test]
    fn report_tracks_first_failure() {
        let plan = BootPlan::from_request(BootModeRequest::Auto);
        let mut report = RunReport::new("win.iso", "E", plan, false);
        report.record_success(Stage::Preflight, "elevated");
        report.record_failure(
            Stage::Partition,
            &EngineError::FormatFailure("clean failed".to_string()),
        );
        assert!(!report.succeeded());
        let failure = report.first_failure().unwrap();
        assert_eq!(failure.stage, Stage::Partition);
        assert_eq!(failure.error_kind.as_deref(), Some("FormatFailure"));
    }

    #[test]
    fn empty_report_is_not_a_success() {
        let plan = BootPlan::from_request(BootModeRequest::Bios);
        let report = RunReport::new("win.iso", "E", plan, false);
        assert!(!report.succeeded());
    }

    #[test]
    fn disk_lookup_by_number() {
        let graph = DeviceGraph::new(
            HostInfo {
                os: "windows".to_string(),
                os_version: "unknown".to_string(),
                machine: "unknown".to_string(),
            },
            vec![Disk {
                id: "PhysicalDrive2".to_string(),
                friendly_name: "USB Flash".to_string(),
                device_path: r"\\.\PhysicalDrive2".to_string(),
                size_bytes: 16 * 1024 * 1024 * 1024,
                is_system_disk: false,
                removable: true,
                partitions: vec![],
            }],
        );
        assert!(graph.disk_by_number(2).is_some());
        assert!(graph.disk_by_number(0).is_none());
    }
}
