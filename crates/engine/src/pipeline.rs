use crate::install;
use crate::resolve;
use crate::services::{MountGuard, Services};
use crate::transfer;
use bootsmith_core::{
    BootMode, BootModeRequest, BootPlan, EngineError, FileSystem, PartitionScheme, RunReport,
    Stage,
};
use bootsmith_safety::{can_write_to_disk, SafetyContext, SafetyDecision};
use std::path::PathBuf;

pub const DEFAULT_LABEL: &str = "BOOTSMITH";

#[derive(Debug, Clone)]
pub struct CreateParams {
    pub image_path: PathBuf,
    pub volume: String,
    pub boot_mode: BootModeRequest,
    pub filesystem: FileSystem,
    pub label: String,
    pub source_override: Option<PathBuf>,
    pub force: bool,
    pub confirmation_token: Option<String>,
    pub dry_run: bool,
    pub hash_manifest: bool,
}

impl CreateParams {
    pub fn new(image_path: impl Into<PathBuf>, volume: impl Into<String>) -> Self {
        Self {
            image_path: image_path.into(),
            volume: volume.into(),
            boot_mode: BootModeRequest::Auto,
            filesystem: FileSystem::Fat32,
            label: DEFAULT_LABEL.to_string(),
            source_override: None,
            force: false,
            confirmation_token: None,
            dry_run: false,
            hash_manifest: false,
        }
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub logs: Vec<String>,
    pub manifest: Option<Vec<u8>>,
}

/// Runs the whole pipeline once. Sequential, no retries: the first failing
/// stage halts the run, the image mount is released on every path, and the
/// report lists exactly the stages attempted.
pub fn create_boot_drive(params: &CreateParams, services: &Services<'_>) -> RunOutcome {
    let plan = BootPlan::from_request(params.boot_mode);
    let label = params.filesystem.normalize_label(&params.label);
    let image = params.image_path.display().to_string();
    let mut report = RunReport::new(&image, &params.volume, plan, params.dry_run);

    let mut logs = Vec::new();
    logs.push(format!("run_id={}", report.run_id));
    logs.push(format!("image={}", image));
    logs.push(format!("volume={}", params.volume));
    logs.push(format!("requested_mode={}", params.boot_mode.as_str()));
    logs.push(format!("scheme={}", report.plan.scheme.as_str()));
    logs.push(format!(
        "filesystem={} label={}",
        params.filesystem.as_str(),
        label
    ));

    match services.host.is_elevated() {
        Ok(true) => {
            logs.push("preflight=elevated".to_string());
            report.record_success(Stage::Preflight, "running with administrative privileges");
        }
        Ok(false) => {
            return abort(
                report,
                logs,
                None,
                Stage::Preflight,
                EngineError::PermissionDenied(
                    "administrative privileges are required".to_string(),
                ),
            )
        }
        Err(error) => {
            return abort(
                report,
                logs,
                None,
                Stage::Preflight,
                EngineError::PermissionDenied(error.to_string()),
            )
        }
    }

    let target = match services.host.resolve_target(&params.volume) {
        Ok(target) => {
            logs.push(format!("device={}", target.device_path));
            report.record_success(
                Stage::ResolveDevice,
                format!("{} is {}", params.volume, target.device_path),
            );
            target
        }
        Err(error) => {
            return abort(
                report,
                logs,
                None,
                Stage::ResolveDevice,
                EngineError::DeviceNotFound(error.to_string()),
            )
        }
    };

    let decision = match services.host.device_graph() {
        Ok(graph) => match graph.disk_by_device_path(&target.device_path) {
            Some(disk) => can_write_to_disk(
                &SafetyContext {
                    force: params.force,
                    dry_run: params.dry_run,
                    confirmation_token: params.confirmation_token.clone(),
                },
                disk.is_system_disk,
                disk.removable,
            ),
            None => SafetyDecision::Deny(format!(
                "target {} not present in device graph",
                target.device_path
            )),
        },
        Err(error) => SafetyDecision::Deny(format!("device graph unavailable: {}", error)),
    };
    match decision {
        SafetyDecision::Allow => {
            report.record_success(
                Stage::SafetyCheck,
                format!("destructive write to {} allowed", target.device_path),
            );
        }
        SafetyDecision::Deny(reason) => {
            return abort(
                report,
                logs,
                None,
                Stage::SafetyCheck,
                EngineError::TargetRefused(reason),
            )
        }
    }

    if params.dry_run {
        logs.push("dry_run=true".to_string());
        report.record_success(
            Stage::Plan,
            format!(
                "would wipe {} to {}, format {} '{}', copy {} and install the {} boot loader",
                target.device_path,
                report.plan.scheme.as_str(),
                params.filesystem.as_str(),
                label,
                image,
                params.boot_mode.as_str()
            ),
        );
        return finish(report, logs, None);
    }

    match services.disk.wipe_and_partition(&target, report.plan.scheme) {
        Ok(()) => {
            logs.push(format!("partitioned={}", report.plan.scheme.as_str()));
            report.record_success(
                Stage::Partition,
                format!(
                    "wiped {} and created one {} partition",
                    target.device_path,
                    report.plan.scheme.as_str()
                ),
            );
        }
        Err(error) => {
            return abort(
                report,
                logs,
                None,
                Stage::Partition,
                EngineError::FormatFailure(error.to_string()),
            )
        }
    }

    let volume_root = match services.disk.format_volume(&target, params.filesystem, &label) {
        Ok(root) => {
            logs.push(format!("volume_root={}", root.display()));
            report.record_success(
                Stage::Format,
                format!(
                    "formatted {} '{}' at {}",
                    params.filesystem.as_str(),
                    label,
                    root.display()
                ),
            );
            root
        }
        Err(error) => {
            return abort(
                report,
                logs,
                None,
                Stage::Format,
                EngineError::FormatFailure(error.to_string()),
            )
        }
    };

    // One mount per run, held until its last consumer (source detection and
    // the sector-tool search both read the image root).
    let mut mount = match MountGuard::acquire(services.mounter, &params.image_path) {
        Ok(mount) => {
            logs.push(format!("image_root={}", mount.root().display()));
            report.record_success(
                Stage::MountImage,
                format!("image mounted at {}", mount.root().display()),
            );
            mount
        }
        Err(error) => {
            return abort(
                report,
                logs,
                None,
                Stage::MountImage,
                EngineError::MountFailure(error.to_string()),
            )
        }
    };

    let copy = match transfer::copy_tree(
        mount.root(),
        &volume_root,
        params.filesystem,
        params.hash_manifest,
    ) {
        Ok(copy) => {
            logs.push(format!(
                "copied_files={} skipped_files={} copied_bytes={}",
                copy.copied, copy.skipped, copy.bytes
            ));
            report.record_success(
                Stage::CopyContents,
                format!(
                    "copied {} files ({} bytes), {} already present",
                    copy.copied, copy.bytes, copy.skipped
                ),
            );
            copy
        }
        Err(error) => {
            release_into_logs(&mut mount, &mut logs);
            return abort(
                report,
                logs,
                None,
                Stage::CopyContents,
                EngineError::CopyFailure(error.to_string()),
            );
        }
    };
    let manifest = if params.hash_manifest && !copy.manifest.is_empty() {
        serde_json::to_vec_pretty(&copy.manifest).ok()
    } else {
        None
    };

    let mode = resolve::resolve_boot_mode(params.boot_mode, &volume_root);
    report.plan.resolve(mode);
    logs.push(format!("resolved_mode={}", mode.as_str()));
    report.record_success(
        Stage::ResolveBootMode,
        format!(
            "boot mode {} (requested {})",
            mode.as_str(),
            params.boot_mode.as_str()
        ),
    );
    if mode == BootMode::Uefi && report.plan.scheme == PartitionScheme::Mbr {
        logs.push("note=installing UEFI boot files onto the MBR layout kept by the auto request".to_string());
    }

    let install_result = match mode {
        BootMode::Uefi => {
            let source = resolve::locate_windows_source(
                mount.root(),
                params.source_override.as_deref(),
                &services.host.default_source_root(),
            );
            logs.push(format!(
                "windows_source={} origin={}",
                source.root.display(),
                source.origin.as_str()
            ));
            report.record_success(
                Stage::LocateWindowsSource,
                format!("{} ({})", source.root.display(), source.origin.as_str()),
            );
            install::install_uefi(services.boot, &source, &volume_root)
        }
        BootMode::Bios => match install::find_sector_tool(services.boot, mount.root()) {
            Ok(tool) => {
                logs.push(format!("sector_tool={}", tool.display()));
                install::install_bios(services.boot, &tool, &target, &volume_root)
            }
            Err(error) => Err(error),
        },
    };
    match install_result {
        Ok(message) => report.record_success(Stage::InstallBootloader, message),
        Err(error) => {
            release_into_logs(&mut mount, &mut logs);
            return abort(report, logs, manifest, Stage::InstallBootloader, error);
        }
    }

    let release_message = match mount.release() {
        None => "image unmounted".to_string(),
        Some(error) => format!("image release failed (ignored): {}", error),
    };
    logs.push(format!("release={}", release_message));
    report.record_success(Stage::ReleaseImage, release_message);

    finish(report, logs, manifest)
}

fn release_into_logs(mount: &mut MountGuard<'_>, logs: &mut Vec<String>) {
    match mount.release() {
        None => logs.push("image_released=ok".to_string()),
        Some(error) => logs.push(format!("image_release_error={}", error)),
    }
}

fn abort(
    mut report: RunReport,
    mut logs: Vec<String>,
    manifest: Option<Vec<u8>>,
    stage: Stage,
    error: EngineError,
) -> RunOutcome {
    logs.push(format!("stage={} failed: {}", stage.as_str(), error));
    report.record_failure(stage, &error);
    report.finish();
    RunOutcome {
        report,
        logs,
        manifest,
    }
}

fn finish(mut report: RunReport, logs: Vec<String>, manifest: Option<Vec<u8>>) -> RunOutcome {
    report.finish();
    RunOutcome {
        report,
        logs,
        manifest,
    }
}
