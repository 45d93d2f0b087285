//! External boot tooling: bcdboot for the UEFI path, bootsect for the BIOS
//! boot sector. Exit status goes back to the engine undecided; the engine
//! owns the warn-versus-fail policy.

use anyhow::{Context, Result};
use bootsmith_bootloader::{BOOTSECT_ENV_OVERRIDE, SECTOR_TOOL_ALTERNATES, SECTOR_TOOL_FILE, SECTOR_TOOL_NAME};
use bootsmith_engine::ServiceExit;
use std::path::{Path, PathBuf};
use std::process::Command;

pub fn run_bcdboot(source_root: &Path, volume_root: &Path) -> Result<ServiceExit> {
    let volume = volume_spec(volume_root);
    run_tool(
        "bcdboot",
        &[&source_root.display().to_string(), "/s", &volume, "/f", "UEFI"],
    )
}

pub fn run_bootsect(tool: &Path, volume: &str) -> Result<ServiceExit> {
    run_tool(
        &tool.display().to_string(),
        &["/nt60", volume, "/force", "/mbr"],
    )
}

pub fn sector_tool_candidates(image_root: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(found) = which::which(SECTOR_TOOL_NAME) {
        candidates.push(found);
    }
    candidates.push(image_root.join("boot").join(SECTOR_TOOL_FILE));
    candidates.push(image_root.join("sources").join(SECTOR_TOOL_FILE));
    if let Ok(value) = std::env::var(BOOTSECT_ENV_OVERRIDE) {
        candidates.push(PathBuf::from(value));
    }
    for alternate in SECTOR_TOOL_ALTERNATES {
        candidates.push(PathBuf::from(alternate));
    }
    candidates
}

// "E:\" -> "E:", the volume form bcdboot and bootsect accept.
fn volume_spec(volume_root: &Path) -> String {
    let text = volume_root.display().to_string();
    text.trim_end_matches('\\').to_string()
}

fn run_tool(cmd: &str, args: &[&str]) -> Result<ServiceExit> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("run {}", cmd))?;
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let detail = if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        format!("{} exited {:?}", cmd, output.status.code())
    };
    Ok(ServiceExit {
        code: output.status.code(),
        detail,
    })
}
