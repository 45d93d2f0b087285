use anyhow::{Context, Result};
use bootsmith_core::RunReport;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub run_id: String,
    pub root: PathBuf,
    pub run_json: PathBuf,
    pub logs_path: PathBuf,
    pub manifest_json: Option<PathBuf>,
}

/// Writes one run's bundle under `base`: `run-<uuid>/run.json`, `logs.txt`,
/// and `manifest.json` when a copy manifest was produced.
pub fn write_report_bundle(
    base: impl AsRef<Path>,
    report: &RunReport,
    logs: &[String],
    manifest: Option<&[u8]>,
) -> Result<ReportPaths> {
    let run_id = report.run_id.to_string();
    let root = base.as_ref().join(format!("run-{}", run_id));
    std::fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;

    let run_json = root.join("run.json");
    let run_data = serde_json::to_string_pretty(report)?;
    std::fs::write(&run_json, run_data).with_context(|| format!("write {}", run_json.display()))?;

    let logs_path = root.join("logs.txt");
    std::fs::write(&logs_path, logs.join("\n"))
        .with_context(|| format!("write {}", logs_path.display()))?;

    let manifest_json = match manifest {
        Some(bytes) => {
            let path = root.join("manifest.json");
            std::fs::write(&path, bytes).with_context(|| format!("write {}", path.display()))?;
            Some(path)
        }
        None => None,
    };

    Ok(ReportPaths {
        run_id,
        root,
        run_json,
        logs_path,
        manifest_json,
    })
}
