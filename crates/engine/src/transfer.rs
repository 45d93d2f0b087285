use anyhow::{anyhow, Context, Result};
use bootsmith_core::FileSystem;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub const FAT32_MAX_FILE: u64 = 4_294_967_295;

#[derive(Debug)]
pub struct FileEntry {
    pub absolute_path: PathBuf,
    pub relative_path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct ManifestEntry {
    pub path: String,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Default)]
pub struct CopyOutcome {
    pub copied: usize,
    pub skipped: usize,
    pub bytes: u64,
    pub manifest: Vec<ManifestEntry>,
}

pub fn collect_files(root: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    collect_files_inner(root, root, &mut entries)?;
    Ok(entries)
}

fn collect_files_inner(root: &Path, current: &Path, entries: &mut Vec<FileEntry>) -> Result<()> {
    for entry in fs::read_dir(current).with_context(|| format!("read {}", current.display()))? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            collect_files_inner(root, &path, entries)?;
        } else if metadata.is_file() {
            let relative_path = path
                .strip_prefix(root)
                .map(PathBuf::from)
                .context("strip source prefix")?;
            entries.push(FileEntry {
                absolute_path: path,
                relative_path,
                size: metadata.len(),
            });
        }
    }
    Ok(())
}

/// Copies every collected entry onto the target volume, preserving relative
/// paths and overwriting conflicts. An entry whose destination already exists
/// with an identical byte length is skipped, which makes an interrupted run
/// resumable. After the loop every entry is verified to exist at the target
/// with its source length.
pub fn copy_tree(
    source_root: &Path,
    target_root: &Path,
    fs_kind: FileSystem,
    hash_manifest: bool,
) -> Result<CopyOutcome> {
    let entries = collect_files(source_root)?;

    if fs_kind == FileSystem::Fat32 {
        if let Some(oversized) = entries.iter().find(|entry| entry.size > FAT32_MAX_FILE) {
            return Err(anyhow!(
                "{} is {} bytes, larger than FAT32 allows; use NTFS or exFAT",
                oversized.relative_path.display(),
                oversized.size
            ));
        }
    }

    let mut outcome = CopyOutcome::default();
    for entry in &entries {
        let dest_path = target_root.join(&entry.relative_path);
        if let Ok(existing) = fs::metadata(&dest_path) {
            if existing.is_file() && existing.len() == entry.size {
                outcome.skipped += 1;
                continue;
            }
        }
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
        }
        fs::copy(&entry.absolute_path, &dest_path).with_context(|| {
            format!(
                "copy {} to {}",
                entry.absolute_path.display(),
                dest_path.display()
            )
        })?;
        outcome.copied += 1;
        outcome.bytes = outcome.bytes.saturating_add(entry.size);
        if hash_manifest {
            outcome.manifest.push(ManifestEntry {
                path: entry.relative_path.to_string_lossy().replace('\\', "/"),
                bytes: entry.size,
                sha256: hash_file(&entry.absolute_path)?,
            });
        }
    }

    verify_copy(target_root, &entries)?;
    Ok(outcome)
}

fn verify_copy(target_root: &Path, entries: &[FileEntry]) -> Result<()> {
    for entry in entries {
        let dest_path = target_root.join(&entry.relative_path);
        let metadata = fs::metadata(&dest_path)
            .with_context(|| format!("verify missing file {}", dest_path.display()))?;
        if metadata.len() != entry.size {
            return Err(anyhow!(
                "verify failed for {} (expected {}, got {})",
                dest_path.display(),
                entry.size,
                metadata.len()
            ));
        }
    }
    Ok(())
}

pub fn hash_file(path: &Path) -> Result<String> {
    use std::io::Read;
    let mut file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    Ok(out)
}
