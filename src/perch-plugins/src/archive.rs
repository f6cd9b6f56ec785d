//! Plugin archive extraction.
//!
//! Archives are unpacked into a staging folder inside the plugins root, then
//! moved into place once complete. A failed extraction leaves nothing behind.

use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;

use crate::{PluginError, Result};

/// Supported archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    /// Detect the format from a file name.
    pub fn detect(file_name: &str) -> Option<Self> {
        let lower = file_name.to_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// File name without its archive extension.
pub fn archive_stem(file_name: &str) -> &str {
    let lower = file_name.to_lowercase();
    for ext in [".tar.gz", ".tgz", ".tar", ".zip"] {
        if lower.ends_with(ext) {
            return &file_name[..file_name.len() - ext.len()];
        }
    }
    file_name
}

/// Validate that an entry does not escape the destination directory.
pub fn validate_path_safe(dest_dir: &Path, entry_name: &str) -> std::result::Result<PathBuf, String> {
    if entry_name.contains('\0') {
        return Err("Path contains null byte".to_string());
    }

    let entry_path = Path::new(entry_name);
    if entry_path.is_absolute() {
        return Err(format!("Absolute path not allowed: {}", entry_name));
    }

    for component in entry_path.components() {
        match component {
            Component::ParentDir => {
                return Err(format!("Path traversal not allowed: {}", entry_name));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(format!("Rooted path not allowed: {}", entry_name));
            }
            _ => {}
        }
    }

    Ok(dest_dir.join(entry_path))
}

/// A plugin unpacked in a staging folder, not yet in place.
#[derive(Debug)]
pub struct StagedPlugin {
    /// Plugin id (final folder name)
    pub id: String,
    root: PathBuf,
    // Removed on drop
    _staging: TempDir,
}

impl StagedPlugin {
    /// Move the plugin folder to `dest`, which must not exist.
    pub async fn commit(self, dest: &Path) -> Result<PathBuf> {
        if tokio::fs::try_exists(dest).await.unwrap_or(false) {
            return Err(PluginError::AlreadyExists(self.id));
        }
        tokio::fs::rename(&self.root, dest).await?;
        Ok(dest.to_path_buf())
    }
}

/// Unpack `archive_path` into a staging folder under `plugins_dir`.
///
/// A single top-level folder in the archive becomes the plugin folder and
/// names the plugin; otherwise the archive contents are the plugin folder and
/// the archive name (without extension) is the id.
pub async fn stage(archive_path: &Path, plugins_dir: &Path) -> Result<StagedPlugin> {
    let file_name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let format = ArchiveFormat::detect(&file_name)
        .ok_or_else(|| PluginError::Archive(format!("Unsupported archive type: {}", file_name)))?;

    tokio::fs::create_dir_all(plugins_dir).await?;
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(plugins_dir)?;
    let contents = staging.path().join("contents");

    let src = archive_path.to_path_buf();
    let dest = contents.clone();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::create_dir_all(&dest)?;
        let file = std::fs::File::open(&src)?;
        match format {
            ArchiveFormat::Zip => extract_zip(file, &dest),
            ArchiveFormat::Tar => safe_tar_unpack(&mut tar::Archive::new(file), &dest),
            ArchiveFormat::TarGz => safe_tar_unpack(
                &mut tar::Archive::new(flate2::read::GzDecoder::new(file)),
                &dest,
            ),
        }
    })
    .await
    .map_err(|e| PluginError::Archive(format!("Extraction aborted: {}", e)))?
    .map_err(|e| PluginError::Archive(format!("Failed to extract {}: {}", file_name, e)))?;

    let (id, root) = match single_top_level_dir(&contents)? {
        Some(dir) => (crate::manifest::plugin_id_from_path(&dir), dir),
        None => (archive_stem(&file_name).to_string(), contents),
    };
    if id.is_empty() || id.starts_with('.') {
        return Err(PluginError::Archive(format!(
            "Cannot derive a plugin id from {}",
            file_name
        )));
    }

    tracing::debug!("Staged plugin {} from {}", id, file_name);
    Ok(StagedPlugin {
        id,
        root,
        _staging: staging,
    })
}

fn single_top_level_dir(contents: &Path) -> Result<Option<PathBuf>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(contents)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        // Metadata folders added by archivers
        if name == "__MACOSX" || name.starts_with('.') {
            continue;
        }
        entries.push(entry);
    }

    match entries.as_slice() {
        [only] if only.file_type()?.is_dir() => Ok(Some(only.path())),
        _ => Ok(None),
    }
}

fn extract_zip(file: std::fs::File, dest_dir: &Path) -> std::io::Result<()> {
    let mut archive = zip::ZipArchive::new(file).map_err(std::io::Error::other)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(std::io::Error::other)?;
        let entry_name = entry.name().to_string();
        let outpath = validate_path_safe(dest_dir, &entry_name)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut outfile = std::fs::File::create(&outpath)?;
            std::io::copy(&mut entry, &mut outfile)?;
        }
    }
    Ok(())
}

fn safe_tar_unpack<R: std::io::Read>(archive: &mut tar::Archive<R>, dest_dir: &Path) -> std::io::Result<()> {
    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        let entry_name = entry.path()?.to_string_lossy().to_string();
        let outpath = validate_path_safe(dest_dir, &entry_name)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&outpath)?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                if let Some(parent) = outpath.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut outfile = std::fs::File::create(&outpath)?;
                std::io::copy(&mut entry, &mut outfile)?;
            }
            tar::EntryType::Symlink | tar::EntryType::Link => {
                tracing::warn!("Skipping link in plugin archive: {}", entry_name);
            }
            _ => {}
        }
    }
    Ok(())
}
