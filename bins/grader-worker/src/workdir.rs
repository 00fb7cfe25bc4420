/// Criterion File Materializer
///
/// Each criterion gets a fresh working directory holding symlinks into the
/// shared download directory, mirroring the original relative layout. The
/// download directory is never written through these links.
use crate::error::WorkspaceError;
use grader_common::redis::slug;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Scoped working directory of one criterion run
///
/// Removed on `release()` or drop, whichever comes first. Removal failures
/// are logged and never returned.
#[derive(Debug)]
pub struct WorkingDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl WorkingDir {
    pub fn create(temp_root: &Path, tag: &str) -> Result<Self, WorkspaceError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-work-", slug(tag)))
            .tempdir_in(temp_root)
            .map_err(|e| WorkspaceError::io(temp_root, e))?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        self.cleanup();
    }

    fn cleanup(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove working directory");
            } else {
                tracing::debug!(path = %self.path.display(), "Removed working directory");
            }
        }
    }
}

impl Drop for WorkingDir {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Normalised relative path, or `None` if it is empty, absolute, or climbs
/// out with `..`
pub fn safe_relative_path(path: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// `safe_relative_path` rendered with `/` separators
///
/// Unsafe paths are returned verbatim, so materializing them still reports
/// the offending reference.
pub fn normalize_relative(path: &str) -> String {
    match safe_relative_path(path) {
        Some(normal) => normal
            .components()
            .filter_map(|part| part.as_os_str().to_str())
            .collect::<Vec<_>>()
            .join("/"),
        None => path.to_string(),
    }
}

/// Link `relative_paths` from `download_dir` into a new working directory
pub async fn symlink_files(
    download_dir: &Path,
    relative_paths: &[String],
    tag: &str,
    temp_root: &Path,
) -> Result<WorkingDir, WorkspaceError> {
    let source_root = tokio::fs::canonicalize(download_dir)
        .await
        .map_err(|e| WorkspaceError::io(download_dir, e))?;
    let work = WorkingDir::create(temp_root, tag)?;

    for relative in relative_paths {
        let relative_path = safe_relative_path(relative)
            .ok_or_else(|| WorkspaceError::UnsafePath(relative.clone()))?;

        let source = source_root.join(&relative_path);
        let exists = tokio::fs::try_exists(&source)
            .await
            .map_err(|e| WorkspaceError::io(&source, e))?;
        if !exists {
            return Err(WorkspaceError::MissingSource(relative.clone()));
        }

        let link = work.path().join(&relative_path);
        if let Some(parent) = link.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| WorkspaceError::io(parent, e))?;
        }
        match tokio::fs::symlink(&source, &link).await {
            Ok(()) => {}
            // duplicate file reference within one criterion
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(WorkspaceError::io(&link, e)),
        }
    }

    tracing::debug!(
        tag,
        files = relative_paths.len(),
        path = %work.path().display(),
        "Materialized working directory"
    );
    Ok(work)
}

/// Zip everything under `src_dir` into memory, following symlinks
///
/// Entry names are relative to `src_dir` with forward slashes.
pub fn zip_dir_sync(src_dir: &Path) -> Result<Vec<u8>, WorkspaceError> {
    let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for entry in WalkDir::new(src_dir).follow_links(true) {
        let entry = entry.map_err(|e| WorkspaceError::Archive(e.to_string()))?;
        let path = entry.path();

        let rel = match path.strip_prefix(src_dir).ok() {
            Some(r) if !r.as_os_str().is_empty() => r,
            _ => continue,
        };
        let rel_str = rel.to_string_lossy().replace('\\', "/");

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{}/", rel_str), options.clone())
                .map_err(|e| WorkspaceError::Archive(e.to_string()))?;
        } else {
            let bytes = std::fs::read(path).map_err(|e| WorkspaceError::io(path, e))?;
            zip.start_file(rel_str, options.clone())
                .map_err(|e| WorkspaceError::Archive(e.to_string()))?;
            zip.write_all(&bytes)
                .map_err(|e| WorkspaceError::Archive(e.to_string()))?;
        }
    }

    let cursor = zip
        .finish()
        .map_err(|e| WorkspaceError::Archive(e.to_string()))?;
    Ok(cursor.into_inner())
}

/// Async wrapper around `zip_dir_sync` (runs in a blocking thread)
pub async fn zip_dir(src_dir: &Path) -> Result<Vec<u8>, WorkspaceError> {
    let src = src_dir.to_path_buf();
    tokio::task::spawn_blocking(move || zip_dir_sync(&src))
        .await
        .map_err(|e| WorkspaceError::Archive(e.to_string()))?
}
