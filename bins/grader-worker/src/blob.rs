/// Blob Batch Fetcher
///
/// Downloads the files of one grading attempt into a private staging
/// directory. Blob names are `<root>/<rest>`, where the root is the first
/// `levels` path segments and is shared by every file of the attempt.
///
/// ## Semantics
/// - The batch root is taken from the first blob name
/// - Blobs outside that root are skipped with a warning; the criterion that
///   owns them fails later, when its files are resolved
/// - Any single download failure fails the whole batch
use crate::workdir::{normalize_relative, safe_relative_path};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use grader_common::redis::slug;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob '{name}' does not belong to batch root '{root}'")]
    Resolution { name: String, root: String },

    #[error("blob name '{name}' has no path below its first {levels} segments")]
    TooShallow { name: String, levels: usize },

    #[error("failed to download blob '{name}': {reason}")]
    Download { name: String, reason: String },

    #[error("invalid blob store url: {0}")]
    InvalidUrl(String),

    #[error("failed to build blob store client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("blob staging failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("blob batch is empty")]
    EmptyBatch,
}

/// Read side of the blob container
#[async_trait]
pub trait BlobStore: Send + Sync {
    fn backend_tag(&self) -> &'static str;

    async fn fetch(&self, blob_name: &str) -> Result<Vec<u8>, BlobError>;
}

/// Blob container mounted on the local filesystem
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn backend_tag(&self) -> &'static str {
        "localfs"
    }

    async fn fetch(&self, blob_name: &str) -> Result<Vec<u8>, BlobError> {
        let relative = safe_relative_path(blob_name).ok_or_else(|| BlobError::Download {
            name: blob_name.to_string(),
            reason: "path traversal blocked".to_string(),
        })?;
        tokio::fs::read(self.root.join(relative))
            .await
            .map_err(|e| BlobError::Download {
                name: blob_name.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Blob container reachable over HTTP
///
/// The base URL names the container and may carry a SAS query string,
/// which is kept on every blob URL.
pub struct HttpBlobStore {
    base_url: reqwest::Url,
    client: reqwest::Client,
}

impl HttpBlobStore {
    pub fn new(base_url: &str) -> Result<Self, BlobError> {
        let base_url =
            reqwest::Url::parse(base_url).map_err(|e| BlobError::InvalidUrl(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { base_url, client })
    }

    pub fn url_for(&self, blob_name: &str) -> Result<reqwest::Url, BlobError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BlobError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(blob_name.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    fn backend_tag(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, blob_name: &str) -> Result<Vec<u8>, BlobError> {
        let download_error = |reason: String| BlobError::Download {
            name: blob_name.to_string(),
            reason,
        };

        let url = self.url_for(blob_name)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| download_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(download_error(format!("status {}", response.status())));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| download_error(e.to_string()))
    }
}

/// A blob name split at its first `/`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobName<'a> {
    pub root: &'a str,
    pub rest: &'a str,
}

impl<'a> BlobName<'a> {
    pub fn parts(name: &'a str) -> Self {
        match name.split_once('/') {
            Some((root, rest)) => BlobName { root, rest },
            None => BlobName {
                root: name,
                rest: "",
            },
        }
    }
}

/// First `levels` segments of a blob name
pub fn root_of(name: &str, levels: usize) -> Result<String, BlobError> {
    let segments: Vec<&str> = name.split('/').collect();
    if segments.len() <= levels {
        return Err(BlobError::TooShallow {
            name: name.to_string(),
            levels,
        });
    }
    Ok(segments[..levels].join("/"))
}

/// Path of a blob relative to the batch root
pub fn rest_relative_to<'a>(name: &'a str, root: &str) -> Result<&'a str, BlobError> {
    name.strip_prefix(root)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| BlobError::Resolution {
            name: name.to_string(),
            root: root.to_string(),
        })
}

/// Caller-facing prefix of every file reference: the batch root without its
/// leading container segment
pub fn submission_ref(blob_name_root: &str) -> &str {
    BlobName::parts(blob_name_root).rest
}

/// Staged files of one attempt; the directory is removed on drop
#[derive(Debug)]
pub struct DownloadBatch {
    dir: TempDir,
    pub blob_name_root: String,
}

impl DownloadBatch {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn submission_ref(&self) -> &str {
        submission_ref(&self.blob_name_root)
    }

    /// Resolve a criterion's file references against the batch root
    ///
    /// Paths come back normalised, so they compare equal to the paths the
    /// runners report for the materialized files.
    pub fn relative_paths(&self, file_refs: &[String]) -> Result<Vec<String>, BlobError> {
        file_refs
            .iter()
            .map(|name| rest_relative_to(name, &self.blob_name_root).map(normalize_relative))
            .collect()
    }

    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove download directory");
        }
    }
}

pub async fn download_batch(
    store: &dyn BlobStore,
    blob_names: &[String],
    levels: usize,
    tag: &str,
    temp_root: &Path,
    concurrency: usize,
) -> Result<DownloadBatch, BlobError> {
    let first = blob_names.first().ok_or(BlobError::EmptyBatch)?;
    let blob_name_root = root_of(first, levels)?;

    let dir = tempfile::Builder::new()
        .prefix(&format!("{}-download-", slug(tag)))
        .tempdir_in(temp_root)
        .map_err(|e| BlobError::Io {
            path: temp_root.to_path_buf(),
            source: e,
        })?;

    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for name in blob_names {
        if !seen.insert(name.as_str()) {
            continue;
        }
        let relative = rest_relative_to(name, &blob_name_root)
            .ok()
            .and_then(safe_relative_path);
        match relative {
            Some(relative) => targets.push((name.as_str(), dir.path().join(relative))),
            None => tracing::warn!(
                blob = %name,
                root = %blob_name_root,
                "Skipping blob outside the batch root"
            ),
        }
    }

    let total = targets.len();
    stream::iter(targets)
        .map(|(name, dest)| async move {
            let bytes = store.fetch(name).await?;
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| BlobError::Io {
                        path: parent.to_path_buf(),
                        source: e,
                    })?;
            }
            tokio::fs::write(&dest, bytes)
                .await
                .map_err(|e| BlobError::Io {
                    path: dest.clone(),
                    source: e,
                })
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect::<Vec<()>>()
        .await?;

    tracing::info!(
        backend = store.backend_tag(),
        root = %blob_name_root,
        files = total,
        "Downloaded blob batch"
    );

    Ok(DownloadBatch {
        dir,
        blob_name_root,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeStore {
        blobs: HashMap<String, Vec<u8>>,
    }

    impl FakeStore {
        fn with(files: &[(&str, &str)]) -> Self {
            Self {
                blobs: files
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl BlobStore for FakeStore {
        fn backend_tag(&self) -> &'static str {
            "fake"
        }

        async fn fetch(&self, blob_name: &str) -> Result<Vec<u8>, BlobError> {
            self.blobs
                .get(blob_name)
                .cloned()
                .ok_or_else(|| BlobError::Download {
                    name: blob_name.to_string(),
                    reason: "not found".to_string(),
                })
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_blob_name_parts() {
        let name = BlobName::parts("grading/sub-1/src/main.py");
        assert_eq!(name.root, "grading");
        assert_eq!(name.rest, "sub-1/src/main.py");
        assert_eq!(BlobName::parts("lonely").rest, "");
    }

    #[test]
    fn test_root_and_relative_paths() {
        assert_eq!(root_of("grading/sub-1/src/main.py", 2).unwrap(), "grading/sub-1");
        assert!(matches!(
            root_of("grading/sub-1", 2),
            Err(BlobError::TooShallow { .. })
        ));

        assert_eq!(
            rest_relative_to("grading/sub-1/src/main.py", "grading/sub-1").unwrap(),
            "src/main.py"
        );
        assert!(matches!(
            rest_relative_to("grading/sub-10/main.py", "grading/sub-1"),
            Err(BlobError::Resolution { .. })
        ));
        assert_eq!(submission_ref("grading/sub-1"), "sub-1");
    }

    #[test]
    fn test_http_store_rejects_bad_url() {
        assert!(matches!(
            HttpBlobStore::new("not a url"),
            Err(BlobError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_http_url_keeps_query() {
        let store = HttpBlobStore::new("https://acct.example.net/container?sv=1&sig=abc").unwrap();
        let url = store.url_for("grading/sub-1/main.py").unwrap();
        assert_eq!(
            url.as_str(),
            "https://acct.example.net/container/grading/sub-1/main.py?sv=1&sig=abc"
        );
    }

    #[tokio::test]
    async fn test_download_batch_stages_files() {
        let temp = tempfile::tempdir().unwrap();
        let store = FakeStore::with(&[
            ("grading/sub-1/main.py", "print(1)"),
            ("grading/sub-1/lib/util.py", "X = 1"),
        ]);

        let batch = download_batch(
            &store,
            &names(&[
                "grading/sub-1/main.py",
                "grading/sub-1/lib/util.py",
                "grading/sub-1/main.py",
            ]),
            2,
            "attempt 1",
            temp.path(),
            4,
        )
        .await
        .unwrap();

        assert_eq!(batch.blob_name_root, "grading/sub-1");
        assert_eq!(batch.submission_ref(), "sub-1");
        let util = std::fs::read_to_string(batch.path().join("lib/util.py")).unwrap();
        assert_eq!(util, "X = 1");
        assert!(batch.path().starts_with(temp.path()));
        assert_eq!(
            batch
                .relative_paths(&names(&["grading/sub-1/./lib/util.py", "grading/sub-1/main.py"]))
                .unwrap(),
            vec!["lib/util.py", "main.py"]
        );

        let path = batch.path().to_path_buf();
        batch.close();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_download_batch_skips_foreign_root() {
        let temp = tempfile::tempdir().unwrap();
        let store = FakeStore::with(&[("grading/sub-1/main.py", "print(1)")]);

        let batch = download_batch(
            &store,
            &names(&["grading/sub-1/main.py", "grading/other/evil.py"]),
            2,
            "a",
            temp.path(),
            2,
        )
        .await
        .unwrap();

        assert!(batch.path().join("main.py").exists());
        assert!(batch
            .relative_paths(&names(&["grading/other/evil.py"]))
            .is_err());
    }

    #[tokio::test]
    async fn test_download_batch_fails_on_any_missing_blob() {
        let temp = tempfile::tempdir().unwrap();
        let store = FakeStore::with(&[("grading/sub-1/main.py", "print(1)")]);

        let err = download_batch(
            &store,
            &names(&["grading/sub-1/main.py", "grading/sub-1/gone.py"]),
            2,
            "a",
            temp.path(),
            2,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BlobError::Download { .. }));

        let empty = download_batch(&store, &[], 2, "a", temp.path(), 2).await;
        assert!(matches!(empty, Err(BlobError::EmptyBatch)));
    }

    #[tokio::test]
    async fn test_local_store_blocks_traversal() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("a.txt"), "hi").unwrap();
        let store = LocalBlobStore::new(temp.path().to_path_buf());

        assert_eq!(store.fetch("a.txt").await.unwrap(), b"hi");
        assert!(store.fetch("../etc/passwd").await.is_err());
    }
}
