use crate::types::PluginKind;
use std::env;
use std::path::PathBuf;

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub judge_url: String,
    /// Judge-managed storage root (`GO_JUDGE_STORE_DIR`)
    pub judge_store_dir: PathBuf,
    /// Base URL the judge reports stage progress to
    pub callback_base_url: Option<String>,
    pub blob_store_url: Option<String>,
    pub blob_store_dir: PathBuf,
    /// Process-wide root for staging and working directories
    pub temp_root: PathBuf,
    pub blob_path_levels: usize,
    pub download_concurrency: usize,
    pub static_analysis_command: Vec<String>,
    pub worker_plugin: PluginKind,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or unparsable keys fall back to defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            redis_url: non_empty("REDIS_URL")
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            judge_url: non_empty("GO_JUDGE_API_URL")
                .unwrap_or_else(|| "http://127.0.0.1:5050".to_string()),
            judge_store_dir: non_empty("GO_JUDGE_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/dev/shm/go-judge")),
            callback_base_url: non_empty("PLUGIN_SERVICE_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            blob_store_url: non_empty("BLOB_STORE_URL"),
            blob_store_dir: non_empty("BLOB_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./blobs")),
            temp_root: non_empty("GRADER_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),
            blob_path_levels: non_empty("BLOB_PATH_LEVELS")
                .and_then(|v| v.parse().ok())
                .filter(|levels: &usize| *levels > 0)
                .unwrap_or(2),
            download_concurrency: non_empty("DOWNLOAD_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(8),
            static_analysis_command: non_empty("STATIC_ANALYSIS_COMMAND")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|| vec!["semgrep".to_string()]),
            worker_plugin: non_empty("WORKER_PLUGIN")
                .and_then(|v| PluginKind::from_str(&v))
                .unwrap_or(PluginKind::StaticAnalysis),
            port: non_empty("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
        }
    }
}
