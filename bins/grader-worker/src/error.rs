use crate::blob::BlobError;
use crate::command::ExecError;
use crate::judge::JudgeError;
use crate::plugin_config::ConfigError;
use grader_common::CacheError;
use std::path::PathBuf;
use thiserror::Error;

/// Local filesystem failures around working directories and archives
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("filesystem operation failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("path '{0}' escapes the working directory")]
    UnsafePath(String),

    #[error("file '{0}' was not downloaded into the batch directory")]
    MissingSource(String),

    #[error("failed to archive working directory: {0}")]
    Archive(String),
}

impl WorkspaceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WorkspaceError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Every way a single criterion can fail
#[derive(Debug, Error)]
pub enum GradingError {
    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Judge(#[from] JudgeError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("No files to run")]
    EmptyInput,
}

/// A `GradingError` tagged with the criterion it belongs to
#[derive(Debug, Error)]
#[error("criterion '{criterion}' failed: {source}")]
pub struct CriterionError {
    pub criterion: String,
    #[source]
    pub source: GradingError,
}

impl CriterionError {
    pub fn new(criterion: &str, source: impl Into<GradingError>) -> Self {
        Self {
            criterion: criterion.to_string(),
            source: source.into(),
        }
    }
}
