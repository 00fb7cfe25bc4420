/// Sandboxed judge RPC
///
/// Wire types and an HTTP client for the external go-judge service.
/// `prepare_file` uploads bytes and returns an opaque file id;
/// `run_program` executes a batch of commands and returns one result per
/// command, in order.
use async_trait::async_trait;
use grader_common::{RunLease, Stage};
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Judge status of a command that ran to completion with exit code 0
pub const STATUS_ACCEPTED: &str = "Accepted";

pub const CALLBACK_PATH: &str = "api/v1/plugins/test-runner/callback";

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const RUN_TIMEOUT_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("judge request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("judge responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid judge url: {0}")]
    InvalidUrl(String),

    #[error("judge returned {got} results for {expected} commands")]
    ResultCount { expected: usize, got: usize },

    #[error("{message}")]
    StageFailed { stage: Stage, message: String },
}

/// Positional stdin/stdout/stderr descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JudgeFile {
    Memory { content: String },
    Collector { name: String, max: u64 },
}

/// Source of a copied-in file or directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CopyInFile {
    Prepared {
        #[serde(rename = "fileId")]
        file_id: String,
    },
    Local { src: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cmd {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub files: Vec<JudgeFile>,
    pub cpu_limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_limit: Option<u64>,
    pub memory_limit: u64,
    pub proc_limit: u64,
    pub copy_in: BTreeMap<String, CopyInFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy_out_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub cmd: Vec<Cmd>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub status: String,
    #[serde(default)]
    pub exit_status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub time: u64,
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub run_time: u64,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl RunResult {
    pub fn is_accepted(&self) -> bool {
        self.status == STATUS_ACCEPTED && self.exit_status == 0
    }

    pub fn stdout(&self) -> &str {
        self.files.get("stdout").map(String::as_str).unwrap_or("")
    }

    pub fn stderr(&self) -> &str {
        self.files.get("stderr").map(String::as_str).unwrap_or("")
    }
}

/// Client-side deadline of a `/run` batch
///
/// Sum of every command's wall-clock limit (twice its CPU limit when none is
/// set) plus a fixed margin, so the deadline only fires once the judge
/// itself should have given up.
pub fn run_timeout(request: &RunRequest) -> Duration {
    let limits_ns = request
        .cmd
        .iter()
        .map(|cmd| cmd.clock_limit.unwrap_or(cmd.cpu_limit.saturating_mul(2)))
        .fold(0u64, u64::saturating_add);
    Duration::from_nanos(limits_ns).saturating_add(RUN_TIMEOUT_MARGIN)
}

/// Identifies the stage and run a judge call belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackTag {
    pub stage: Stage,
    pub run_id: String,
    /// Lease of the run, echoed back so stale callbacks can be told apart
    pub lease_id: String,
}

impl CallbackTag {
    pub fn new(stage: Stage, lease: &RunLease) -> Self {
        Self {
            stage,
            run_id: lease.run_id.clone(),
            lease_id: lease.lease_id().to_string(),
        }
    }
}

#[async_trait]
pub trait Judge: Send + Sync {
    async fn prepare_file(&self, content: Vec<u8>) -> Result<String, JudgeError>;

    async fn run_program(
        &self,
        request: &RunRequest,
        tag: &CallbackTag,
    ) -> Result<Vec<RunResult>, JudgeError>;
}

/// HTTP client of the go-judge REST API
pub struct GoJudgeClient {
    base_url: reqwest::Url,
    callback_base_url: Option<String>,
    client: reqwest::Client,
}

impl GoJudgeClient {
    pub fn new(base_url: &str, callback_base_url: Option<String>) -> Result<Self, JudgeError> {
        let base_url =
            reqwest::Url::parse(base_url).map_err(|e| JudgeError::InvalidUrl(e.to_string()))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url,
            callback_base_url,
            client,
        })
    }

    fn endpoint(&self, name: &str) -> Result<reqwest::Url, JudgeError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| JudgeError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push(name);
        Ok(url)
    }

    /// `/run` endpoint, carrying a progress callback when one is configured
    pub fn run_url(&self, tag: &CallbackTag) -> Result<reqwest::Url, JudgeError> {
        let mut url = self.endpoint("run")?;
        if let Some(base) = &self.callback_base_url {
            let callback = format!(
                "{}/{}?type={}&id={}&lease={}",
                base, CALLBACK_PATH, tag.stage, tag.run_id, tag.lease_id
            );
            url.query_pairs_mut().append_pair("callback", &callback);
        }
        Ok(url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, JudgeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(JudgeError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl Judge for GoJudgeClient {
    async fn prepare_file(&self, content: Vec<u8>) -> Result<String, JudgeError> {
        let size = content.len();
        let form = Form::new().part("file", Part::bytes(content).file_name("file.zip"));
        let response = self
            .client
            .post(self.endpoint("file")?)
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await?;
        let file_id: String = Self::check(response).await?.json().await?;

        tracing::debug!(file_id = %file_id, bytes = size, "Uploaded file to judge");
        Ok(file_id)
    }

    async fn run_program(
        &self,
        request: &RunRequest,
        tag: &CallbackTag,
    ) -> Result<Vec<RunResult>, JudgeError> {
        let response = self
            .client
            .post(self.run_url(tag)?)
            .timeout(run_timeout(request))
            .json(request)
            .send()
            .await?;
        let results: Vec<RunResult> = Self::check(response).await?.json().await?;

        if results.len() != request.cmd.len() {
            return Err(JudgeError::ResultCount {
                expected: request.cmd.len(),
                got: results.len(),
            });
        }
        Ok(results)
    }
}
