use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Plugin type tag
/// Selects the configuration schema and the runner a request goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    StaticAnalysis,
    TestRunner,
}

impl PluginKind {
    /// Returns all plugin variants
    pub fn all_variants() -> &'static [PluginKind] {
        &[PluginKind::StaticAnalysis, PluginKind::TestRunner]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::StaticAnalysis => "static-analysis",
            PluginKind::TestRunner => "test-runner",
        }
    }

    /// Parse a plugin tag (case-insensitive, `_` accepted for `-`)
    pub fn from_str(s: &str) -> Option<PluginKind> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "static-analysis" => Some(PluginKind::StaticAnalysis),
            "test-runner" => Some(PluginKind::TestRunner),
            _ => None,
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rubric level of a criterion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub tag: String,
    pub description: String,
    pub weight: f64,
}

/// Criterion Data (read-only during processing)
///
/// `configuration` stays opaque until the config resolver types it
/// against the request's plugin kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionData {
    pub criterion_name: String,
    #[serde(default)]
    pub levels: Vec<Level>,
    pub file_refs: Vec<String>,
    #[serde(default)]
    pub configuration: serde_json::Value,
}

/// Submission Grading Request (immutable input)
/// Built by the caller once per grading attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingRequest {
    pub attempt_id: String,
    pub plugin: PluginKind,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub criterion_data_list: Vec<CriterionData>,
}

impl GradingRequest {
    /// Every file reference of every criterion, in request order
    pub fn all_blob_names(&self) -> Vec<String> {
        self.criterion_data_list
            .iter()
            .flat_map(|criterion| criterion.file_refs.iter().cloned())
            .collect()
    }
}

/// Where a feedback item points
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Location {
    #[serde(rename_all = "camelCase")]
    Text {
        from_line: u32,
        from_col: u32,
        to_line: u32,
        to_col: u32,
    },
    /// 1-based test case index
    TestCase { index: usize },
}

/// Severity or pass/fail marker of a feedback item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Marker {
    Severity { severity: String },
    Passed,
    Failed,
}

/// One reported finding or test outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackItem {
    /// Caller-facing reference (`submissionRef/relativePath`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_ref: Option<String>,
    pub location: Location,
    pub marker: Marker,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Successful result of one criterion
///
/// ## Scoring Semantics:
/// - score is always within [0, 100]
/// - ignored_files = criterion input files the runner did not scan or execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionGrade {
    pub criterion: String,
    pub score: f64,
    pub feedback: Vec<FeedbackItem>,
    pub ignored_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Criterion-scoped failure, surfaced next to successful siblings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionFailure {
    pub criterion: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CriterionOutcome {
    Graded(CriterionGrade),
    Failed(CriterionFailure),
}

impl CriterionOutcome {
    pub fn criterion(&self) -> &str {
        match self {
            CriterionOutcome::Graded(grade) => &grade.criterion,
            CriterionOutcome::Failed(failure) => &failure.criterion,
        }
    }

    pub fn is_graded(&self) -> bool {
        matches!(self, CriterionOutcome::Graded(_))
    }
}

/// Request-level response, written by workers and read by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionOutcome {
    pub attempt_id: String,
    pub plugin: PluginKind,
    pub graded_at: DateTime<Utc>,
    pub criteria: Vec<CriterionOutcome>,
}

/// Test-runner stage state machine
/// UPLOAD → INIT (optional) → RUN, strictly sequential; ordered that way
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Upload,
    Init,
    Run,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::Init => "init",
            Stage::Run => "run",
        }
    }

    pub fn from_str(s: &str) -> Option<Stage> {
        match s {
            "upload" => Some(Stage::Upload),
            "init" => Some(Stage::Init),
            "run" => Some(Stage::Run),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress snapshot of a cached test-runner run, for polling callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradingProgress {
    pub state: Stage,
    pub processed: u32,
    pub total: u32,
}

/// Per-criterion notification published once a criterion settles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum GradingEvent {
    #[serde(rename_all = "camelCase")]
    CriterionGraded {
        attempt_id: String,
        grade: CriterionGrade,
    },
    #[serde(rename_all = "camelCase")]
    CriterionFailed {
        attempt_id: String,
        criterion_name: String,
        error: String,
    },
}

impl GradingEvent {
    pub fn from_outcome(attempt_id: &str, outcome: &CriterionOutcome) -> Self {
        match outcome {
            CriterionOutcome::Graded(grade) => GradingEvent::CriterionGraded {
                attempt_id: attempt_id.to_string(),
                grade: grade.clone(),
            },
            CriterionOutcome::Failed(failure) => GradingEvent::CriterionFailed {
                attempt_id: attempt_id.to_string(),
                criterion_name: failure.criterion.clone(),
                error: failure.error.clone(),
            },
        }
    }
}
