/// Config Resolver
///
/// Criterion configuration arrives as opaque JSON. It is typed against the
/// schema of the request's plugin kind and validated before any work is
/// done for the criterion.
///
/// ## Semantics
/// - `type` must name the same plugin as the request
/// - `version` defaults to 1 and no other version is accepted
/// - every omitted optional field takes its documented default
use grader_common::PluginKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const CONFIG_VERSION: u64 = 1;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("configuration must be a JSON object")]
    NotAnObject,

    #[error("configuration type '{found}' does not match plugin '{expected}'")]
    TypeMismatch { expected: PluginKind, found: String },

    #[error("unsupported configuration version {0}")]
    UnsupportedVersion(u64),

    #[error("invalid configuration: {0}")]
    Schema(String),
}

/// Closed set of typed configurations, one per plugin kind
#[derive(Debug, Clone, PartialEq)]
pub enum PluginConfig {
    StaticAnalysis(StaticAnalysisConfig),
    TestRunner(TestRunnerConfig),
}

impl PluginConfig {
    pub fn kind(&self) -> PluginKind {
        match self {
            PluginConfig::StaticAnalysis(_) => PluginKind::StaticAnalysis,
            PluginConfig::TestRunner(_) => PluginKind::TestRunner,
        }
    }
}

/// Named rule-set presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RulesetPreset {
    Auto,
    CCpp,
    CSharp,
    Go,
    Java,
    Javascript,
    Typescript,
    Python,
}

impl RulesetPreset {
    /// Registry rule sets of a named preset; empty for `Auto`
    pub fn rulesets(&self) -> &'static [&'static str] {
        match self {
            RulesetPreset::Auto => &[],
            RulesetPreset::CCpp => &["p/c"],
            RulesetPreset::CSharp => &["p/csharp"],
            RulesetPreset::Go => &["p/go", "p/gosec"],
            RulesetPreset::Java => &["p/java"],
            RulesetPreset::Javascript => &["p/javascript"],
            RulesetPreset::Typescript => &["p/typescript"],
            RulesetPreset::Python => &["p/python"],
        }
    }
}

/// Points deducted per finding of each severity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeductionMap {
    pub critical: f64,
    pub error: f64,
    pub warning: f64,
    pub info: f64,
}

impl Default for DeductionMap {
    fn default() -> Self {
        Self {
            critical: 20.0,
            error: 15.0,
            warning: 2.0,
            info: 0.0,
        }
    }
}

impl DeductionMap {
    /// Deduction for a tool-reported severity; unknown severities cost nothing
    pub fn deduction_for(&self, severity: &str) -> f64 {
        match severity {
            "CRITICAL" => self.critical,
            "ERROR" => self.error,
            "WARNING" => self.warning,
            "INFO" => self.info,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticAnalysisConfig {
    #[serde(default)]
    pub cross_file_analysis: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<RulesetPreset>,
    #[serde(default)]
    pub additional_rulesets: Vec<String>,
    #[serde(default)]
    pub deduction_map: DeductionMap,
}

/// Judge resource limits of one step
///
/// Times are nanoseconds, memory is bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepLimits {
    pub cpu_limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clock_limit: Option<u64>,
    pub memory_limit: u64,
    pub proc_limit: u64,
}

impl Default for StepLimits {
    fn default() -> Self {
        Self {
            cpu_limit: 10 * 1_000_000_000,
            clock_limit: None,
            memory_limit: 256 * 1024 * 1024,
            proc_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvancedSettings {
    pub init_step: StepLimits,
    pub run_step: StepLimits,
}

/// Output comparison switches, applied in declaration order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputComparison {
    pub ignore_whitespace: bool,
    pub ignore_line_endings: bool,
    pub trim: bool,
    pub ignore_case: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunnerConfig {
    pub run_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_command: Option<String>,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub advanced_settings: AdvancedSettings,
    #[serde(default)]
    pub output_comparison: OutputComparison,
}

/// Type an opaque configuration payload against `kind`'s schema
pub fn resolve_config(
    raw: &serde_json::Value,
    kind: PluginKind,
) -> Result<PluginConfig, ConfigError> {
    let object = raw.as_object().ok_or(ConfigError::NotAnObject)?;

    let found = object.get("type").and_then(|t| t.as_str()).unwrap_or("");
    if PluginKind::from_str(found) != Some(kind) {
        return Err(ConfigError::TypeMismatch {
            expected: kind,
            found: found.to_string(),
        });
    }

    match object.get("version") {
        None => {}
        Some(version) => match version.as_u64() {
            Some(CONFIG_VERSION) => {}
            Some(other) => return Err(ConfigError::UnsupportedVersion(other)),
            None => return Err(ConfigError::Schema("version must be an integer".to_string())),
        },
    }

    let schema_error = |e: serde_json::Error| ConfigError::Schema(e.to_string());
    match kind {
        PluginKind::StaticAnalysis => {
            let config: StaticAnalysisConfig =
                serde_json::from_value(raw.clone()).map_err(schema_error)?;
            if config.preset.is_none() && config.additional_rulesets.is_empty() {
                return Err(ConfigError::Schema(
                    "either a preset or at least one additional ruleset is required".to_string(),
                ));
            }
            Ok(PluginConfig::StaticAnalysis(config))
        }
        PluginKind::TestRunner => {
            let config: TestRunnerConfig =
                serde_json::from_value(raw.clone()).map_err(schema_error)?;
            if config.test_cases.is_empty() {
                return Err(ConfigError::Schema(
                    "at least one test case is required".to_string(),
                ));
            }
            Ok(PluginConfig::TestRunner(config))
        }
    }
}
