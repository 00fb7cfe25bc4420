/// Static-Analysis Runner
///
/// Scans a criterion's working directory with the external tool and turns
/// its JSON report into a deducted score plus per-location feedback.
///
/// ## Scoring Semantics
/// - start at 100
/// - subtract the configured deduction for every finding's severity
/// - unrecognised severities deduct nothing
/// - floor at 0
use crate::aggregator::RunnerReport;
use crate::command::{CommandExecutor, ExecError};
use crate::plugin_config::{RulesetPreset, StaticAnalysisConfig};
use grader_common::{FeedbackItem, Location, Marker};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ToolOutput {
    #[serde(default)]
    pub results: Vec<ToolFinding>,
    #[serde(default)]
    pub paths: ToolPaths,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolPaths {
    #[serde(default)]
    pub scanned: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolFinding {
    pub path: String,
    pub start: ToolPosition,
    pub end: ToolPosition,
    pub extra: ToolExtra,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ToolPosition {
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolExtra {
    pub severity: String,
    #[serde(default)]
    pub message: String,
}

/// Command-line arguments for scanning `directory`
pub fn build_args(directory: &Path, config: &StaticAnalysisConfig) -> Vec<String> {
    let mut args = vec![
        "scan".to_string(),
        directory.display().to_string(),
        "--experimental".to_string(),
    ];

    if config.cross_file_analysis {
        args.push("--pro".to_string());
    }

    match config.preset {
        Some(RulesetPreset::Auto) => args.push("--config=auto".to_string()),
        Some(preset) => args.extend(
            preset
                .rulesets()
                .iter()
                .map(|ruleset| format!("--config={}", ruleset)),
        ),
        None => {}
    }
    args.extend(
        config
            .additional_rulesets
            .iter()
            .map(|ruleset| format!("--config={}", ruleset)),
    );

    args.push("--json".to_string());
    args.push("--quiet".to_string());
    args
}

/// Score a parsed report; `strip` turns tool paths into working-directory
/// relative paths
pub fn score_report<F>(output: ToolOutput, config: &StaticAnalysisConfig, strip: F) -> RunnerReport
where
    F: Fn(&str) -> String,
{
    let deductions: f64 = output
        .results
        .iter()
        .map(|finding| config.deduction_map.deduction_for(&finding.extra.severity))
        .sum();
    let score = (100.0 - deductions).max(0.0);

    let feedback = output
        .results
        .into_iter()
        .map(|finding| FeedbackItem {
            file_ref: Some(strip(&finding.path)),
            location: Location::Text {
                from_line: finding.start.line,
                from_col: finding.start.col,
                to_line: finding.end.line,
                to_col: finding.end.col,
            },
            marker: Marker::Severity {
                severity: finding.extra.severity,
            },
            message: Some(finding.extra.message).filter(|m| !m.is_empty()),
        })
        .collect();

    RunnerReport {
        score,
        feedback,
        scanned_files: output.paths.scanned.iter().map(|p| strip(p)).collect(),
        summary: None,
    }
}

/// Run the tool against `directory` and grade its findings
pub async fn grade_criterion(
    executor: &dyn CommandExecutor,
    directory: &Path,
    config: &StaticAnalysisConfig,
) -> Result<RunnerReport, ExecError> {
    let args = build_args(directory, config);
    let output = executor.execute(&args).await?;
    let parsed: ToolOutput =
        serde_json::from_str(&output.stdout).map_err(|e| ExecError::Output(e.to_string()))?;

    tracing::debug!(
        findings = parsed.results.len(),
        scanned = parsed.paths.scanned.len(),
        "Parsed static analysis report"
    );

    let prefixes = work_dir_prefixes(directory).await;
    Ok(score_report(parsed, config, |path| strip_work_dir(path, &prefixes)))
}

/// `directory` as given plus its canonical form; the tool may report either
async fn work_dir_prefixes(directory: &Path) -> Vec<String> {
    let mut prefixes = vec![format!("{}/", directory.display())];
    match tokio::fs::canonicalize(directory).await {
        Ok(canonical) if canonical != directory => {
            prefixes.push(format!("{}/", canonical.display()));
        }
        Ok(_) => {}
        Err(e) => {
            tracing::debug!(path = %directory.display(), error = %e, "Working directory not canonicalized");
        }
    }
    prefixes
}

fn strip_work_dir(path: &str, prefixes: &[String]) -> String {
    prefixes
        .iter()
        .find_map(|prefix| path.strip_prefix(prefix.as_str()))
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ExecOutput;
    use crate::plugin_config::DeductionMap;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct FakeTool {
        stdout: String,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeTool {
        fn new(stdout: String) -> Self {
            Self {
                stdout,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CommandExecutor for FakeTool {
        async fn execute(&self, args: &[String]) -> Result<ExecOutput, ExecError> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(ExecOutput {
                stdout: self.stdout.clone(),
                stderr: String::new(),
            })
        }
    }

    fn config(preset: Option<RulesetPreset>, additional: &[&str]) -> StaticAnalysisConfig {
        StaticAnalysisConfig {
            cross_file_analysis: false,
            preset,
            additional_rulesets: additional.iter().map(|s| s.to_string()).collect(),
            deduction_map: DeductionMap::default(),
        }
    }

    fn finding(path: &str, severity: &str, message: &str) -> serde_json::Value {
        json!({
            "path": path,
            "start": { "line": 3, "col": 1 },
            "end": { "line": 3, "col": 12 },
            "extra": { "severity": severity, "message": message }
        })
    }

    #[test]
    fn test_build_args_presets() {
        let dir = Path::new("/tmp/work");

        let args = build_args(dir, &config(Some(RulesetPreset::Auto), &[]));
        assert_eq!(
            args,
            vec!["scan", "/tmp/work", "--experimental", "--config=auto", "--json", "--quiet"]
        );

        let mut cfg = config(Some(RulesetPreset::Go), &["p/secrets"]);
        cfg.cross_file_analysis = true;
        let args = build_args(dir, &cfg);
        assert_eq!(
            args,
            vec![
                "scan",
                "/tmp/work",
                "--experimental",
                "--pro",
                "--config=p/go",
                "--config=p/gosec",
                "--config=p/secrets",
                "--json",
                "--quiet"
            ]
        );
    }

    #[test]
    fn test_single_finding_per_severity() {
        let deductions = DeductionMap {
            critical: 30.0,
            error: 120.0,
            warning: 2.5,
            info: 0.0,
        };
        for (severity, expected) in [("CRITICAL", 70.0), ("ERROR", 0.0), ("WARNING", 97.5), ("INFO", 100.0)] {
            let mut cfg = config(Some(RulesetPreset::Auto), &[]);
            cfg.deduction_map = deductions;
            let output: ToolOutput = serde_json::from_value(json!({
                "results": [finding("a.py", severity, "")]
            }))
            .unwrap();
            let report = score_report(output, &cfg, |p| p.to_string());
            assert_eq!(report.score, expected, "severity {}", severity);
        }
    }

    #[test]
    fn test_score_floors_at_zero_and_ignores_unknown() {
        let cfg = config(Some(RulesetPreset::Auto), &[]);
        let results: Vec<_> = (0..6).map(|_| finding("a.py", "CRITICAL", "bad")).collect();
        let output: ToolOutput = serde_json::from_value(json!({ "results": results })).unwrap();
        assert_eq!(score_report(output, &cfg, |p| p.to_string()).score, 0.0);

        let output: ToolOutput = serde_json::from_value(json!({
            "results": [finding("a.py", "EXPERIMENT", "x")]
        }))
        .unwrap();
        assert_eq!(score_report(output, &cfg, |p| p.to_string()).score, 100.0);
    }

    #[tokio::test]
    async fn test_grade_criterion_two_findings() {
        let dir = Path::new("/tmp/work-1");
        let stdout = json!({
            "results": [
                finding("/tmp/work-1/src/main.py", "ERROR", "Use of eval"),
                finding("/tmp/work-1/src/main.py", "INFO", "")
            ],
            "paths": { "scanned": ["/tmp/work-1/src/main.py"] }
        })
        .to_string();
        let tool = FakeTool::new(stdout);

        let mut cfg = config(Some(RulesetPreset::Python), &[]);
        cfg.deduction_map = DeductionMap {
            critical: 0.0,
            error: 5.0,
            warning: 0.0,
            info: 1.0,
        };

        let report = grade_criterion(&tool, dir, &cfg).await.unwrap();
        assert_eq!(report.score, 94.0);
        assert_eq!(report.feedback.len(), 2);
        assert_eq!(report.feedback[0].file_ref.as_deref(), Some("src/main.py"));
        assert_eq!(report.feedback[0].message.as_deref(), Some("Use of eval"));
        assert_eq!(report.feedback[1].message, None);
        assert_eq!(
            report.feedback[1].location,
            Location::Text {
                from_line: 3,
                from_col: 1,
                to_line: 3,
                to_col: 12
            }
        );
        assert_eq!(report.scanned_files, vec!["src/main.py"]);

        let calls = tool.calls.lock().unwrap();
        assert!(calls[0].contains(&"--config=p/python".to_string()));
    }

    #[tokio::test]
    async fn test_canonical_tool_paths_are_stripped() {
        let temp = tempfile::tempdir().unwrap();
        let real = temp.path().join("real");
        std::fs::create_dir_all(real.join("src")).unwrap();
        std::fs::write(real.join("src/main.py"), "eval(input())").unwrap();
        let linked = temp.path().join("linked");
        std::os::unix::fs::symlink(&real, &linked).unwrap();

        let canonical = std::fs::canonicalize(&real).unwrap();
        let reported = format!("{}/src/main.py", canonical.display());
        let stdout = json!({
            "results": [finding(&reported, "ERROR", "Use of eval")],
            "paths": { "scanned": [reported] }
        })
        .to_string();
        let tool = FakeTool::new(stdout);

        let report = grade_criterion(&tool, &linked, &config(Some(RulesetPreset::Auto), &[]))
            .await
            .unwrap();
        assert_eq!(report.feedback[0].file_ref.as_deref(), Some("src/main.py"));
        assert_eq!(report.scanned_files, vec!["src/main.py"]);
    }

    #[test]
    fn test_strip_work_dir_prefers_matching_prefix() {
        let prefixes = vec!["/tmp/w/".to_string(), "/private/tmp/w/".to_string()];
        assert_eq!(strip_work_dir("/private/tmp/w/a.py", &prefixes), "a.py");
        assert_eq!(strip_work_dir("/tmp/w/lib/b.py", &prefixes), "lib/b.py");
        assert_eq!(strip_work_dir("c.py", &prefixes), "c.py");
    }

    #[tokio::test]
    async fn test_unparseable_output_fails() {
        let tool = FakeTool::new("Traceback (most recent call last)".to_string());
        let err = grade_criterion(&tool, Path::new("/tmp/w"), &config(Some(RulesetPreset::Auto), &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Output(_)));
    }
}
