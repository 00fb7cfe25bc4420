/// Grading pipeline
///
/// Entry point of a Submission Grading Request: stage the attempt's files
/// once, then grade every criterion concurrently in its own working
/// directory. A failing criterion never aborts its siblings.
use crate::aggregator::{self, RunnerReport};
use crate::blob::{download_batch, BlobError, BlobStore, DownloadBatch};
use crate::command::CommandExecutor;
use crate::error::{CriterionError, GradingError};
use crate::plugin_config::{resolve_config, PluginConfig};
use crate::static_analysis;
use crate::test_runner::TestRunnerOrchestrator;
use crate::workdir::symlink_files;
use chrono::Utc;
use futures_util::future::join_all;
use grader_common::redis::run_id;
use grader_common::{
    Config, CriterionData, CriterionFailure, CriterionGrade, CriterionOutcome, GradingRequest,
    SubmissionOutcome,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Instrument;

/// Process-level knobs of the pipeline
#[derive(Debug, Clone)]
pub struct GraderSettings {
    pub temp_root: PathBuf,
    pub blob_path_levels: usize,
    pub download_concurrency: usize,
}

impl From<&Config> for GraderSettings {
    fn from(config: &Config) -> Self {
        Self {
            temp_root: config.temp_root.clone(),
            blob_path_levels: config.blob_path_levels,
            download_concurrency: config.download_concurrency,
        }
    }
}

/// Grading pipeline with its collaborators injected
pub struct Grader {
    blobs: Arc<dyn BlobStore>,
    tool: Arc<dyn CommandExecutor>,
    test_runner: TestRunnerOrchestrator,
    settings: GraderSettings,
}

impl Grader {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        tool: Arc<dyn CommandExecutor>,
        test_runner: TestRunnerOrchestrator,
        settings: GraderSettings,
    ) -> Self {
        Self {
            blobs,
            tool,
            test_runner,
            settings,
        }
    }

    /// Grade every criterion of `request`
    ///
    /// Fails as a whole only when the shared download batch fails.
    pub async fn grade_submission(
        &self,
        request: &GradingRequest,
    ) -> Result<SubmissionOutcome, BlobError> {
        let blob_names = request.all_blob_names();
        let batch = if blob_names.is_empty() {
            None
        } else {
            Some(
                download_batch(
                    self.blobs.as_ref(),
                    &blob_names,
                    self.settings.blob_path_levels,
                    &request.attempt_id,
                    &self.settings.temp_root,
                    self.settings.download_concurrency,
                )
                .await?,
            )
        };

        let tasks = request.criterion_data_list.iter().map(|criterion| {
            let span = tracing::info_span!(
                "criterion",
                attempt_id = %request.attempt_id,
                criterion = %criterion.criterion_name
            );
            self.grade_one(request, criterion, batch.as_ref())
                .instrument(span)
        });
        let criteria: Vec<CriterionOutcome> = join_all(tasks)
            .await
            .into_iter()
            .map(aggregator::into_outcome)
            .collect();

        if let Some(batch) = batch {
            batch.close();
        }

        let graded = criteria.iter().filter(|c| c.is_graded()).count();
        tracing::info!(
            attempt_id = %request.attempt_id,
            graded,
            failed = criteria.len() - graded,
            "Submission graded"
        );

        Ok(SubmissionOutcome {
            attempt_id: request.attempt_id.clone(),
            plugin: request.plugin,
            graded_at: Utc::now(),
            criteria,
        })
    }

    async fn grade_one(
        &self,
        request: &GradingRequest,
        criterion: &CriterionData,
        batch: Option<&DownloadBatch>,
    ) -> Result<CriterionGrade, CriterionError> {
        let result = self.grade_criterion(request, criterion, batch).await;
        match &result {
            Ok(_) => tracing::info!("Criterion graded"),
            Err(e) => tracing::warn!(error = %e, "Criterion failed"),
        }
        result.map_err(|e| CriterionError::new(&criterion.criterion_name, e))
    }

    async fn grade_criterion(
        &self,
        request: &GradingRequest,
        criterion: &CriterionData,
        batch: Option<&DownloadBatch>,
    ) -> Result<CriterionGrade, GradingError> {
        let batch = match batch {
            Some(batch) if !criterion.file_refs.is_empty() => batch,
            _ => return Err(GradingError::EmptyInput),
        };
        let config = resolve_config(&criterion.configuration, request.plugin)?;
        tracing::debug!(plugin = %config.kind(), "Resolved criterion configuration");
        let relative_paths = batch.relative_paths(&criterion.file_refs)?;

        let tag = format!("{}-{}", request.attempt_id, criterion.criterion_name);
        let work = symlink_files(
            batch.path(),
            &relative_paths,
            &tag,
            &self.settings.temp_root,
        )
        .await?;

        let report: RunnerReport = match config {
            PluginConfig::StaticAnalysis(config) => {
                let report =
                    static_analysis::grade_criterion(self.tool.as_ref(), work.path(), &config).await;
                work.release();
                report?
            }
            PluginConfig::TestRunner(config) => {
                let run_id = run_id(&request.attempt_id, &criterion.criterion_name);
                self.test_runner
                    .grade_criterion(&run_id, criterion, &config, work, &relative_paths)
                    .await?
            }
        };

        Ok(aggregator::finalize(
            &criterion.criterion_name,
            &relative_paths,
            report,
            batch.submission_ref(),
        ))
    }
}

/// Outcome of a request whose shared download failed: every criterion
/// carries the batch error
pub fn failed_outcome(request: &GradingRequest, error: &BlobError) -> SubmissionOutcome {
    SubmissionOutcome {
        attempt_id: request.attempt_id.clone(),
        plugin: request.plugin,
        graded_at: Utc::now(),
        criteria: request
            .criterion_data_list
            .iter()
            .map(|criterion| {
                CriterionOutcome::Failed(CriterionFailure {
                    criterion: criterion.criterion_name.clone(),
                    error: error.to_string(),
                })
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ExecError, ExecOutput};
    use crate::judge::{CallbackTag, Judge, JudgeError, JudgeFile, RunRequest, RunResult};
    use async_trait::async_trait;
    use grader_common::{GradingStateStore, MemoryCache, PluginKind};
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    struct MapStore(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl BlobStore for MapStore {
        fn backend_tag(&self) -> &'static str {
            "map"
        }

        async fn fetch(&self, blob_name: &str) -> Result<Vec<u8>, BlobError> {
            self.0.get(blob_name).cloned().ok_or_else(|| BlobError::Download {
                name: blob_name.to_string(),
                reason: "not found".to_string(),
            })
        }
    }

    /// Reports an ERROR and an INFO finding in `src/main.py` of the scanned dir
    struct ScriptedTool;

    #[async_trait]
    impl CommandExecutor for ScriptedTool {
        async fn execute(&self, args: &[String]) -> Result<ExecOutput, ExecError> {
            let dir = &args[1];
            let main = format!("{}/src/main.py", dir);
            let finding = |severity: &str| {
                json!({
                    "path": main,
                    "start": { "line": 1, "col": 1 },
                    "end": { "line": 1, "col": 5 },
                    "extra": { "severity": severity, "message": "" }
                })
            };
            let stdout = json!({
                "results": [finding("ERROR"), finding("INFO")],
                "paths": { "scanned": [main] }
            });
            Ok(ExecOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
            })
        }
    }

    /// Fails the way a crashing tool does, or prints something other than JSON
    struct BrokenTool {
        crash: bool,
    }

    #[async_trait]
    impl CommandExecutor for BrokenTool {
        async fn execute(&self, _args: &[String]) -> Result<ExecOutput, ExecError> {
            if self.crash {
                return Err(ExecError::Failed {
                    program: "semgrep".to_string(),
                    code: Some(2),
                    stderr: "invalid rule".to_string(),
                });
            }
            Ok(ExecOutput {
                stdout: "Traceback (most recent call last)".to_string(),
                stderr: String::new(),
            })
        }
    }

    /// Accepts everything and echoes stdin
    #[derive(Default)]
    struct EchoJudge {
        copy_out_dirs: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Judge for EchoJudge {
        async fn prepare_file(&self, _content: Vec<u8>) -> Result<String, JudgeError> {
            Ok("file-1".to_string())
        }

        async fn run_program(
            &self,
            request: &RunRequest,
            _tag: &CallbackTag,
        ) -> Result<Vec<RunResult>, JudgeError> {
            self.copy_out_dirs
                .lock()
                .unwrap()
                .extend(request.cmd.iter().filter_map(|cmd| cmd.copy_out_dir.clone()));
            Ok(request
                .cmd
                .iter()
                .map(|cmd| {
                    let stdout = match &cmd.files[0] {
                        JudgeFile::Memory { content } => content.clone(),
                        _ => String::new(),
                    };
                    RunResult {
                        status: "Accepted".to_string(),
                        exit_status: 0,
                        error: None,
                        time: 0,
                        memory: 0,
                        run_time: 0,
                        files: BTreeMap::from([("stdout".to_string(), stdout)]),
                    }
                })
                .collect())
        }
    }

    fn grader(temp: &tempfile::TempDir) -> (Grader, GradingStateStore) {
        let (grader, state, _) = grader_with(temp, Arc::new(ScriptedTool));
        (grader, state)
    }

    fn grader_with(
        temp: &tempfile::TempDir,
        tool: Arc<dyn CommandExecutor>,
    ) -> (Grader, GradingStateStore, Arc<EchoJudge>) {
        let store = MapStore(HashMap::from([
            ("grading/sub-1/src/main.py".to_string(), b"eval(x)".to_vec()),
            ("grading/sub-1/README.md".to_string(), b"# hi".to_vec()),
        ]));
        let state = GradingStateStore::new(Arc::new(MemoryCache::new()));
        let judge = Arc::new(EchoJudge::default());
        let runner = TestRunnerOrchestrator::new(
            judge.clone(),
            state.clone(),
            PathBuf::from("/dev/shm/go-judge"),
        );
        let settings = GraderSettings {
            temp_root: temp.path().to_path_buf(),
            blob_path_levels: 2,
            download_concurrency: 4,
        };
        (
            Grader::new(Arc::new(store), tool, runner, settings),
            state,
            judge,
        )
    }

    fn criterion(name: &str, file_refs: &[&str], configuration: serde_json::Value) -> CriterionData {
        CriterionData {
            criterion_name: name.to_string(),
            levels: vec![],
            file_refs: file_refs.iter().map(|s| s.to_string()).collect(),
            configuration,
        }
    }

    fn static_config() -> serde_json::Value {
        json!({
            "type": "static-analysis",
            "preset": { "type": "python" },
            "deductionMap": { "error": 5, "info": 1 }
        })
    }

    fn request(plugin: PluginKind, criteria: Vec<CriterionData>) -> GradingRequest {
        GradingRequest {
            attempt_id: "attempt-1".to_string(),
            plugin,
            attachments: vec![],
            metadata: Default::default(),
            criterion_data_list: criteria,
        }
    }

    fn grade_of(outcome: &CriterionOutcome) -> &CriterionGrade {
        match outcome {
            CriterionOutcome::Graded(grade) => grade,
            CriterionOutcome::Failed(failure) => panic!("criterion failed: {}", failure.error),
        }
    }

    #[tokio::test]
    async fn test_static_analysis_end_to_end() {
        let temp = tempfile::tempdir().unwrap();
        let (grader, _) = grader(&temp);
        let request = request(
            PluginKind::StaticAnalysis,
            vec![criterion("style", &["grading/sub-1/src/main.py"], static_config())],
        );

        let outcome = grader.grade_submission(&request).await.unwrap();
        let grade = grade_of(&outcome.criteria[0]);

        assert_eq!(grade.score, 94.0);
        assert_eq!(grade.feedback.len(), 2);
        assert_eq!(grade.feedback[0].file_ref.as_deref(), Some("sub-1/src/main.py"));
        assert!(grade.ignored_files.is_empty());

        // staging and working directories are gone
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_sibling_criteria_are_isolated() {
        let temp = tempfile::tempdir().unwrap();
        let (grader, _) = grader(&temp);
        let request = request(
            PluginKind::StaticAnalysis,
            vec![
                criterion(
                    "style",
                    &["grading/sub-1/src/main.py", "grading/sub-1/README.md"],
                    static_config(),
                ),
                criterion("foreign", &["grading/sub-2/main.py"], static_config()),
                criterion("empty", &[], static_config()),
                criterion(
                    "misconfigured",
                    &["grading/sub-1/src/main.py"],
                    json!({ "type": "static-analysis" }),
                ),
            ],
        );

        let outcome = grader.grade_submission(&request).await.unwrap();
        assert_eq!(outcome.criteria.len(), 4);

        let style = grade_of(&outcome.criteria[0]);
        assert_eq!(style.ignored_files, vec!["sub-1/README.md"]);

        let errors: Vec<(&str, String)> = outcome.criteria[1..]
            .iter()
            .map(|c| match c {
                CriterionOutcome::Failed(f) => (f.criterion.as_str(), f.error.clone()),
                CriterionOutcome::Graded(g) => panic!("{} should fail", g.criterion),
            })
            .collect();
        assert_eq!(errors[0].0, "foreign");
        assert!(errors[0].1.contains("does not belong to batch root"));
        assert_eq!(errors[1].1, "No files to run");
        assert!(errors[2].1.starts_with("invalid configuration"));
    }

    #[tokio::test]
    async fn test_all_empty_criteria_skip_download() {
        let temp = tempfile::tempdir().unwrap();
        let (grader, _) = grader(&temp);
        let request = request(
            PluginKind::StaticAnalysis,
            vec![criterion("a", &[], static_config()), criterion("b", &[], static_config())],
        );

        let outcome = grader.grade_submission(&request).await.unwrap();
        assert!(outcome.criteria.iter().all(|c| !c.is_graded()));
    }

    #[tokio::test]
    async fn test_download_failure_fails_request() {
        let temp = tempfile::tempdir().unwrap();
        let (grader, _) = grader(&temp);
        let request = request(
            PluginKind::StaticAnalysis,
            vec![criterion("style", &["grading/sub-1/missing.py"], static_config())],
        );

        let err = grader.grade_submission(&request).await.unwrap_err();
        let outcome = failed_outcome(&request, &err);
        assert_eq!(outcome.criteria[0].criterion(), "style");
        assert!(!outcome.criteria[0].is_graded());
    }

    #[tokio::test]
    async fn test_test_runner_end_to_end() {
        let temp = tempfile::tempdir().unwrap();
        let (grader, state) = grader(&temp);
        let config = json!({
            "type": "test-runner",
            "runCommand": "python src/main.py",
            "testCases": [
                { "input": "a", "output": "a" },
                { "input": "b", "output": "b" },
                { "input": "c", "output": "z" }
            ]
        });
        let request = request(
            PluginKind::TestRunner,
            vec![criterion("Unit Tests", &["grading/sub-1/src/main.py"], config)],
        );

        let outcome = grader.grade_submission(&request).await.unwrap();
        let grade = grade_of(&outcome.criteria[0]);
        assert_eq!(grade.score, 67.0);
        assert!(grade.ignored_files.is_empty());
        assert_eq!(grade.feedback.len(), 3);

        let progress = state.progress(&run_id("attempt-1", "Unit Tests")).await.unwrap();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.processed, 3);
    }

    #[tokio::test]
    async fn test_tool_failure_still_removes_working_dirs() {
        for crash in [true, false] {
            let temp = tempfile::tempdir().unwrap();
            let (grader, _, _) = grader_with(&temp, Arc::new(BrokenTool { crash }));
            let request = request(
                PluginKind::StaticAnalysis,
                vec![criterion("style", &["grading/sub-1/src/main.py"], static_config())],
            );

            let outcome = grader.grade_submission(&request).await.unwrap();
            match &outcome.criteria[0] {
                CriterionOutcome::Failed(failure) => {
                    let expected = if crash { "exited with status" } else { "unparseable tool output" };
                    assert!(failure.error.contains(expected), "{}", failure.error);
                }
                CriterionOutcome::Graded(_) => panic!("tool failure must fail the criterion"),
            }
            assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
        }
    }

    #[tokio::test]
    async fn test_criteria_with_colliding_slugs_get_own_runs() {
        let temp = tempfile::tempdir().unwrap();
        let (grader, state, judge) = grader_with(&temp, Arc::new(ScriptedTool));
        let config = |output: &str| {
            json!({
                "type": "test-runner",
                "runCommand": "python src/main.py",
                "testCases": [{ "input": "a", "output": output }]
            })
        };
        let request = request(
            PluginKind::TestRunner,
            vec![
                criterion("Unit Tests", &["grading/sub-1/src/main.py"], config("a")),
                criterion("unit-tests", &["grading/sub-1/src/main.py"], config("b")),
            ],
        );

        let outcome = grader.grade_submission(&request).await.unwrap();
        assert_eq!(grade_of(&outcome.criteria[0]).score, 100.0);
        assert_eq!(grade_of(&outcome.criteria[1]).score, 0.0);

        let first = run_id("attempt-1", "Unit Tests");
        let second = run_id("attempt-1", "unit-tests");
        assert_ne!(first, second);
        assert_eq!(state.progress(&first).await.unwrap().processed, 1);
        assert_eq!(state.progress(&second).await.unwrap().processed, 1);

        let mut dirs = judge.copy_out_dirs.lock().unwrap().clone();
        dirs.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(dirs, expected);
    }
}
