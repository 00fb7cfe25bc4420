/// Test-Runner Orchestrator
///
/// Runs one criterion through the judge in three strictly sequential stages,
/// persisting progress in the Cached Grading State:
///
/// 1. UPLOAD: zip the working directory, drop it, upload the archive and
///    unpack it into judge-managed storage named after the run id
/// 2. INIT (only with an init command): build inside that storage and copy
///    the results back to it
/// 3. RUN: one command per test case, submitted as a single batch
///
/// Any failure ends the criterion at that stage; nothing is retried.
use crate::aggregator::RunnerReport;
use crate::error::GradingError;
use crate::evaluator;
use crate::judge::{CallbackTag, Cmd, CopyInFile, Judge, JudgeError, JudgeFile, RunRequest, RunResult};
use crate::plugin_config::{StepLimits, TestRunnerConfig};
use crate::workdir::{zip_dir, WorkingDir};
use grader_common::redis::results_key;
use grader_common::{CacheError, CriterionData, GradingStateStore, RunLease, Stage};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Captured stdout/stderr cap per command
pub const OUTPUT_LIMIT: u64 = 1024 * 1024;

const BASE_PATH: &str = "PATH=/usr/bin:/bin";
const ARCHIVE_NAME: &str = "file.zip";
const UNPACK_COMMAND: &str = "unzip file.zip > /dev/null && rm file.zip && ls";

/// `sh -c` wrapper that clears stdout/stderr files left by a previous step
pub fn shell_args(command: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("rm stdout stderr &> /dev/null; {}", command),
    ]
}

/// `PATH` first, then user variables as `KEY=VALUE`
pub fn judge_env(variables: &BTreeMap<String, String>) -> Vec<String> {
    std::iter::once(BASE_PATH.to_string())
        .chain(variables.iter().map(|(k, v)| format!("{}={}", k, v)))
        .collect()
}

pub fn io_files(stdin: &str) -> Vec<JudgeFile> {
    vec![
        JudgeFile::Memory {
            content: stdin.to_string(),
        },
        JudgeFile::Collector {
            name: "stdout".to_string(),
            max: OUTPUT_LIMIT,
        },
        JudgeFile::Collector {
            name: "stderr".to_string(),
            max: OUTPUT_LIMIT,
        },
    ]
}

fn step_cmd(
    command: &str,
    env: &[String],
    stdin: &str,
    limits: &StepLimits,
    copy_in: BTreeMap<String, CopyInFile>,
    copy_out_dir: Option<String>,
) -> Cmd {
    Cmd {
        args: shell_args(command),
        env: env.to_vec(),
        files: io_files(stdin),
        cpu_limit: limits.cpu_limit,
        clock_limit: limits.clock_limit,
        memory_limit: limits.memory_limit,
        proc_limit: limits.proc_limit,
        copy_in,
        copy_out_dir,
    }
}

pub struct TestRunnerOrchestrator {
    judge: Arc<dyn Judge>,
    state: GradingStateStore,
    store_dir: PathBuf,
}

impl TestRunnerOrchestrator {
    pub fn new(judge: Arc<dyn Judge>, state: GradingStateStore, store_dir: PathBuf) -> Self {
        Self {
            judge,
            state,
            store_dir,
        }
    }

    /// Grade one criterion; `file_list` holds its working-directory paths
    pub async fn grade_criterion(
        &self,
        run_id: &str,
        criterion: &CriterionData,
        config: &TestRunnerConfig,
        work: WorkingDir,
        file_list: &[String],
    ) -> Result<RunnerReport, GradingError> {
        if file_list.is_empty() {
            return Err(GradingError::EmptyInput);
        }
        let env = judge_env(&config.environment_variables);

        let lease = self.upload(run_id, criterion, config, work).await?;
        if let Some(init_command) = &config.init_command {
            self.init(&lease, init_command, &env, &config.advanced_settings.init_step)
                .await?;
        }
        let results = self.run(&lease, config, &env).await?;

        let mut report = evaluator::evaluate(&config.test_cases, &results, &config.output_comparison);
        report.scanned_files = file_list.to_vec();

        tracing::info!(run_id, score = report.score, "Test run graded");
        Ok(report)
    }

    async fn upload(
        &self,
        run_id: &str,
        criterion: &CriterionData,
        config: &TestRunnerConfig,
        work: WorkingDir,
    ) -> Result<RunLease, GradingError> {
        let archive = zip_dir(work.path()).await;
        work.release();
        let archive = archive?;

        let file_id = self.judge.prepare_file(archive).await?;
        let lease = self
            .state
            .begin_run(run_id, config, criterion, config.test_cases.len() as u32)
            .await?;

        let copy_in = BTreeMap::from([(ARCHIVE_NAME.to_string(), CopyInFile::Prepared { file_id })]);
        let cmd = step_cmd(
            UNPACK_COMMAND,
            &[BASE_PATH.to_string()],
            "",
            &StepLimits::default(),
            copy_in,
            Some(run_id.to_string()),
        );
        let result = self.run_single(cmd, Stage::Upload, &lease).await?;
        if !result.is_accepted() {
            return Err(JudgeError::StageFailed {
                stage: Stage::Upload,
                message: format!("Failed to unpack submission:\n{}", result.stderr()),
            }
            .into());
        }

        tracing::debug!(run_id, files = %result.stdout().trim(), "Unpacked submission in judge storage");
        Ok(lease)
    }

    async fn init(
        &self,
        lease: &RunLease,
        command: &str,
        env: &[String],
        limits: &StepLimits,
    ) -> Result<(), GradingError> {
        self.state.advance(lease, Stage::Init).await?;

        let cmd = step_cmd(
            command,
            env,
            "",
            limits,
            self.stored_copy_in(&lease.run_id),
            Some(lease.run_id.clone()),
        );
        let result = self.run_single(cmd, Stage::Init, lease).await?;
        if !result.is_accepted() {
            return Err(JudgeError::StageFailed {
                stage: Stage::Init,
                message: format!("Build failed:\n{}", result.stderr()),
            }
            .into());
        }
        Ok(())
    }

    async fn run(
        &self,
        lease: &RunLease,
        config: &TestRunnerConfig,
        env: &[String],
    ) -> Result<Vec<RunResult>, GradingError> {
        self.state.advance(lease, Stage::Run).await?;

        let limits = &config.advanced_settings.run_step;
        let cmd = config
            .test_cases
            .iter()
            .map(|test_case| {
                step_cmd(
                    &config.run_command,
                    env,
                    &test_case.input,
                    limits,
                    self.stored_copy_in(&lease.run_id),
                    None,
                )
            })
            .collect();

        let tag = CallbackTag::new(Stage::Run, lease);
        let results = self.judge.run_program(&RunRequest { cmd }, &tag).await?;

        let encoded = results
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CacheError::Corrupt {
                key: results_key(&lease.run_id),
                field: "results".to_string(),
                reason: e.to_string(),
            })?;
        self.state.complete_run(lease, &encoded).await?;

        Ok(results)
    }

    async fn run_single(&self, cmd: Cmd, stage: Stage, lease: &RunLease) -> Result<RunResult, GradingError> {
        let tag = CallbackTag::new(stage, lease);
        let mut results = self.judge.run_program(&RunRequest { cmd: vec![cmd] }, &tag).await?;
        results
            .pop()
            .ok_or(JudgeError::ResultCount {
                expected: 1,
                got: 0,
            })
            .map_err(GradingError::from)
    }

    /// Copy the judge-managed directory of `run_id` into the sandbox root
    fn stored_copy_in(&self, run_id: &str) -> BTreeMap<String, CopyInFile> {
        let src = self.store_dir.join(run_id).display().to_string();
        BTreeMap::from([(".".to_string(), CopyInFile::Local { src })])
    }
}
