use async_trait::async_trait;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("no program configured for the command executor")]
    EmptyCommand,

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with status {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unparseable tool output: {0}")]
    Output(String),
}

/// Captured output of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs an external tool with extra arguments
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, args: &[String]) -> Result<ExecOutput, ExecError>;
}

/// Process-backed executor built from a command line such as `uv run semgrep`
#[derive(Debug, Clone)]
pub struct LocalCommandExecutor {
    program: String,
    leading_args: Vec<String>,
}

impl LocalCommandExecutor {
    pub fn new(command_line: &[String]) -> Result<Self, ExecError> {
        let (program, leading_args) = command_line.split_first().ok_or(ExecError::EmptyCommand)?;
        Ok(Self {
            program: program.clone(),
            leading_args: leading_args.to_vec(),
        })
    }
}

#[async_trait]
impl CommandExecutor for LocalCommandExecutor {
    async fn execute(&self, args: &[String]) -> Result<ExecOutput, ExecError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(program = %self.program, ?args, "Executing command");
        let output = command.output().await.map_err(|e| ExecError::Spawn {
            program: self.program.clone(),
            source: e,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(ExecError::Failed {
                program: self.program.clone(),
                code: output.status.code(),
                stderr,
            });
        }

        Ok(ExecOutput { stdout, stderr })
    }
}
