//! Process runner and its input, output, and error types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::subprocess;
use crate::config::RendererCommand;

/// Input handed to one process invocation.
#[derive(Debug, Clone)]
pub struct ProcessInput {
    /// JSON payload piped to the process's stdin.
    pub data: Value,
    /// Additional environment variables set for the child process.
    pub env_vars: Vec<(String, String)>,
    /// Working directory for the child process (current dir if `None`).
    pub working_directory: Option<PathBuf>,
    /// Maximum wall-clock time before the process is killed.
    pub timeout: Duration,
}

/// Captured output of a finished process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (`-1` if killed by signal).
    pub exit_code: i32,
    pub duration_ms: u64,
    /// Stdout parsed as JSON, or `None` if stdout is not valid JSON.
    pub parsed_output: Option<Value>,
}

/// Errors from spawning or running an external process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Program not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Process timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Process failed with exit code {exit_code}: {stderr}")]
    ExecutionFailed { exit_code: i32, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Errors that will fail every job the same way, so retrying or
    /// continuing the batch is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::PermissionDenied(_))
    }
}

/// A program plus fixed leading arguments, resolved once and run per job.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandRunner {
    /// Resolve `command.program` (a path, or a name looked up on `PATH`)
    /// and check that it is executable.
    pub fn resolve(command: &RendererCommand) -> Result<Self, ProcessError> {
        let program = find_program(&command.program)?;
        check_executable(&program)?;
        Ok(Self {
            program,
            args: command.args.clone(),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run the program with `extra_args` appended to the fixed arguments.
    ///
    /// A non-zero exit is reported as [`ProcessError::ExecutionFailed`].
    pub async fn run(
        &self,
        extra_args: &[String],
        input: ProcessInput,
    ) -> Result<ProcessOutput, ProcessError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).args(extra_args);
        let output = subprocess::run_command(&mut cmd, input).await?;
        if output.exit_code != 0 {
            return Err(ProcessError::ExecutionFailed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

fn find_program(program: &str) -> Result<PathBuf, ProcessError> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return if candidate.is_file() {
            Ok(candidate.to_path_buf())
        } else {
            Err(ProcessError::NotFound(program.to_string()))
        };
    }
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
        .ok_or_else(|| ProcessError::NotFound(program.to_string()))
}

#[cfg(unix)]
fn check_executable(path: &Path) -> Result<(), ProcessError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path)
        .map_err(|_| ProcessError::NotFound(path.display().to_string()))?;
    let mode = metadata.permissions().mode();
    if mode & 0o111 == 0 {
        return Err(ProcessError::PermissionDenied(format!(
            "{} is not executable (mode {mode:#o})",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_executable(path: &Path) -> Result<(), ProcessError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ProcessError::NotFound(path.display().to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::process::test_helpers::default_input;

    fn command(program: &str, args: &[&str]) -> RendererCommand {
        RendererCommand {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            ProcessError::NotFound("blender".into()).to_string(),
            "Program not found: blender"
        );
        assert_eq!(
            ProcessError::Timeout { elapsed_ms: 5000 }.to_string(),
            "Process timed out after 5000ms"
        );
        assert_eq!(
            ProcessError::ExecutionFailed {
                exit_code: 42,
                stderr: "segfault".into()
            }
            .to_string(),
            "Process failed with exit code 42: segfault"
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(ProcessError::NotFound("x".into()).is_fatal());
        assert!(ProcessError::PermissionDenied("x".into()).is_fatal());
        assert!(!ProcessError::Timeout { elapsed_ms: 1 }.is_fatal());
    }

    #[test]
    fn resolves_program_on_path() {
        let runner = CommandRunner::resolve(&command("sh", &[])).expect("sh on PATH");
        assert!(runner.program().is_absolute());
    }

    #[test]
    fn missing_program_is_not_found() {
        let result = CommandRunner::resolve(&command("/nonexistent/renderer", &[]));
        assert_matches!(result, Err(ProcessError::NotFound(_)));
        let result = CommandRunner::resolve(&command("surely-not-a-real-renderer-binary", &[]));
        assert_matches!(result, Err(ProcessError::NotFound(_)));
    }

    #[test]
    fn non_executable_is_permission_denied() {
        let f = tempfile::NamedTempFile::new().expect("create temp file");
        let path = f.path().to_str().expect("utf-8 path");
        let result = CommandRunner::resolve(&command(path, &[]));
        assert_matches!(result, Err(ProcessError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn runs_with_fixed_and_extra_args() {
        let runner = CommandRunner::resolve(&command("sh", &["-c", "echo \"{\\\"n\\\": $0}\""]))
            .expect("sh on PATH");
        let output = runner
            .run(&["7".to_string()], default_input())
            .await
            .expect("runs");
        assert_eq!(output.parsed_output, Some(serde_json::json!({"n": 7})));
    }

    #[tokio::test]
    async fn non_zero_exit_is_execution_failed() {
        let runner =
            CommandRunner::resolve(&command("sh", &["-c", "echo boom >&2; exit 3"])).expect("sh");
        let result = runner.run(&[], default_input()).await;
        assert_matches!(
            result,
            Err(ProcessError::ExecutionFailed { exit_code: 3, ref stderr }) if stderr == "boom"
        );
    }
}
