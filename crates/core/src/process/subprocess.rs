//! Spawn, feed, capture, and time-limit a child process.

use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::executor::{ProcessError, ProcessInput, ProcessOutput};

/// Maximum stdout or stderr size captured per stream (10 MiB).
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Spawn `cmd`, pipe the JSON payload to stdin, capture stdout/stderr,
/// and kill the child if it outlives `input.timeout`.
///
/// The caller sets program and arguments; environment and working
/// directory come from `input`. The exit code is reported, not judged.
pub async fn run_command(
    cmd: &mut Command,
    input: ProcessInput,
) -> Result<ProcessOutput, ProcessError> {
    // The child is killed when dropped, which is how the timeout kills it.
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &input.env_vars {
        cmd.env(key, value);
    }
    if let Some(dir) = &input.working_directory {
        cmd.current_dir(dir);
    }

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ProcessError::NotFound(program.clone()),
        std::io::ErrorKind::PermissionDenied => ProcessError::PermissionDenied(program.clone()),
        _ => ProcessError::Io(e),
    })?;

    if let Some(mut stdin) = child.stdin.take() {
        let payload = serde_json::to_vec(&input.data).unwrap_or_default();
        // The process may exit without reading stdin; that is not an error.
        let _ = stdin.write_all(&payload).await;
        drop(stdin);
    }

    // Read the streams in their own tasks so `child.wait()` can borrow the child.
    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    match tokio::time::timeout(input.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            let stdout_bytes = stdout_task.await.unwrap_or_default();
            let stderr_bytes = stderr_task.await.unwrap_or_default();
            let stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
            let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();
            let parsed_output = parse_last_json(&stdout);

            Ok(ProcessOutput {
                stdout,
                stderr,
                exit_code: status.code().unwrap_or(-1),
                duration_ms,
                parsed_output,
            })
        }
        Ok(Err(e)) => Err(ProcessError::Io(e)),
        Err(_elapsed) => {
            stdout_task.abort();
            stderr_task.abort();
            Err(ProcessError::Timeout {
                elapsed_ms: start.elapsed().as_millis() as u64,
            })
        }
    }
}

/// Parse stdout as JSON, falling back to its last non-empty line.
///
/// Renderers tend to log to stdout before printing their result.
fn parse_last_json(stdout: &str) -> Option<serde_json::Value> {
    serde_json::from_str(stdout.trim()).ok().or_else(|| {
        stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .and_then(|l| serde_json::from_str(l).ok())
    })
}

/// Read a whole stream, capped at [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.take(MAX_OUTPUT_BYTES as u64).read_to_end(&mut buf).await;
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
