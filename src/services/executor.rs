//! External process execution with deadlines.
//!
//! Two shapes: `run` captures stdout/stderr whole, `run_streaming` forwards
//! one line at a time to a sink. A fired deadline kills the process and
//! awaits reaping; whatever output was captured so far is preserved in the
//! error.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::error::ExecError;

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external programs under a deadline.
#[derive(Debug, Clone, Default)]
pub struct Executor;

impl Executor {
    pub fn new() -> Self {
        Self
    }

    /// Run to completion, capturing output. Non-zero exit is an error
    /// carrying both captured streams.
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, ExecError> {
        debug!(program, ?args, "running command");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn { program: program.to_string(), source })?;

        let mut stdout_pipe = child.stdout.take().expect("stdout piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr piped");
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stdout_pipe.read_to_string(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr_pipe.read_to_string(&mut buf).await;
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| ExecError::Io { program: program.to_string(), source })?,
            () = tokio::time::sleep(timeout) => {
                warn!(program, timeout_secs = timeout.as_secs(), "command deadline fired, killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
                let partial_stdout = stdout_task.await.unwrap_or_default();
                let partial_stderr = stderr_task.await.unwrap_or_default();
                return Err(ExecError::Timeout {
                    program: program.to_string(),
                    timeout_secs: timeout.as_secs(),
                    partial_stdout,
                    partial_stderr,
                });
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let exit_code = status.code().unwrap_or(-1);
        if !status.success() {
            return Err(ExecError::NonZeroExit {
                program: program.to_string(),
                code: exit_code,
                stdout,
                stderr,
            });
        }
        Ok(CommandOutput { stdout, stderr, exit_code })
    }

    /// Run while forwarding each output line (stdout and stderr interleaved
    /// per stream) into `sink`. Returns the exit code; the deadline or the
    /// cancellation handle kills the process like `run` does.
    pub async fn run_streaming(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
        sink: mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<i32, ExecError> {
        debug!(program, ?args, "running command (streaming)");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn { program: program.to_string(), source })?;

        let stdout_pipe = child.stdout.take().expect("stdout piped");
        let stderr_pipe = child.stderr.take().expect("stderr piped");

        let out_sink = sink.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout_pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if out_sink.send(line).await.is_err() {
                    break;
                }
            }
        });
        let err_sink = sink;
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr_pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if err_sink.send(line).await.is_err() {
                    break;
                }
            }
        });

        let status = tokio::select! {
            status = child.wait() => status.map_err(|source| ExecError::Io { program: program.to_string(), source })?,
            () = tokio::time::sleep(timeout) => {
                warn!(program, timeout_secs = timeout.as_secs(), "streaming command deadline fired, killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                return Err(ExecError::Timeout {
                    program: program.to_string(),
                    timeout_secs: timeout.as_secs(),
                    partial_stdout: String::new(),
                    partial_stderr: String::new(),
                });
            }
            () = cancel.cancelled() => {
                debug!(program, "streaming command cancelled, killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                return Err(ExecError::Cancelled { program: program.to_string() });
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Strip path-traversal fragments and shell metacharacters from a value
/// derived from user input before it is used as a process argument.
pub fn sanitize_arg(input: &str) -> String {
    let filtered: String = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '=' | '@' | '+'))
        .collect();
    let mut out = filtered;
    while out.contains("..") {
        out = out.replace("..", ".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let exec = Executor::new();
        let out = exec
            .run("sh", &["-c".into(), "echo hello".into()], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_carries_stderr() {
        let exec = Executor::new();
        let err = exec
            .run("sh", &["-c".into(), "echo boom >&2; exit 3".into()], Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ExecError::NonZeroExit { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr.trim(), "boom");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_timeout_preserves_partial_output() {
        let exec = Executor::new();
        let err = exec
            .run(
                "sh",
                &["-c".into(), "echo partial; sleep 5".into()],
                Duration::from_millis(300),
            )
            .await
            .unwrap_err();
        match err {
            ExecError::Timeout { partial_stdout, .. } => {
                assert_eq!(partial_stdout.trim(), "partial");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_streaming_yields_lines_in_order() {
        let exec = Executor::new();
        let (tx, mut rx) = mpsc::channel(16);
        let code = exec
            .run_streaming(
                "sh",
                &["-c".into(), "echo one; echo two".into()],
                Duration::from_secs(5),
                tx,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(rx.recv().await.unwrap(), "one");
        assert_eq!(rx.recv().await.unwrap(), "two");
    }

    #[test]
    fn test_sanitize_strips_traversal_and_metacharacters() {
        assert!(!sanitize_arg("../../etc/passwd").contains(".."));
        assert!(!sanitize_arg("app; rm -rf /").contains(';'));
        assert!(!sanitize_arg("app; rm -rf /").contains(' '));
        assert_eq!(sanitize_arg("feature/login"), "feature/login");
        assert_eq!(sanitize_arg("v1.2.3"), "v1.2.3");
        assert!(!sanitize_arg("a$(whoami)b").contains('$'));
        assert!(!sanitize_arg("x`y`z").contains('`'));
    }
}
