//! Shared child-process plumbing for CLI executors.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::{Error, Result};

/// Collected output of a finished agent process.
#[derive(Debug)]
pub(crate) struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Spawns `program` and streams its output until exit or timeout.
///
/// `on_stdout` sees each stdout line as it arrives. The child is killed when
/// the timeout fires.
pub(crate) async fn run_streaming<F>(
    agent: &str,
    program: &str,
    args: &[String],
    working_dir: &Path,
    timeout: Duration,
    mut on_stdout: F,
) -> Result<ProcessOutput>
where
    F: FnMut(&str) + Send,
{
    tracing::info!(
        agent = %agent,
        cli = %program,
        working_dir = ?working_dir,
        timeout_secs = timeout.as_secs(),
        "spawning agent CLI"
    );

    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::AgentProcess(format!("failed to spawn {}: {}", program, e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::AgentProcess("stdout was not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::AgentProcess("stderr was not captured".to_string()))?;

    let collect = async {
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        let mut stderr_open = true;

        loop {
            tokio::select! {
                line = stdout_reader.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            tracing::trace!(agent = %agent, line = %line, "agent stdout");
                            on_stdout(&line);
                            stdout_lines.push(line);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::error!(error = %e, "error reading stdout");
                            break;
                        }
                    }
                }
                line = stderr_reader.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(line)) => stderr_lines.push(line),
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            tracing::error!(error = %e, "error reading stderr");
                            stderr_open = false;
                        }
                    }
                }
            }
        }

        // Drain whatever stderr is left after stdout closes.
        while stderr_open {
            match stderr_reader.next_line().await {
                Ok(Some(line)) => stderr_lines.push(line),
                _ => stderr_open = false,
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| Error::AgentProcess(format!("failed to wait for {}: {}", program, e)))?;

        Ok::<_, Error>(ProcessOutput {
            status,
            stdout: stdout_lines,
            stderr: stderr_lines,
        })
    };

    match tokio::time::timeout(timeout, collect).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(agent = %agent, timeout_secs = timeout.as_secs(), "agent timed out");
            Err(Error::AgentTimeout {
                agent: agent.to_string(),
                secs: timeout.as_secs(),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_stdout_and_stderr() {
        let args = vec![
            "-c".to_string(),
            "echo one; echo two; echo oops 1>&2".to_string(),
        ];
        let mut seen = Vec::new();
        let output = run_streaming("sh", "sh", &args, Path::new("."), Duration::from_secs(10), |l| {
            seen.push(l.to_string())
        })
        .await
        .unwrap();

        assert!(output.status.success());
        assert_eq!(output.stdout, vec!["one", "two"]);
        assert_eq!(output.stderr, vec!["oops"]);
        assert_eq!(seen, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn times_out_long_running_process() {
        let args = vec!["-c".to_string(), "sleep 5".to_string()];
        let err = run_streaming("sh", "sh", &args, Path::new("."), Duration::from_millis(100), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentTimeout { secs: 0, .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_process_error() {
        let err = run_streaming(
            "ghost",
            "/nonexistent/agent-cli",
            &[],
            Path::new("."),
            Duration::from_secs(1),
            |_| {},
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::AgentProcess(_)));
    }
}
