//! Bounded command execution for autonomous actions.
//!
//! Commands approved by the debate pipeline run here: single shell command,
//! fixed working directory, hard wall-clock deadline, capped output capture.
//! Policy (deny-lists, path scoping) lives in the verifier — by the time a
//! command reaches this executor it has already been approved.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::SandboxConfig;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, serde::Serialize)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

pub struct SandboxExecutor {
    command_timeout: Duration,
    max_output_bytes: usize,
    workspace_dir: String,
}

impl SandboxExecutor {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            max_output_bytes: config.max_output_bytes,
            workspace_dir: config.workspace_dir.clone(),
        }
    }

    /// Run one shell command to completion or deadline. A timeout is an
    /// outcome, not an error: partial output is kept and surfaced.
    pub async fn execute(&self, command: &str) -> CoreResult<CommandOutcome> {
        let command = command.trim();
        if command.is_empty() {
            return Err(CoreError::domain("There is no command to run.", "empty sandbox command"));
        }
        // Parse up front so unbalanced quoting fails before the shell sees it.
        shell_words::split(command).map_err(|e| {
            CoreError::domain(
                "That command has unbalanced quoting.",
                format!("sandbox command parse failed: {}", e),
            )
        })?;

        let started = Instant::now();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::transient(format!("sandbox spawn failed: {}", e)))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let cap = self.max_output_bytes;

        let read_capped = |pipe: Option<tokio::process::ChildStdout>| async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = pipe {
                let _ = (&mut pipe).take(cap as u64 + 1).read_to_end(&mut buf).await;
            }
            buf
        };
        let read_capped_err = |pipe: Option<tokio::process::ChildStderr>| async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = pipe {
                let _ = (&mut pipe).take(cap as u64 + 1).read_to_end(&mut buf).await;
            }
            buf
        };

        let body = async {
            let (stdout, stderr, status) = tokio::join!(
                read_capped(stdout_pipe.take()),
                read_capped_err(stderr_pipe.take()),
                child.wait(),
            );
            (stdout, stderr, status)
        };

        match tokio::time::timeout(self.command_timeout, body).await {
            Ok((stdout, stderr, status)) => {
                let exit_code = status
                    .map_err(|e| CoreError::transient(format!("sandbox wait failed: {}", e)))?
                    .code()
                    .unwrap_or(-1);
                let outcome = CommandOutcome {
                    stdout: self.render_output(stdout),
                    stderr: self.render_output(stderr),
                    exit_code,
                    duration_ms: started.elapsed().as_millis() as u64,
                    timed_out: false,
                };
                info!(exit_code, duration_ms = outcome.duration_ms, "Sandbox command finished");
                Ok(outcome)
            }
            Err(_) => {
                warn!(timeout = ?self.command_timeout, "Sandbox command hit its deadline, killing");
                let _ = child.kill().await;
                Ok(CommandOutcome {
                    stdout: String::new(),
                    stderr: format!("command killed after {:?}", self.command_timeout),
                    exit_code: -1,
                    duration_ms: started.elapsed().as_millis() as u64,
                    timed_out: true,
                })
            }
        }
    }

    fn render_output(&self, bytes: Vec<u8>) -> String {
        let truncated = bytes.len() > self.max_output_bytes;
        let kept = if truncated { &bytes[..self.max_output_bytes] } else { &bytes[..] };
        let mut text = String::from_utf8_lossy(kept).into_owned();
        if truncated {
            text.push_str("\n... [output truncated]");
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(timeout_secs: u64, max_output: usize) -> SandboxExecutor {
        SandboxExecutor::new(&SandboxConfig {
            command_timeout_secs: timeout_secs,
            max_output_bytes: max_output,
            workspace_dir: std::env::temp_dir().to_string_lossy().into_owned(),
        })
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let outcome = executor(10, 4096).execute("echo hello").await.unwrap();
        assert_eq!(outcome.stdout.trim(), "hello");
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.success());
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_errored() {
        let outcome = executor(10, 4096).execute("ls /definitely/not/a/path").await.unwrap();
        assert_ne!(outcome.exit_code, 0);
        assert!(!outcome.success());
        assert!(!outcome.stderr.is_empty());
    }

    #[tokio::test]
    async fn deadline_kills_and_marks_the_outcome() {
        let outcome = executor(1, 4096).execute("sleep 30").await.unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
        assert!(outcome.duration_ms >= 1000);
    }

    #[tokio::test]
    async fn output_is_capped() {
        let outcome = executor(10, 64).execute("yes x | head -c 10000").await.unwrap();
        assert!(outcome.stdout.len() < 200);
        assert!(outcome.stdout.contains("[output truncated]"));
    }

    #[tokio::test]
    async fn empty_and_unbalanced_commands_are_rejected() {
        assert!(executor(10, 4096).execute("   ").await.is_err());
        assert!(executor(10, 4096).execute("echo 'oops").await.is_err());
    }
}
