//! Test runner: executes the project's test command.
//!
//! The runner never fails past its own boundary. A command that cannot be
//! launched or that overruns its timeout still produces a [`TestRun`], with
//! `passed = false` and the reason embedded in `output`, so the orchestrator
//! has a single shape to reason about.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

/// Outcome of one suite run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRun {
    /// Combined stdout followed by stderr.
    pub output: String,
    /// True only when the command exited with status 0.
    pub passed: bool,
    /// Exit code, if the process ran to completion.
    pub exit_code: Option<i32>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Whether the run was cut off by the timeout.
    pub timed_out: bool,
}

impl TestRun {
    /// A passing run with the given output.
    pub fn pass(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            passed: true,
            exit_code: Some(0),
            duration_ms: 0,
            timed_out: false,
        }
    }

    /// A failing run with the given output.
    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            passed: false,
            exit_code: Some(1),
            duration_ms: 0,
            timed_out: false,
        }
    }
}

/// Abstraction over "run the test suite".
///
/// Implemented by [`CommandTestRunner`] for real projects and by the scripted
/// runner in [`crate::testing`] for unit tests.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run the suite once.
    async fn run(&self) -> TestRun;

    /// Human-readable description (the command line, usually).
    fn describe(&self) -> String;
}

/// Runs a shell command in the project directory.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    command: String,
    project_dir: PathBuf,
    timeout: Duration,
}

impl CommandTestRunner {
    /// Create a runner for `command` executed in `project_dir`.
    pub fn new(command: impl Into<String>, project_dir: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            project_dir: project_dir.as_ref().to_path_buf(),
            timeout,
        }
    }

    /// The configured timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self) -> TestRun {
        let start = Instant::now();
        debug!("Running test command: {}", self.command);

        let child = AsyncCommand::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to launch test command: {}", e);
                return TestRun {
                    output: format!("failed to launch test command `{}`: {}", self.command, e),
                    passed: false,
                    exit_code: None,
                    duration_ms: start.elapsed().as_millis() as u64,
                    timed_out: false,
                };
            }
        };

        // Dropping the wait future on timeout drops the child, which kills it.
        let result = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                let exit_code = output.status.code();
                debug!(
                    "Test command finished in {}ms with exit code {:?}",
                    duration_ms, exit_code
                );
                TestRun {
                    output: text,
                    passed: output.status.success(),
                    exit_code,
                    duration_ms,
                    timed_out: false,
                }
            }
            Ok(Err(e)) => {
                warn!("Test command could not be awaited: {}", e);
                TestRun {
                    output: format!("test command `{}` failed while running: {}", self.command, e),
                    passed: false,
                    exit_code: None,
                    duration_ms,
                    timed_out: false,
                }
            }
            Err(_) => {
                warn!(
                    "Test command timed out after {}s",
                    self.timeout.as_secs_f64()
                );
                TestRun {
                    output: format!(
                        "test command `{}` timed out after {:.1}s",
                        self.command,
                        self.timeout.as_secs_f64()
                    ),
                    passed: false,
                    exit_code: None,
                    duration_ms,
                    timed_out: true,
                }
            }
        }
    }

    fn describe(&self) -> String {
        self.command.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_passing_command() {
        let dir = TempDir::new().expect("temp dir");
        let runner = CommandTestRunner::new("echo ok", dir.path(), Duration::from_secs(10));
        let run = runner.run().await;
        assert!(run.passed);
        assert_eq!(run.exit_code, Some(0));
        assert!(run.output.contains("ok"));
    }

    #[tokio::test]
    async fn test_failing_command_captures_both_streams() {
        let dir = TempDir::new().expect("temp dir");
        let runner = CommandTestRunner::new(
            "echo out; echo err 1>&2; exit 3",
            dir.path(),
            Duration::from_secs(10),
        );
        let run = runner.run().await;
        assert!(!run.passed);
        assert_eq!(run.exit_code, Some(3));
        assert!(run.output.contains("out"));
        assert!(run.output.contains("err"));
    }

    #[tokio::test]
    async fn test_runs_in_project_dir() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("marker.txt"), "here").expect("write");
        let runner = CommandTestRunner::new("cat marker.txt", dir.path(), Duration::from_secs(10));
        assert!(runner.run().await.output.contains("here"));
    }

    #[tokio::test]
    async fn test_timeout_is_failure_not_error() {
        let dir = TempDir::new().expect("temp dir");
        let runner = CommandTestRunner::new("sleep 5", dir.path(), Duration::from_millis(100));
        let run = runner.run().await;
        assert!(!run.passed);
        assert!(run.timed_out);
        assert!(run.output.contains("timed out"));
    }

    #[tokio::test]
    async fn test_launch_failure_embeds_error() {
        let runner = CommandTestRunner::new(
            "true",
            "/definitely/not/a/real/dir",
            Duration::from_secs(1),
        );
        let run = runner.run().await;
        assert!(!run.passed);
        assert!(run.output.contains("failed to launch"));
        assert_eq!(run.exit_code, None);
    }
}
