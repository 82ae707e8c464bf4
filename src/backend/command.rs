//! Fix backend that shells out to a command.
//!
//! The command runs through `sh -c` in the project directory, receives the
//! prompt on stdin, and prints a patch on stdout. This covers local model
//! runners (`ollama run codellama`), remote CLIs, and plain scripts alike.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use super::prompt::build_prompt;
use super::{FixBackend, FixRequest};
use crate::config::BackendConfig;
use crate::error::{IntoMenderError, MenderError, Result};

/// A backend backed by an external command.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    name: String,
    command: String,
    project_dir: PathBuf,
    timeout: Duration,
}

impl CommandBackend {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        project_dir: impl AsRef<Path>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            project_dir: project_dir.as_ref().to_path_buf(),
            timeout,
        }
    }

    /// Build from a settings entry.
    #[must_use]
    pub fn from_config(config: &BackendConfig, project_dir: &Path) -> Self {
        Self::new(&config.name, &config.command, project_dir, config.timeout())
    }

    async fn execute(&self, prompt: &str) -> Result<String> {
        debug!(
            "Running backend {} ({} chars prompt)",
            self.name,
            prompt.len()
        );

        let mut child = AsyncCommand::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MenderError::backend(&self.name, format!("failed to spawn: {}", e)))?;

        // Write the prompt while draining output so neither pipe fills up.
        let stdin = child.stdin.take();
        let write_prompt = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(prompt.as_bytes()).await {
                // Commands that ignore stdin may exit before reading it.
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };
        let (written, output) = tokio::join!(write_prompt, child.wait_with_output());

        let output = output.into_mender_backend(&self.name)?;
        written.map_err(|e| MenderError::backend(&self.name, format!("failed to write prompt: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MenderError::backend(
                &self.name,
                format!(
                    "exited with {}: {}",
                    output.status.code().map_or_else(|| "signal".to_string(), |c| c.to_string()),
                    stderr.trim()
                ),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl FixBackend for CommandBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &FixRequest) -> Result<String> {
        let prompt = build_prompt(request);
        let output = self.execute(&prompt).await?;
        Ok(extract_patch(&output))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:diff|patch)[^\n]*\n(.*?)```").expect("fence regex is valid")
    })
}

/// Pull a unified diff out of backend output.
///
/// Prefers the first ```diff / ```patch fenced block; otherwise accepts the
/// raw output from its first file header when it looks like a diff;
/// otherwise returns an empty string.
#[must_use]
pub fn extract_patch(output: &str) -> String {
    if let Some(caps) = fence_re().captures(output) {
        let body = caps[1].trim_matches('\n');
        if !body.trim().is_empty() {
            return format!("{}\n", body.trim_end());
        }
    }

    let lines: Vec<&str> = output.lines().collect();
    let start = lines.iter().position(|l| l.starts_with("diff --git ")).or_else(|| {
        lines
            .windows(2)
            .position(|w| w[0].starts_with("--- ") && w[1].starts_with("+++ "))
    });

    match start {
        Some(start) if lines[start..].iter().any(|l| l.starts_with("@@")) => {
            format!("{}\n", lines[start..].join("\n").trim_end())
        }
        _ => String::new(),
    }
}
