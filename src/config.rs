//! Configuration management for mender.
//!
//! Settings are read from `<project>/.mender/settings.json`, layered on top
//! of optional user-level defaults at `<config_dir>/mender/settings.json`.
//! Layering is per top-level section: a section present in the project file
//! replaces the user's copy wholesale. Every field has a default and unknown
//! fields are ignored, so older and newer settings files both load.

pub mod validation;

pub use validation::{ConfigValidator, ValidationReport};

use crate::error::{IntoMenderError, MenderError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Name of the per-project state directory.
pub const STATE_DIR: &str = ".mender";

/// Settings file name inside the state directory.
pub const SETTINGS_FILE: &str = "settings.json";

fn default_test_timeout_secs() -> u64 {
    600
}

fn default_backend_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

/// How to run the project's test suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConfig {
    /// Shell command, run through `sh -c` in the project directory.
    #[serde(default)]
    pub command: String,

    /// Upper bound on one suite run.
    #[serde(default = "default_test_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout_secs: default_test_timeout_secs(),
        }
    }
}

impl TestConfig {
    /// Timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One fix-generation backend, invoked as a shell command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Display name used in logs and the session report.
    pub name: String,

    /// Shell command; receives the prompt on stdin and prints a patch.
    #[serde(default)]
    pub command: String,

    /// Per-call time box.
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,

    /// Disabled backends stay in the file but are never called.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl BackendConfig {
    /// Create an enabled backend with the default timeout.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout_secs: default_backend_timeout_secs(),
            enabled: true,
        }
    }

    /// Timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Bounds on the retry loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsConfig {
    /// Full-suite re-runs per session.
    pub max_retry_cycles: u32,
    /// Applied attempts per signature per session.
    pub max_attempts: u32,
    /// Refinements requested per signature per session.
    pub modification_limit: u32,
    /// Minimum confidence for a patch to be applied at all.
    pub retry_threshold: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_retry_cycles: 5,
            max_attempts: 5,
            modification_limit: 3,
            retry_threshold: 0.2,
        }
    }
}

/// How much source code to fold into signatures and prompts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextConfig {
    /// Lines either side of the failing test.
    pub radius_lines: usize,
    /// Hard cap on context size.
    pub max_bytes: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            radius_lines: 8,
            max_bytes: 4096,
        }
    }
}

/// Project configuration loaded from `.mender/settings.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    #[serde(default)]
    pub test: TestConfig,

    /// Fix backends in priority order.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub context: ContextConfig,

    /// Override for the learning store location.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

impl ProjectConfig {
    /// Load configuration for a project, layering user defaults underneath.
    ///
    /// # Errors
    ///
    /// Returns an error if a settings file exists but cannot be read or parsed.
    pub fn load(project_dir: &Path) -> Result<Self> {
        Self::load_layered(project_dir, Self::user_settings_path().as_deref())
    }

    /// Load with an explicit user-level settings path (or none).
    ///
    /// # Errors
    ///
    /// Returns an error if a settings file exists but cannot be read or parsed.
    pub fn load_layered(project_dir: &Path, user_settings: Option<&Path>) -> Result<Self> {
        let mut merged = serde_json::Map::new();

        let layers = [
            user_settings.map(Path::to_path_buf),
            Some(Self::settings_path(project_dir)),
        ];

        for path in layers.into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            debug!("Loading settings from {}", path.display());
            let content = std::fs::read_to_string(&path)
                .map_err(|e| MenderError::config_with_path(e.to_string(), path.clone()))?;
            let value: serde_json::Value = serde_json::from_str(&content)
                .map_err(|e| MenderError::config_with_path(e.to_string(), path.clone()))?;
            match value {
                serde_json::Value::Object(map) => merged.extend(map),
                _ => {
                    return Err(MenderError::config_with_path(
                        "settings must be a JSON object",
                        path,
                    ))
                }
            }
        }

        serde_json::from_value(serde_json::Value::Object(merged)).into_mender_config()
    }

    /// Get the settings.json path for a project
    #[must_use]
    pub fn settings_path(project_dir: &Path) -> PathBuf {
        Self::state_dir(project_dir).join(SETTINGS_FILE)
    }

    /// User-level settings path, if the platform has a config directory.
    #[must_use]
    pub fn user_settings_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("mender").join(SETTINGS_FILE))
    }

    /// Get the `.mender` directory
    #[must_use]
    pub fn state_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR)
    }

    /// Directory holding the learning store files.
    #[must_use]
    pub fn learning_dir(&self, project_dir: &Path) -> PathBuf {
        match &self.store_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_dir.join(dir),
            None => Self::state_dir(project_dir).join("learning"),
        }
    }

    /// Directory holding session reports.
    #[must_use]
    pub fn reports_dir(project_dir: &Path) -> PathBuf {
        Self::state_dir(project_dir).join("reports")
    }

    /// Backends that should actually be called.
    pub fn enabled_backends(&self) -> impl Iterator<Item = &BackendConfig> {
        self.backends.iter().filter(|b| b.enabled)
    }
}
