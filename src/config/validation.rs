//! Configuration validation for mender.
//!
//! # Example
//!
//! ```rust,ignore
//! use mender::config::ConfigValidator;
//! use std::path::Path;
//!
//! let report = ConfigValidator::new(Path::new("/path/to/project")).validate();
//! if !report.is_valid() {
//!     for error in &report.errors {
//!         eprintln!("Error: {}", error);
//!     }
//!     std::process::exit(report.exit_code());
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::ProjectConfig;

/// Result of configuration validation.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Errors that prevent a session from starting.
    pub errors: Vec<String>,
    /// Warnings that don't prevent validity but indicate potential issues.
    pub warnings: Vec<String>,
    /// Files that were validated.
    pub files_checked: Vec<PathBuf>,
}

impl ValidationReport {
    /// Create a new empty validation report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the configuration is valid (no errors).
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns 0 if valid, 1 if invalid.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_valid() {
            0
        } else {
            1
        }
    }

    /// Generate a human-readable summary of the validation result.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.is_valid() {
            if self.warnings.is_empty() {
                "Configuration is valid.".to_string()
            } else {
                format!(
                    "Configuration is valid with {} warning(s).",
                    self.warnings.len()
                )
            }
        } else {
            format!(
                "Configuration is invalid with {} error(s).",
                self.errors.len()
            )
        }
    }
}

/// Validates settings files and the values they produce.
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    project_dir: PathBuf,
    user_config_path: Option<PathBuf>,
}

impl ConfigValidator {
    /// Create a new validator for the given project directory.
    #[must_use]
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            user_config_path: ProjectConfig::user_settings_path(),
        }
    }

    /// Set a custom user config path for testing.
    #[must_use]
    pub fn with_user_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.user_config_path = path;
        self
    }

    /// Validate the configuration and return a report.
    ///
    /// Never fails: unreadable or unparsable files become report errors.
    #[must_use]
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::new();

        let settings_path = ProjectConfig::settings_path(&self.project_dir);
        report.files_checked.push(settings_path.clone());
        if !settings_path.exists() {
            report
                .warnings
                .push("settings.json not found - using defaults".to_string());
        }

        let config = match ProjectConfig::load_layered(
            &self.project_dir,
            self.user_config_path.as_deref(),
        ) {
            Ok(config) => config,
            Err(e) => {
                report.errors.push(e.to_string());
                return report;
            }
        };

        Self::check_values(&config, &mut report);
        report
    }

    /// Check an already-loaded configuration.
    pub fn check_values(config: &ProjectConfig, report: &mut ValidationReport) {
        if config.test.command.trim().is_empty() {
            report
                .errors
                .push("test.command is empty - nothing to run".to_string());
        }
        if config.test.timeout_secs == 0 {
            report
                .errors
                .push("test.timeoutSecs must be greater than 0".to_string());
        }

        let limits = &config.limits;
        if limits.max_retry_cycles == 0 {
            report
                .errors
                .push("limits.maxRetryCycles must be at least 1".to_string());
        }
        if limits.max_attempts == 0 {
            report
                .errors
                .push("limits.maxAttempts must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&limits.retry_threshold) {
            report.errors.push(format!(
                "limits.retryThreshold must be within [0, 1], got {}",
                limits.retry_threshold
            ));
        }

        if config.enabled_backends().next().is_none() {
            report.warnings.push(
                "no enabled backends - every failure will be escalated for manual review"
                    .to_string(),
            );
        }

        let mut names = HashSet::new();
        for backend in &config.backends {
            if !names.insert(backend.name.as_str()) {
                report
                    .errors
                    .push(format!("duplicate backend name '{}'", backend.name));
            }
            if backend.command.trim().is_empty() {
                report
                    .errors
                    .push(format!("backend '{}' has an empty command", backend.name));
                continue;
            }
            if backend.timeout_secs == 0 {
                report.errors.push(format!(
                    "backend '{}' timeoutSecs must be greater than 0",
                    backend.name
                ));
            }
            if let Some(program) = backend.command.split_whitespace().next() {
                if which::which(program).is_err() {
                    report.warnings.push(format!(
                        "backend '{}': '{}' not found on PATH",
                        backend.name, program
                    ));
                }
            }
        }
    }
}
