//! Custom error types for mender.
//!
//! This module provides structured error types that enable better
//! error handling, reporting, and recovery throughout the debugging session.
//!
//! Most runtime trouble inside a session (backend timeouts, unparsable test
//! output, patches that do not apply, corrupted history files) is *not* an
//! error at this level: each component degrades it to "no result" and the
//! orchestrator moves on. `MenderError` covers what remains: setup problems,
//! I/O failures that cannot be degraded, and invariant violations.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for mender operations
#[derive(Error, Debug)]
pub enum MenderError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Project directory missing
    #[error("Project directory does not exist: {path}")]
    MissingProject { path: PathBuf },

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// Test command could not be started or supervised
    #[error("Test runner error: {message}")]
    TestRunner { message: String },

    /// A fix backend failed
    #[error("Backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },

    /// A backend call exceeded its time box
    #[error("Backend '{backend}' timed out after {secs}s")]
    BackendTimeout { backend: String, secs: u64 },

    // =========================================================================
    // Patch Errors
    // =========================================================================
    /// Patch text is not a usable unified diff
    #[error("Malformed patch: {reason}")]
    MalformedPatch { reason: String },

    /// A hunk did not match the working tree
    #[error("Patch does not apply to {path}: {reason}")]
    PatchConflict { path: PathBuf, reason: String },

    /// Patch tried to touch a path outside the project
    #[error("Patch path escapes the project directory: {path}")]
    PathEscape { path: PathBuf },

    /// Restoring a backup failed
    #[error("Failed to restore {path}: {message}")]
    RestoreFailed { path: PathBuf, message: String },

    // =========================================================================
    // Store / Session Errors
    // =========================================================================
    /// Learning store could not be written
    #[error("Learning store error: {message}")]
    Store { message: String },

    /// Session report could not be persisted
    #[error("Session error: {message}")]
    Session { message: String },

    /// Invalid error signature string
    #[error("Invalid signature '{value}': expected 64 hex characters")]
    InvalidSignature { value: String },

    /// Internal invariant broken
    #[error("Invariant violated: {message}")]
    Invariant { message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MenderError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid-config error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a backend error
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a malformed-patch error
    pub fn malformed_patch(reason: impl Into<String>) -> Self {
        Self::MalformedPatch {
            reason: reason.into(),
        }
    }

    /// Create a patch conflict error
    pub fn conflict(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::PatchConflict {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create an invariant error
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Transient execution errors: retried or treated as "no result".
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TestRunner { .. }
                | Self::Backend { .. }
                | Self::BackendTimeout { .. }
                | Self::MalformedPatch { .. }
                | Self::PatchConflict { .. }
        )
    }

    /// Patch-application errors, handled exactly like a failed verification.
    pub fn is_patch_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedPatch { .. } | Self::PatchConflict { .. } | Self::PathEscape { .. }
        )
    }

    /// Check if this error requires human intervention
    pub fn requires_human(&self) -> bool {
        matches!(
            self,
            Self::Invariant { .. } | Self::RestoreFailed { .. } | Self::PathEscape { .. }
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            Self::MissingProject { .. } => 6,
            Self::RestoreFailed { .. } | Self::Invariant { .. } => 4,
            Self::InvalidSignature { .. } => 2,
            _ => 1,
        }
    }
}

/// Type alias for mender results
pub type Result<T> = std::result::Result<T, MenderError>;

/// Extension trait for converting foreign errors to `MenderError`
pub trait IntoMenderError<T> {
    fn into_mender_config(self) -> Result<T>;
    fn into_mender_store(self) -> Result<T>;
    fn into_mender_backend(self, backend: &str) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> IntoMenderError<T> for std::result::Result<T, E> {
    fn into_mender_config(self) -> Result<T> {
        self.map_err(|e| MenderError::config(e.into().to_string()))
    }

    fn into_mender_store(self) -> Result<T> {
        self.map_err(|e| MenderError::store(e.into().to_string()))
    }

    fn into_mender_backend(self, backend: &str) -> Result<T> {
        self.map_err(|e| MenderError::backend(backend, e.into().to_string()))
    }
}
