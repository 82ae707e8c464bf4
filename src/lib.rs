//! Mender - autonomous patch-and-verify debugging
//!
//! Runs a project's test suite, turns failures into stable signatures, asks
//! pluggable fix backends for candidate patches, and keeps only the patches
//! that make the suite better. Everything else is rolled back.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`runner`] - Test suite execution
//! - [`parser`] - Failure extraction from test output
//! - [`signature`] - Deterministic error signatures
//! - [`backend`] - Fix backends and the registry that tries them
//! - [`confidence`] - Candidate scoring and the retry gate
//! - [`patch`] - Unified diffs, file backups, apply + verify
//! - [`rollback`] - Restoring backed-up files
//! - [`store`] - Cross-session learning store
//! - [`session`] - Session reports
//! - [`orchestrator`] - The retry loop state machine
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Testing infrastructure (mocks, fixtures, assertions)
//!
//! # Example
//!
//! ```rust,ignore
//! use mender::{Orchestrator, ProjectConfig};
//!
//! let config = ProjectConfig::load(&project_dir)?;
//! let report = Orchestrator::from_config(&project_dir, config).run().await?;
//! println!("{}", report.summary());
//! ```

pub mod attempt;
pub mod backend;
pub mod confidence;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod parser;
pub mod patch;
pub mod rollback;
pub mod runner;
pub mod session;
pub mod signature;
pub mod store;
pub mod testing;

// Re-export commonly used types
pub use error::{IntoMenderError, MenderError, Result};

pub use attempt::{PatchAttempt, PatchOutcome};
pub use backend::{BackendRegistry, Candidate, CommandBackend, FixBackend, FixRequest, RegistryEvent};
pub use confidence::{Assessment, ConfidenceManager, RetryDecision};
pub use config::{ConfigValidator, ProjectConfig, ValidationReport};
pub use orchestrator::{LoopState, Orchestrator, Outcome};
pub use parser::{FailureKind, FailureParser, FailureRecord};
pub use patch::{Backup, BackupReceipt, BackupStore, PatchApplier, UnifiedPatch, Verification};
pub use rollback::{RestoreOutcome, RollbackManager, RollbackResult};
pub use runner::{CommandTestRunner, TestRun, TestRunner};
pub use session::{Escalation, EscalationReason, ReportStore, SessionReport, SessionStatus};
pub use signature::{signature_of, ErrorSignature};
pub use store::{DailyStats, LearningStore, PatchHistory};

// Re-export testing types for convenience
pub use testing::{FileCheckRunner, MockFixBackend, ScriptedTestRunner};

// TestFixture is only available in test builds
#[cfg(test)]
pub use testing::TestFixture;
