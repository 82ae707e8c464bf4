//! Testing infrastructure for mender.
//!
//! This module provides mocks, fixtures, and assertions for exercising the
//! patch loop without spawning test suites or calling real models.
//!
//! # Architecture
//!
//! - **Mocks**: scripted and file-inspecting test runners, queued fix backends
//! - **Fixtures**: a broken project plus the patches that fix it (test-only)
//! - **Assertions**: domain-specific checks on attempts and reports
//!
//! # Example
//!
//! ```rust,ignore
//! use mender::testing::{MockFixBackend, ScriptedTestRunner};
//!
//! let backend = MockFixBackend::new("local").with_patches(vec![FIX_ADD]);
//! let runner = ScriptedTestRunner::new(vec![TestRun::pass("1 passed")]);
//! ```

pub mod assertions;
#[cfg(test)]
pub mod fixtures;
pub mod mocks;

pub use assertions::*;
#[cfg(test)]
pub use fixtures::*;
pub use mocks::*;
