//! Fix backends and the registry that tries them in order.
//!
//! A backend is anything that turns a failure description into a unified
//! diff. The [`BackendRegistry`] holds them in priority order and asks each
//! in turn, time-boxing every call. A timeout, an error, or empty output all
//! mean "no result" and the registry moves on to the next backend.
//!
//! # Example
//!
//! ```rust,ignore
//! use mender::backend::{BackendRegistry, CommandBackend, FixRequest};
//! use std::sync::Arc;
//!
//! let registry = BackendRegistry::new()
//!     .with_backend(Arc::new(CommandBackend::new("local", "ollama run codellama", ".", timeout)));
//!
//! let dispatch = registry.generate(&FixRequest::from_failure(&record, &context)).await;
//! if let Some(candidate) = dispatch.candidate {
//!     println!("{} proposed:\n{}", candidate.backend, candidate.patch);
//! }
//! ```

pub mod command;
pub mod prompt;

pub use command::{extract_patch, CommandBackend};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ProjectConfig;
use crate::error::Result;
use crate::parser::{FailureKind, FailureRecord};

/// Failed patches carried in a request, newest last.
pub const MAX_FAILED_PATCHES: usize = 3;

// =============================================================================
// Request
// =============================================================================

/// Everything a backend gets to see about one failure.
#[derive(Debug, Clone, PartialEq)]
pub struct FixRequest {
    pub error_message: String,
    pub code_context: String,
    pub test_file: PathBuf,
    pub test_name: String,
    pub kind: FailureKind,
    /// Patches that already failed for this signature, newest last.
    pub failed_patches: Vec<String>,
    /// Patch being refined, if this is a refinement.
    pub previous_patch: Option<String>,
    /// Why the previous patch was rejected.
    pub feedback: Option<String>,
}

impl FixRequest {
    #[must_use]
    pub fn from_failure(record: &FailureRecord, code_context: &str) -> Self {
        Self {
            error_message: record.error_message.clone(),
            code_context: code_context.to_string(),
            test_file: record.source_file.clone(),
            test_name: record.test_name.clone(),
            kind: record.kind,
            failed_patches: Vec::new(),
            previous_patch: None,
            feedback: None,
        }
    }

    /// Attach earlier failed patches, keeping only the newest few.
    #[must_use]
    pub fn with_failed_patches(mut self, patches: Vec<String>) -> Self {
        let skip = patches.len().saturating_sub(MAX_FAILED_PATCHES);
        self.failed_patches = patches.into_iter().skip(skip).collect();
        self
    }

    /// Turn the request into a refinement of `previous`.
    #[must_use]
    pub fn with_refinement(mut self, previous: impl Into<String>, feedback: impl Into<String>) -> Self {
        self.previous_patch = Some(previous.into());
        self.feedback = Some(feedback.into());
        self
    }
}

// =============================================================================
// Backend trait
// =============================================================================

/// A source of candidate patches.
///
/// Implementations must be `Send + Sync`; the registry stores them as
/// `Arc<dyn FixBackend>`.
#[async_trait]
pub trait FixBackend: Send + Sync {
    /// Name used in logs and the session report.
    fn name(&self) -> &str;

    /// Propose a patch. An empty string means "nothing to offer".
    async fn generate(&self, request: &FixRequest) -> Result<String>;

    /// Propose an improved version of `previous_patch`.
    ///
    /// The default folds the previous patch and the verification feedback
    /// into the request and calls [`generate`](Self::generate).
    async fn refine(
        &self,
        request: &FixRequest,
        previous_patch: &str,
        feedback: &str,
    ) -> Result<String> {
        let refined = request.clone().with_refinement(previous_patch, feedback);
        self.generate(&refined).await
    }

    /// Upper bound on a single call.
    fn timeout(&self) -> Duration;
}

// =============================================================================
// Registry events
// =============================================================================

/// Audit trail of what the registry did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RegistryEvent {
    /// A backend was called.
    Tried { backend: String },
    /// A backend produced nothing usable.
    Skipped { backend: String, reason: String },
    /// A backend produced the candidate.
    Selected { backend: String },
    /// No backend produced anything.
    Exhausted { attempted: Vec<String> },
}

/// A non-empty patch and the backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub backend: String,
    pub patch: String,
}

/// Result of one registry call.
#[derive(Debug, Clone, Default)]
pub struct Dispatch {
    pub candidate: Option<Candidate>,
    pub events: Vec<RegistryEvent>,
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Clone, Copy)]
enum Call<'a> {
    Generate,
    Refine { patch: &'a str, feedback: &'a str },
}

/// Ordered list of backends.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn FixBackend>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`CommandBackend`] per enabled settings entry, in file order.
    #[must_use]
    pub fn from_config(config: &ProjectConfig, project_dir: &Path) -> Self {
        let backends = config
            .enabled_backends()
            .map(|b| Arc::new(CommandBackend::from_config(b, project_dir)) as Arc<dyn FixBackend>)
            .collect();
        Self { backends }
    }

    /// Append a backend at the lowest priority.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn FixBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn push(&mut self, backend: Arc<dyn FixBackend>) {
        self.backends.push(backend);
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Ask each backend in priority order; the first non-empty patch wins.
    pub async fn generate(&self, request: &FixRequest) -> Dispatch {
        let order: Vec<&Arc<dyn FixBackend>> = self.backends.iter().collect();
        self.dispatch(order, request, Call::Generate).await
    }

    /// Ask for a refinement, starting with the backend that produced
    /// `previous`, then the others in priority order.
    pub async fn refine(&self, request: &FixRequest, previous: &Candidate, feedback: &str) -> Dispatch {
        let mut order: Vec<&Arc<dyn FixBackend>> = self
            .backends
            .iter()
            .filter(|b| b.name() == previous.backend)
            .collect();
        order.extend(self.backends.iter().filter(|b| b.name() != previous.backend));

        let call = Call::Refine {
            patch: &previous.patch,
            feedback,
        };
        self.dispatch(order, request, call).await
    }

    async fn dispatch(
        &self,
        order: Vec<&Arc<dyn FixBackend>>,
        request: &FixRequest,
        call: Call<'_>,
    ) -> Dispatch {
        let mut events = Vec::new();
        let mut attempted = Vec::new();

        for backend in order {
            let name = backend.name().to_string();
            attempted.push(name.clone());
            events.push(RegistryEvent::Tried {
                backend: name.clone(),
            });
            debug!(backend = %name, "Requesting candidate patch");

            let pending = match call {
                Call::Generate => backend.generate(request),
                Call::Refine { patch, feedback } => backend.refine(request, patch, feedback),
            };
            let reason = match tokio::time::timeout(backend.timeout(), pending).await {
                Ok(Ok(patch)) if !patch.trim().is_empty() => {
                    info!(backend = %name, "Backend produced a candidate patch");
                    events.push(RegistryEvent::Selected {
                        backend: name.clone(),
                    });
                    return Dispatch {
                        candidate: Some(Candidate {
                            backend: name,
                            patch,
                        }),
                        events,
                    };
                }
                Ok(Ok(_)) => "empty output".to_string(),
                Ok(Err(e)) => {
                    if !e.is_recoverable() {
                        warn!(backend = %name, error = %e, "Backend failed with a non-transient error");
                    }
                    e.to_string()
                }
                Err(_) => format!("timed out after {}s", backend.timeout().as_secs_f64()),
            };

            warn!(backend = %name, reason = %reason, "Backend produced no candidate");
            events.push(RegistryEvent::Skipped {
                backend: name,
                reason,
            });
        }

        events.push(RegistryEvent::Exhausted { attempted });
        Dispatch {
            candidate: None,
            events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MockFixBackend;

    fn request() -> FixRequest {
        FixRequest::from_failure(
            &FailureRecord::new("mod_a.py", "test_add", "AssertionError: 1+1 != 3"),
            "",
        )
    }

    #[tokio::test]
    async fn test_first_non_empty_wins() {
        let empty = Arc::new(MockFixBackend::new("empty"));
        let good = Arc::new(MockFixBackend::new("good").with_patches(vec!["--- a\n+++ b\n"]));
        let never = Arc::new(MockFixBackend::new("never").with_patches(vec!["x"]));
        let registry = BackendRegistry::new()
            .with_backend(empty.clone())
            .with_backend(good.clone())
            .with_backend(never.clone());

        let dispatch = registry.generate(&request()).await;
        let candidate = dispatch.candidate.expect("candidate");
        assert_eq!(candidate.backend, "good");
        assert_eq!(empty.call_count(), 1);
        assert_eq!(never.call_count(), 0);
        assert!(dispatch
            .events
            .contains(&RegistryEvent::Selected { backend: "good".into() }));
    }

    #[tokio::test]
    async fn test_timeout_and_error_are_skipped() {
        let slow = Arc::new(
            MockFixBackend::new("slow")
                .with_patches(vec!["late"])
                .with_delay(Duration::from_millis(500))
                .with_timeout(Duration::from_millis(20)),
        );
        let broken = Arc::new(MockFixBackend::new("broken").with_error("connection refused"));
        let good = Arc::new(MockFixBackend::new("good").with_patches(vec!["patch"]));
        let registry = BackendRegistry::new()
            .with_backend(slow)
            .with_backend(broken)
            .with_backend(good);

        let dispatch = registry.generate(&request()).await;
        assert_eq!(dispatch.candidate.expect("candidate").backend, "good");
        let skipped: Vec<_> = dispatch
            .events
            .iter()
            .filter_map(|e| match e {
                RegistryEvent::Skipped { backend, reason } => Some((backend.as_str(), reason.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(skipped.len(), 2);
        assert!(skipped[0].1.contains("timed out"));
        assert!(skipped[1].1.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_all_empty_is_exhausted() {
        let registry = BackendRegistry::new()
            .with_backend(Arc::new(MockFixBackend::new("a")))
            .with_backend(Arc::new(MockFixBackend::new("b")));
        let dispatch = registry.generate(&request()).await;
        assert!(dispatch.candidate.is_none());
        assert_eq!(
            dispatch.events.last(),
            Some(&RegistryEvent::Exhausted {
                attempted: vec!["a".into(), "b".into()]
            })
        );
    }

    #[tokio::test]
    async fn test_refine_starts_with_previous_backend() {
        let first = Arc::new(MockFixBackend::new("first").with_patches(vec!["f1", "f2"]));
        let second = Arc::new(MockFixBackend::new("second").with_patches(vec!["s1", "s2"]));
        let registry = BackendRegistry::new()
            .with_backend(first.clone())
            .with_backend(second.clone());

        let previous = Candidate {
            backend: "second".into(),
            patch: "s1".into(),
        };
        let dispatch = registry.refine(&request(), &previous, "still failing").await;
        assert_eq!(dispatch.candidate.expect("candidate").backend, "second");
        assert_eq!(first.call_count(), 0);
        assert_eq!(
            second.last_request().and_then(|r| r.feedback),
            Some("still failing".to_string())
        );
    }

    #[test]
    fn test_failed_patches_capped() {
        let req = request().with_failed_patches(vec!["1".into(), "2".into(), "3".into(), "4".into()]);
        assert_eq!(req.failed_patches, vec!["2", "3", "4"]);
    }

    #[test]
    fn test_from_config_skips_disabled() {
        let mut config = ProjectConfig::default();
        config.backends.push(crate::config::BackendConfig::new("on", "true"));
        let mut off = crate::config::BackendConfig::new("off", "true");
        off.enabled = false;
        config.backends.push(off);

        let registry = BackendRegistry::from_config(&config, Path::new("."));
        assert_eq!(registry.names(), vec!["on"]);
    }
}
