//! Patch attempts and their lifecycle.
//!
//! ```text
//! Pending ──apply──> Applied ──verify──> Verified
//!    │                  │
//!    └──────────────────┴────fail──────> Failed
//! ```
//!
//! Verified and Failed are terminal; any further transition is rejected.
//! Marking an attempt Verified requires a [`BackupReceipt`] so that no
//! patch can be verified unless its files were backed up first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MenderError, Result};
use crate::patch::backup::BackupReceipt;
use crate::signature::ErrorSignature;

/// Where an attempt is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOutcome {
    /// Generated, not yet applied.
    Pending,
    /// Written to the working tree, awaiting verification.
    Applied,
    /// Verification passed.
    Verified,
    /// Did not apply, did not verify, or was rejected by the gate.
    Failed,
}

impl PatchOutcome {
    /// Whether the outcome can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Failed)
    }
}

impl std::fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Applied => write!(f, "applied"),
            Self::Verified => write!(f, "verified"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One candidate patch for one signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchAttempt {
    /// Unique id of this attempt.
    pub id: String,
    /// Signature the patch targets.
    pub signature: ErrorSignature,
    /// Unified diff text.
    pub patch_text: String,
    /// Confidence assigned by the confidence manager, in [0, 1].
    pub confidence: f64,
    /// Why the confidence is what it is, plus any failure notes.
    pub reason: String,
    /// Current lifecycle state.
    pub outcome: PatchOutcome,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Session that produced the attempt.
    #[serde(default)]
    pub session_id: String,
    /// Backend that produced the patch (or "learning-store" for replays).
    #[serde(default)]
    pub backend: String,
}

impl PatchAttempt {
    /// Create a pending attempt.
    pub fn new(
        signature: ErrorSignature,
        patch_text: impl Into<String>,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            signature,
            patch_text: patch_text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            reason: reason.into(),
            outcome: PatchOutcome::Pending,
            timestamp: Utc::now(),
            session_id: String::new(),
            backend: String::new(),
        }
    }

    /// Tag the attempt with its session.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Tag the attempt with the backend that produced it.
    #[must_use]
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    fn ensure_mutable(&self, target: PatchOutcome) -> Result<()> {
        if self.outcome.is_terminal() {
            return Err(MenderError::invariant(format!(
                "attempt {} is already {}, cannot become {}",
                self.id, self.outcome, target
            )));
        }
        Ok(())
    }

    /// Pending → Applied.
    ///
    /// # Errors
    ///
    /// Fails if the attempt is not pending.
    pub fn mark_applied(&mut self) -> Result<()> {
        if self.outcome != PatchOutcome::Pending {
            return Err(MenderError::invariant(format!(
                "attempt {} is {}, only pending attempts can be applied",
                self.id, self.outcome
            )));
        }
        self.outcome = PatchOutcome::Applied;
        Ok(())
    }

    /// Applied → Verified, given proof that its files were backed up.
    ///
    /// # Errors
    ///
    /// Fails if the attempt was never applied, is already terminal, or the
    /// receipt covers no files.
    pub fn mark_verified(&mut self, receipt: &BackupReceipt) -> Result<()> {
        self.ensure_mutable(PatchOutcome::Verified)?;
        if self.outcome != PatchOutcome::Applied {
            return Err(MenderError::invariant(format!(
                "attempt {} must be applied before it can be verified",
                self.id
            )));
        }
        if receipt.is_empty() {
            return Err(MenderError::invariant(format!(
                "attempt {} has no backup; refusing to mark verified",
                self.id
            )));
        }
        self.outcome = PatchOutcome::Verified;
        Ok(())
    }

    /// Pending/Applied → Failed, appending a note to the reason.
    ///
    /// # Errors
    ///
    /// Fails if the attempt is already terminal.
    pub fn mark_failed(&mut self, note: impl AsRef<str>) -> Result<()> {
        self.ensure_mutable(PatchOutcome::Failed)?;
        let note = note.as_ref();
        if !note.is_empty() {
            if self.reason.is_empty() {
                self.reason = note.to_string();
            } else {
                self.reason = format!("{}; {}", self.reason, note);
            }
        }
        self.outcome = PatchOutcome::Failed;
        Ok(())
    }
}
