//! Session reports.
//!
//! A [`SessionReport`] is opened when a debugging session starts, collects
//! every failure seen, every patch attempt, every backend event and every
//! anomaly along the way, and is finalized with a terminal status. The
//! finished report is the audit artifact handed to whatever reporting or
//! notification tooling sits downstream.
//!
//! # Layout
//!
//! ```text
//! .mender/reports/
//!   ├── <session-id>.json
//!   └── latest.json
//! ```

pub mod persistence;

pub use persistence::ReportStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::attempt::{PatchAttempt, PatchOutcome};
use crate::backend::RegistryEvent;
use crate::parser::FailureRecord;
use crate::signature::ErrorSignature;

/// Current schema version for session reports.
pub const SESSION_REPORT_VERSION: u32 = 1;

fn current_version() -> u32 {
    SESSION_REPORT_VERSION
}

/// Where the session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    /// The suite passes.
    Success,
    /// Failures remain; see `manual_review`.
    PartialFailure,
}

impl SessionStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::PartialFailure => write!(f, "partial failure"),
        }
    }
}

/// Why a failure was handed to a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// The suite failed but no failure could be parsed.
    Undiagnosable,
    /// No backend produced a candidate.
    NoCandidate,
    /// Attempts or refinements ran out.
    Exhausted,
    /// The session was cancelled before the failure was resolved.
    Cancelled,
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undiagnosable => write!(f, "undiagnosable"),
            Self::NoCandidate => write!(f, "no candidate"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A signature that needs manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    /// `None` for undiagnosable runs, which have no failure to sign.
    pub signature: Option<ErrorSignature>,
    #[serde(default)]
    pub source_file: Option<PathBuf>,
    #[serde(default)]
    pub test_name: Option<String>,
    pub reason: EscalationReason,
}

impl Escalation {
    #[must_use]
    pub fn for_failure(
        signature: &ErrorSignature,
        failure: &FailureRecord,
        reason: EscalationReason,
    ) -> Self {
        Self {
            signature: Some(signature.clone()),
            source_file: Some(failure.source_file.clone()),
            test_name: Some(failure.test_name.clone()),
            reason,
        }
    }

    #[must_use]
    pub fn undiagnosable() -> Self {
        Self {
            signature: None,
            source_file: None,
            test_name: None,
            reason: EscalationReason::Undiagnosable,
        }
    }
}

/// A failure observed in a given cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedFailure {
    pub cycle: u32,
    pub signature: ErrorSignature,
    pub failure: FailureRecord,
}

/// A registry event tagged with the signature it served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendEvent {
    pub signature: ErrorSignature,
    pub event: RegistryEvent,
}

/// Audit record of one debugging session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    #[serde(default = "current_version")]
    pub version: u32,
    pub id: String,
    pub project_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    #[serde(default)]
    pub cancelled: bool,
    /// Full-suite runs performed.
    #[serde(default)]
    pub cycles: u32,
    #[serde(default)]
    pub failures_seen: Vec<ObservedFailure>,
    #[serde(default)]
    pub attempts: Vec<PatchAttempt>,
    #[serde(default)]
    pub manual_review: Vec<Escalation>,
    #[serde(default)]
    pub anomalies: Vec<String>,
    #[serde(default)]
    pub backend_events: Vec<BackendEvent>,
}

impl SessionReport {
    /// Open a report for a new session.
    #[must_use]
    pub fn new(project_dir: &Path) -> Self {
        Self {
            version: SESSION_REPORT_VERSION,
            id: Uuid::new_v4().to_string(),
            project_dir: project_dir.to_path_buf(),
            started_at: Utc::now(),
            ended_at: None,
            status: SessionStatus::Running,
            cancelled: false,
            cycles: 0,
            failures_seen: Vec::new(),
            attempts: Vec::new(),
            manual_review: Vec::new(),
            anomalies: Vec::new(),
            backend_events: Vec::new(),
        }
    }

    pub fn record_failure(&mut self, cycle: u32, signature: &ErrorSignature, failure: &FailureRecord) {
        self.failures_seen.push(ObservedFailure {
            cycle,
            signature: signature.clone(),
            failure: failure.clone(),
        });
    }

    pub fn record_attempt(&mut self, attempt: PatchAttempt) {
        self.attempts.push(attempt);
    }

    pub fn record_events(&mut self, signature: &ErrorSignature, events: Vec<RegistryEvent>) {
        self.backend_events.extend(events.into_iter().map(|event| BackendEvent {
            signature: signature.clone(),
            event,
        }));
    }

    pub fn add_anomaly(&mut self, anomaly: impl Into<String>) {
        self.anomalies.push(anomaly.into());
    }

    /// Escalate, replacing any earlier escalation of the same signature.
    pub fn escalate(&mut self, escalation: Escalation) {
        self.manual_review
            .retain(|e| e.signature.is_none() || e.signature != escalation.signature);
        self.manual_review.push(escalation);
    }

    /// Drop the escalation for `signature`, e.g. once it has been fixed.
    pub fn resolve(&mut self, signature: &ErrorSignature) {
        self.manual_review
            .retain(|e| e.signature.as_ref() != Some(signature));
    }

    /// Finalize with a terminal status.
    pub fn finish(&mut self, status: SessionStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    #[must_use]
    pub fn verified_count(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.outcome == PatchOutcome::Verified)
            .count()
    }

    /// Distinct signatures observed, in first-seen order.
    #[must_use]
    pub fn signatures_seen(&self) -> Vec<&ErrorSignature> {
        let mut out: Vec<&ErrorSignature> = Vec::new();
        for observed in &self.failures_seen {
            if !out.contains(&&observed.signature) {
                out.push(&observed.signature);
            }
        }
        out
    }

    /// One-paragraph summary for the terminal.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Session {} ended in {} after {} cycle(s): {} signature(s) seen, {} attempt(s), {} verified.",
            &self.id[..8.min(self.id.len())],
            self.status,
            self.cycles,
            self.signatures_seen().len(),
            self.attempts.len(),
            self.verified_count()
        );
        if self.cancelled {
            out.push_str(" Cancelled; all unverified changes were rolled back.");
        }
        if !self.manual_review.is_empty() {
            out.push_str(&format!(
                " {} item(s) need manual review.",
                self.manual_review.len()
            ));
        }
        if !self.anomalies.is_empty() {
            out.push_str(&format!(" {} anomaly(ies) logged.", self.anomalies.len()));
        }
        out
    }
}
