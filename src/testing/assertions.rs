//! Custom assertions for patch attempts and session reports.

use std::path::Path;

use crate::attempt::{PatchAttempt, PatchOutcome};
use crate::session::{EscalationReason, SessionReport, SessionStatus};

/// Assert that an attempt reached `expected`.
///
/// # Panics
///
/// Panics with the attempt's reason if the outcome differs.
pub fn assert_outcome(attempt: &PatchAttempt, expected: PatchOutcome) {
    assert_eq!(
        attempt.outcome, expected,
        "Expected attempt {} to be {}, but it is {}.\nReason: {}",
        attempt.id, expected, attempt.outcome, attempt.reason
    );
}

/// Assert that a file under `root` has exactly `expected` as content.
///
/// # Panics
///
/// Panics if the file is unreadable or differs.
pub fn assert_file_content(root: &Path, relative: &str, expected: &str) {
    let actual = std::fs::read_to_string(root.join(relative))
        .unwrap_or_else(|e| panic!("Expected {relative} to be readable: {e}"));
    assert_eq!(actual, expected, "Unexpected content in {relative}");
}

/// Assert the report's terminal status.
///
/// # Panics
///
/// Panics with the report summary if the status differs.
pub fn assert_status(report: &SessionReport, expected: SessionStatus) {
    assert_eq!(
        report.status,
        expected,
        "Unexpected session status.\nSummary: {}\nAnomalies: {:?}",
        report.summary(),
        report.anomalies
    );
}

/// Assert that some failure was escalated for `reason`.
///
/// # Panics
///
/// Panics if no escalation carries that reason.
pub fn assert_escalated(report: &SessionReport, reason: EscalationReason) {
    assert!(
        report.manual_review.iter().any(|e| e.reason == reason),
        "Expected an escalation for {reason}, got {:?}",
        report.manual_review
    );
}

/// Assert that no anomalies were logged.
///
/// # Panics
///
/// Panics listing the anomalies otherwise.
pub fn assert_no_anomalies(report: &SessionReport) {
    assert!(
        report.anomalies.is_empty(),
        "Expected no anomalies, got {:?}",
        report.anomalies
    );
}
