//! Patch application and verification.
//!
//! A patch is resolved completely in memory before anything touches the
//! working tree. Only then are backups taken, files written, and the suite
//! re-run. A patch counts as verified when the suite passes, or when the
//! targeted failure is gone and the failure count did not grow. Anything
//! else rolls the touched files back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ensure_within_project, BackupReceipt, BackupStore, UnifiedPatch};
use crate::attempt::PatchAttempt;
use crate::error::Result;
use crate::parser::{FailureParser, FailureRecord};
use crate::rollback::{RollbackManager, RollbackResult};
use crate::runner::{TestRun, TestRunner};

/// Lines of test output kept as refinement feedback.
const FEEDBACK_TAIL_LINES: usize = 40;

/// Outcome of one apply + verify round.
#[derive(Debug, Clone, Default)]
pub struct Verification {
    /// Whether the attempt ended Verified.
    pub verified: bool,
    /// The verification run, if the patch got that far.
    pub run: Option<TestRun>,
    /// Failures parsed from the verification run.
    pub remaining_failures: Vec<FailureRecord>,
    /// Files the patch targeted.
    pub files: Vec<PathBuf>,
    /// Rollback performed after a failed verification.
    pub rollback: Option<RollbackResult>,
    /// Why verification failed (empty when verified).
    pub note: String,
}

impl Verification {
    fn rejected(note: impl Into<String>) -> Self {
        Self {
            note: note.into(),
            ..Self::default()
        }
    }

    /// Text handed back to a backend when asking for a refinement.
    #[must_use]
    pub fn feedback(&self) -> String {
        let mut out = self.note.clone();
        if let Some(run) = &self.run {
            let lines: Vec<&str> = run.output.lines().collect();
            let tail = &lines[lines.len().saturating_sub(FEEDBACK_TAIL_LINES)..];
            if !tail.is_empty() {
                out.push_str("\n\nTest output after applying the patch:\n");
                out.push_str(&tail.join("\n"));
            }
        }
        out
    }
}

/// New content per file, `None` meaning delete.
pub type PlannedWrites = BTreeMap<PathBuf, Option<String>>;

/// Applies candidate patches and verifies them against the suite.
pub struct PatchApplier {
    project_dir: PathBuf,
    runner: Arc<dyn TestRunner>,
    parser: FailureParser,
    rollback: RollbackManager,
}

impl PatchApplier {
    pub fn new(project_dir: impl AsRef<Path>, runner: Arc<dyn TestRunner>) -> Self {
        let project_dir = project_dir.as_ref().to_path_buf();
        Self {
            rollback: RollbackManager::new(&project_dir),
            project_dir,
            runner,
            parser: FailureParser::new(),
        }
    }

    /// Use a specific parser for verification runs.
    #[must_use]
    pub fn with_parser(mut self, parser: FailureParser) -> Self {
        self.parser = parser;
        self
    }

    /// Rollback manager sharing this applier's project directory.
    #[must_use]
    pub fn rollback(&self) -> &RollbackManager {
        &self.rollback
    }

    /// Parse the patch and compute every file's new content without writing.
    ///
    /// # Errors
    ///
    /// Any parse error, escaping path, or non-matching hunk.
    pub fn plan(&self, patch_text: &str) -> Result<(UnifiedPatch, PlannedWrites)> {
        let patch = UnifiedPatch::parse(patch_text)?;
        let mut planned = PlannedWrites::new();

        for file in &patch.files {
            let target = file.target().to_path_buf();
            ensure_within_project(&target)?;
            if let Some(old) = &file.old_path {
                ensure_within_project(old)?;
            }

            let current = match planned.get(&target) {
                Some(content) => content.clone(),
                None => self.read_current(&target)?,
            };
            let updated = file.apply_to(current.as_deref())?;
            planned.insert(target, updated);
        }

        Ok((patch, planned))
    }

    fn read_current(&self, path: &Path) -> Result<Option<String>> {
        match std::fs::read_to_string(self.project_dir.join(path)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_planned(&self, planned: &PlannedWrites) -> Result<()> {
        for (path, content) in planned {
            let absolute = self.project_dir.join(path);
            match content {
                Some(text) => {
                    if let Some(parent) = absolute.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&absolute, text)?;
                }
                None => {
                    if absolute.exists() {
                        std::fs::remove_file(&absolute)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply `attempt`'s patch, run the suite, and settle the attempt.
    ///
    /// `baseline_failures` is the failure count of the run that produced
    /// `target`. On return the attempt is Verified or Failed, and the working
    /// tree holds either the verified content or the pre-patch content.
    ///
    /// # Errors
    ///
    /// Only invariant violations are returned; everything else ends as a
    /// failed [`Verification`].
    pub async fn apply(
        &self,
        backups: &mut BackupStore,
        attempt: &mut PatchAttempt,
        target: &FailureRecord,
        baseline_failures: usize,
    ) -> Result<Verification> {
        let planned = match self.plan(&attempt.patch_text) {
            Ok((_, planned)) => planned,
            Err(e) => {
                if e.is_patch_error() {
                    debug!("Patch {} rejected before writing: {}", attempt.id, e);
                } else {
                    warn!("Could not plan patch {}: {}", attempt.id, e);
                }
                let note = format!("patch does not apply: {}", e);
                attempt.mark_failed(&note)?;
                return Ok(Verification::rejected(note));
            }
        };
        let files: Vec<PathBuf> = planned.keys().cloned().collect();

        let receipt = match backups.ensure_all(&files) {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!("Could not back up files for patch {}: {}", attempt.id, e);
                let rollback = self.rollback.restore_all(backups, &files);
                let note = format!("backup failed: {}", e);
                attempt.mark_failed(&note)?;
                return Ok(Verification {
                    files,
                    rollback: Some(rollback),
                    ..Verification::rejected(note)
                });
            }
        };

        attempt.mark_applied()?;
        if let Err(e) = self.write_planned(&planned) {
            warn!("Writing patch {} failed: {}", attempt.id, e);
            let rollback = self.rollback.restore_all(backups, receipt.files());
            let note = format!("write failed: {}", e);
            attempt.mark_failed(&note)?;
            return Ok(Verification {
                files,
                rollback: Some(rollback),
                ..Verification::rejected(note)
            });
        }
        info!(
            "Applied patch {} to {} file(s); verifying",
            attempt.id,
            files.len()
        );

        let run = self.runner.run().await;
        self.settle(backups, attempt, target, baseline_failures, receipt, run)
    }

    fn settle(
        &self,
        backups: &mut BackupStore,
        attempt: &mut PatchAttempt,
        target: &FailureRecord,
        baseline_failures: usize,
        receipt: BackupReceipt,
        run: TestRun,
    ) -> Result<Verification> {
        let remaining = if run.passed {
            Vec::new()
        } else {
            self.parser.parse(&run.output)
        };

        let verdict = judge(&run, &remaining, target, baseline_failures);
        let files = receipt.files().to_vec();

        match verdict {
            Ok(()) => {
                attempt.mark_verified(&receipt)?;
                backups.commit(receipt.files());
                info!(
                    "Patch {} verified ({} failure(s) remain)",
                    attempt.id,
                    remaining.len()
                );
                Ok(Verification {
                    verified: true,
                    run: Some(run),
                    remaining_failures: remaining,
                    files,
                    rollback: None,
                    note: String::new(),
                })
            }
            Err(note) => {
                info!("Patch {} failed verification: {}", attempt.id, note);
                let rollback = self.rollback.restore_all(backups, receipt.files());
                attempt.mark_failed(&note)?;
                Ok(Verification {
                    verified: false,
                    run: Some(run),
                    remaining_failures: remaining,
                    files,
                    rollback: Some(rollback),
                    note,
                })
            }
        }
    }
}

/// Decide whether a verification run counts as a fix for `target`.
fn judge(
    run: &TestRun,
    remaining: &[FailureRecord],
    target: &FailureRecord,
    baseline_failures: usize,
) -> std::result::Result<(), String> {
    if run.passed {
        return Ok(());
    }
    if run.timed_out {
        return Err("test suite timed out".to_string());
    }
    // A failing run we cannot parse may be a broken build; never accept it.
    if remaining.is_empty() {
        return Err("test suite failed without parseable failures".to_string());
    }
    if remaining.iter().any(|r| r.same_test(target)) {
        return Err(format!("{} still fails", target.test_name));
    }
    if remaining.len() > baseline_failures {
        return Err(format!(
            "failure count grew from {} to {}",
            baseline_failures,
            remaining.len()
        ));
    }
    Ok(())
}

impl std::fmt::Debug for PatchApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchApplier")
            .field("project_dir", &self.project_dir)
            .field("runner", &self.runner.describe())
            .finish()
    }
}
