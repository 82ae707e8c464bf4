//! The retry loop.
//!
//! One [`Orchestrator`] drives one session: run the suite, parse failures,
//! and for each failure try a known fix, then generated candidates, each
//! gated by the confidence manager and verified against the suite. Every
//! cycle that verifies something re-runs the suite; a cycle that verifies
//! nothing ends the session.
//!
//! # Example
//!
//! ```rust,ignore
//! use mender::config::ProjectConfig;
//! use mender::orchestrator::Orchestrator;
//!
//! let config = ProjectConfig::load(&project_dir)?;
//! let report = Orchestrator::from_config(&project_dir, config)
//!     .run_until(async { let _ = tokio::signal::ctrl_c().await; })
//!     .await?;
//! println!("{}", report.summary());
//! ```

pub mod ledger;
pub mod state;

pub use ledger::{LedgerEntry, SignatureLedger};
pub use state::{LoopState, Outcome};

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::attempt::PatchAttempt;
use crate::backend::{BackendRegistry, Candidate, FixRequest};
use crate::confidence::ConfidenceManager;
use crate::config::ProjectConfig;
use crate::error::Result;
use crate::parser::{FailureParser, FailureRecord};
use crate::patch::{BackupStore, PatchApplier, Verification};
use crate::rollback::RollbackResult;
use crate::runner::{CommandTestRunner, TestRunner};
use crate::session::{Escalation, EscalationReason, ReportStore, SessionReport, SessionStatus};
use crate::signature::{signature_for, ErrorSignature};
use crate::store::LearningStore;

/// Backend name recorded on replayed fixes.
pub const LEARNING_STORE_BACKEND: &str = "learning-store";

/// A failure with its signature and the context that produced it.
#[derive(Debug, Clone)]
struct Diagnosed {
    signature: ErrorSignature,
    context: String,
    failure: FailureRecord,
}

/// Drives one debugging session.
pub struct Orchestrator {
    project_dir: PathBuf,
    config: ProjectConfig,
    runner: Arc<dyn TestRunner>,
    parser: FailureParser,
    registry: BackendRegistry,
    confidence: ConfidenceManager,
    applier: PatchApplier,
    store: LearningStore,
    reports: Option<ReportStore>,
    backups: BackupStore,
    ledger: SignatureLedger,
    state: LoopState,
    outstanding: Vec<Diagnosed>,
    report: SessionReport,
}

impl Orchestrator {
    /// Build an orchestrator from explicit collaborators.
    ///
    /// The learning store and report directory default to the locations
    /// derived from `config`.
    pub fn new(
        project_dir: impl AsRef<Path>,
        config: ProjectConfig,
        runner: Arc<dyn TestRunner>,
        registry: BackendRegistry,
    ) -> Self {
        let project_dir = project_dir.as_ref().to_path_buf();
        let store = LearningStore::open(config.learning_dir(&project_dir));
        let reports = ReportStore::new(ProjectConfig::reports_dir(&project_dir));
        let parser = FailureParser::new();
        Self {
            applier: PatchApplier::new(&project_dir, Arc::clone(&runner)).with_parser(parser.clone()),
            parser,
            confidence: ConfidenceManager::new(config.limits.retry_threshold),
            backups: BackupStore::new(&project_dir),
            ledger: SignatureLedger::new(),
            state: LoopState::Idle,
            outstanding: Vec::new(),
            report: SessionReport::new(&project_dir),
            reports: Some(reports),
            store,
            runner,
            registry,
            config,
            project_dir,
        }
    }

    /// Build the runner and backends from settings.
    pub fn from_config(project_dir: impl AsRef<Path>, config: ProjectConfig) -> Self {
        let project_dir = project_dir.as_ref();
        let runner: Arc<dyn TestRunner> = Arc::new(CommandTestRunner::new(
            &config.test.command,
            project_dir,
            config.test.timeout(),
        ));
        let registry = BackendRegistry::from_config(&config, project_dir);
        Self::new(project_dir, config, runner, registry)
    }

    /// Use a specific learning store.
    #[must_use]
    pub fn with_store(mut self, store: LearningStore) -> Self {
        self.store = store;
        self
    }

    /// Write the finished report somewhere else, or nowhere.
    #[must_use]
    pub fn with_report_store(mut self, reports: Option<ReportStore>) -> Self {
        self.reports = reports;
        self
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.report.id
    }

    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state
    }

    #[must_use]
    pub fn ledger(&self) -> &SignatureLedger {
        &self.ledger
    }

    /// Run the session to completion.
    ///
    /// # Errors
    ///
    /// Only invariant violations in attempt bookkeeping abort a session.
    pub async fn run(self) -> Result<SessionReport> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run the session, rolling back and stopping early if `shutdown`
    /// completes first.
    ///
    /// # Errors
    ///
    /// Only invariant violations in attempt bookkeeping abort a session.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<SessionReport>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Starting session {} in {}",
            self.report.id,
            self.project_dir.display()
        );

        let finished = {
            let drive = self.drive();
            tokio::pin!(shutdown);
            tokio::select! {
                result = drive => Some(result),
                () = &mut shutdown => None,
            }
        };

        let outcome = match finished {
            Some(Ok(outcome)) => outcome,
            Some(Err(e)) => {
                warn!("Session aborted: {}", e);
                self.report.add_anomaly(format!("session aborted: {e}"));
                if e.requires_human() {
                    self.report
                        .add_anomaly("working tree needs manual inspection after an aborted session");
                }
                self.finish(Outcome::PartialFailure);
                return Err(e);
            }
            None => self.cancel(),
        };

        self.finish(outcome);
        Ok(self.report)
    }

    // =========================================================================
    // Cycle control
    // =========================================================================

    async fn drive(&mut self) -> Result<Outcome> {
        self.transition(LoopState::Running);
        let max_cycles = self.config.limits.max_retry_cycles;

        loop {
            self.report.cycles += 1;
            let cycle = self.report.cycles;
            let run = self.runner.run().await;

            if run.passed {
                info!("Test suite passes (cycle {})", cycle);
                self.outstanding.clear();
                self.transition(LoopState::AllPassed);
                return Ok(Outcome::Success);
            }

            self.transition(LoopState::Diagnosing);
            let failures = self.parser.parse(&run.output);
            if failures.is_empty() {
                warn!("Test suite failed but no failures could be parsed");
                self.outstanding.clear();
                self.report.escalate(Escalation::undiagnosable());
                return Ok(Outcome::PartialFailure);
            }

            self.outstanding = failures.iter().map(|f| self.diagnose(f)).collect();
            for d in &self.outstanding {
                self.report.record_failure(cycle, &d.signature, &d.failure);
            }

            if cycle > max_cycles {
                info!(
                    "Retry cycle budget ({}) spent with {} failure(s) outstanding",
                    max_cycles,
                    failures.len()
                );
                self.escalate_outstanding(EscalationReason::Exhausted);
                return Ok(Outcome::PartialFailure);
            }

            info!("Cycle {}: {} failure(s) to work on", cycle, failures.len());
            let progressed = self.work_cycle().await?;
            if !progressed {
                info!("No patch verified in cycle {}; stopping", cycle);
                self.escalate_outstanding(EscalationReason::Exhausted);
                return Ok(Outcome::PartialFailure);
            }
            self.transition(LoopState::Running);
        }
    }

    /// Work every outstanding failure once. Returns whether any verified.
    async fn work_cycle(&mut self) -> Result<bool> {
        let mut baseline = self.outstanding.len();
        let mut latest_remaining: Option<Vec<FailureRecord>> = None;
        let mut progressed = false;
        let queue = self.outstanding.clone();

        for diagnosed in &queue {
            if let Some(remaining) = &latest_remaining {
                if !remaining.iter().any(|r| r.same_test(&diagnosed.failure)) {
                    debug!(
                        "{} no longer fails; skipping",
                        diagnosed.failure.summary()
                    );
                    self.resolve(&diagnosed.signature);
                    continue;
                }
            }

            self.transition(LoopState::Diagnosing);
            if let Some(verification) = self.work_failure(diagnosed, baseline).await? {
                progressed = true;
                baseline = verification.remaining_failures.len();
                latest_remaining = Some(verification.remaining_failures);
                self.resolve(&diagnosed.signature);
            }
        }
        Ok(progressed)
    }

    fn diagnose(&self, failure: &FailureRecord) -> Diagnosed {
        let (signature, context) = signature_for(
            &self.project_dir,
            failure,
            self.config.context.radius_lines,
            self.config.context.max_bytes,
        );
        debug!("{} -> {}", failure.summary(), signature.short());
        Diagnosed {
            signature,
            context,
            failure: failure.clone(),
        }
    }

    // =========================================================================
    // Per-failure procedure
    // =========================================================================

    /// Try to fix one failure. Returns the verification that fixed it.
    async fn work_failure(
        &mut self,
        diagnosed: &Diagnosed,
        baseline: usize,
    ) -> Result<Option<Verification>> {
        let sig = &diagnosed.signature;
        if self.ledger.is_exhausted(sig) {
            debug!("{} already exhausted this session", sig.short());
            return Ok(None);
        }

        let max_attempts = self.config.limits.max_attempts as usize;
        let on_record = self.store.attempts_since_success(sig);
        if on_record >= max_attempts {
            info!(
                "{} already has {} unverified attempt(s) on record",
                sig.short(),
                on_record
            );
            self.exhaust(diagnosed);
            return Ok(None);
        }

        if let Some(verification) = self.replay_known_fix(diagnosed, baseline).await? {
            return Ok(Some(verification));
        }

        let request = FixRequest::from_failure(&diagnosed.failure, &diagnosed.context)
            .with_failed_patches(self.store.failed_patches(sig));
        let modification_limit = self.config.limits.modification_limit;
        let mut previous: Option<(Candidate, String)> = None;
        self.confidence.recall(&self.store, sig);

        loop {
            let attempts = self.store.attempts_since_success(sig);
            if attempts >= max_attempts {
                info!("{} reached {} attempt(s)", sig.short(), attempts);
                break;
            }

            let dispatch = match &previous {
                None => self.registry.generate(&request).await,
                Some((candidate, feedback)) => {
                    if self.ledger.modifications(sig) >= modification_limit {
                        info!("{} reached the refinement limit", sig.short());
                        break;
                    }
                    self.ledger.record_modification(sig);
                    self.registry.refine(&request, candidate, feedback).await
                }
            };
            self.report.record_events(sig, dispatch.events);

            let Some(candidate) = dispatch.candidate else {
                if previous.is_none() {
                    info!("No backend produced a candidate for {}", sig.short());
                    self.report.escalate(Escalation::for_failure(
                        sig,
                        &diagnosed.failure,
                        EscalationReason::NoCandidate,
                    ));
                    return Ok(None);
                }
                break;
            };

            let assessment = self.confidence.score(
                &self.store,
                sig,
                &candidate.patch,
                Some(&diagnosed.failure.source_file),
            );
            let decision = self.confidence.decide_retry(sig, assessment.confidence);
            let mut attempt = PatchAttempt::new(
                sig.clone(),
                candidate.patch.clone(),
                assessment.confidence,
                assessment.reason,
            )
            .with_session(self.report.id.clone())
            .with_backend(candidate.backend.clone());

            if let Some(rejection) = decision.rejection(assessment.confidence) {
                debug!("Rejected candidate from {}: {}", candidate.backend, rejection);
                attempt.mark_failed(&rejection)?;
                self.report.record_attempt(attempt);
                self.transition(LoopState::RetryNeeded);
                previous = Some((candidate, rejection));
                continue;
            }
            self.ledger.record_accepted(sig, assessment.confidence);

            let verification = self
                .apply_and_verify(sig, &mut attempt, &diagnosed.failure, baseline)
                .await?;
            if verification.verified {
                return Ok(Some(verification));
            }
            previous = Some((candidate, verification.feedback()));
        }

        self.exhaust(diagnosed);
        Ok(None)
    }

    /// Re-apply the most recent stored fix for this signature, once per session.
    async fn replay_known_fix(
        &mut self,
        diagnosed: &Diagnosed,
        baseline: usize,
    ) -> Result<Option<Verification>> {
        let sig = &diagnosed.signature;
        if self.ledger.replayed(sig) {
            return Ok(None);
        }
        let Some(known) = self.store.latest_success(sig) else {
            return Ok(None);
        };
        self.ledger.mark_replayed(sig);
        info!("Replaying known fix for {}", sig.short());

        let mut attempt = PatchAttempt::new(
            sig.clone(),
            known.patch_text,
            known.confidence,
            format!("known fix from attempt {}", known.id),
        )
        .with_session(self.report.id.clone())
        .with_backend(LEARNING_STORE_BACKEND);

        let verification = self
            .apply_and_verify(sig, &mut attempt, &diagnosed.failure, baseline)
            .await?;
        Ok(verification.verified.then_some(verification))
    }

    async fn apply_and_verify(
        &mut self,
        sig: &ErrorSignature,
        attempt: &mut PatchAttempt,
        failure: &FailureRecord,
        baseline: usize,
    ) -> Result<Verification> {
        self.transition(LoopState::Patching);
        self.transition(LoopState::Verifying);
        let verification = self
            .applier
            .apply(&mut self.backups, attempt, failure, baseline)
            .await?;

        self.ledger.touch(sig, &verification.files);
        if let Some(rollback) = &verification.rollback {
            self.note_rollback(rollback);
        }

        let stored = if verification.verified {
            self.transition(LoopState::Succeeded);
            self.store.record_success(attempt)
        } else {
            self.transition(LoopState::RetryNeeded);
            self.store.record_failure(attempt)
        };
        if let Err(e) = stored {
            warn!("Could not record attempt {}: {}", attempt.id, e);
            self.report
                .add_anomaly(format!("could not record attempt {}: {e}", attempt.id));
        }

        self.report.record_attempt(attempt.clone());
        Ok(verification)
    }

    fn exhaust(&mut self, diagnosed: &Diagnosed) {
        let sig = &diagnosed.signature;
        info!("{} exhausted; escalating for manual review", sig.short());
        self.transition(LoopState::Exhausted);
        self.transition(LoopState::RollingBack);

        let live: Vec<PathBuf> = self
            .ledger
            .touched(sig)
            .into_iter()
            .filter(|p| self.backups.is_live(p))
            .collect();
        if !live.is_empty() {
            let result = self.applier.rollback().restore_all(&mut self.backups, &live);
            self.note_rollback(&result);
        }

        self.ledger.mark_exhausted(sig);
        self.report.escalate(Escalation::for_failure(
            sig,
            &diagnosed.failure,
            EscalationReason::Exhausted,
        ));
    }

    // =========================================================================
    // Termination
    // =========================================================================

    fn cancel(&mut self) -> Outcome {
        warn!("Session {} cancelled; rolling back", self.report.id);
        self.report.cancelled = true;
        self.escalate_outstanding(EscalationReason::Cancelled);
        Outcome::PartialFailure
    }

    fn finish(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => {
                if !self.backups.is_empty() {
                    debug!("Discarding {} backup(s)", self.backups.len());
                }
                self.backups.clear();
            }
            Outcome::PartialFailure => self.rollback_everything(),
        }
        self.transition(LoopState::Terminal(outcome));

        for anomaly in self.store.take_anomalies() {
            self.report.add_anomaly(anomaly);
        }
        self.report.finish(SessionStatus::from(outcome));
        info!("{}", self.report.summary());

        if let Some(reports) = &self.reports {
            if let Err(e) = reports.save(&self.report) {
                warn!("Could not save session report: {}", e);
            }
        }
    }

    fn rollback_everything(&mut self) {
        self.transition(LoopState::RollingBack);
        let result = self.applier.rollback().restore_everything(&mut self.backups);
        if !result.restored.is_empty() {
            info!("Final rollback: {}", result.summary());
        }
        self.note_rollback(&result);
    }

    fn escalate_outstanding(&mut self, reason: EscalationReason) {
        let pending: Vec<Escalation> = self
            .outstanding
            .iter()
            .filter(|d| {
                !self
                    .report
                    .manual_review
                    .iter()
                    .any(|e| e.signature.as_ref() == Some(&d.signature))
            })
            .map(|d| Escalation::for_failure(&d.signature, &d.failure, reason))
            .collect();
        for escalation in pending {
            self.report.escalate(escalation);
        }
    }

    fn resolve(&mut self, sig: &ErrorSignature) {
        self.outstanding.retain(|d| &d.signature != sig);
        self.report.resolve(sig);
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    fn transition(&mut self, next: LoopState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(&next) {
            let anomaly = format!("illegal transition {} -> {}", self.state, next);
            warn!("{}", anomaly);
            self.report.add_anomaly(anomaly);
        }
        debug!("{} -> {}", self.state, next);
        self.state = next;
    }

    fn note_rollback(&mut self, result: &RollbackResult) {
        for path in &result.missing {
            let anomaly = format!("no backup to restore for {}", path.display());
            warn!("{}", anomaly);
            self.report.add_anomaly(anomaly);
        }
        for (path, message) in &result.failed {
            let anomaly = format!("restore of {} failed: {}", path.display(), message);
            warn!("{}", anomaly);
            self.report.add_anomaly(anomaly);
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("project_dir", &self.project_dir)
            .field("session", &self.report.id)
            .field("state", &self.state)
            .field("runner", &self.runner.describe())
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::PatchOutcome;
    use crate::runner::TestRun;
    use crate::testing::{
        assert_escalated, assert_file_content, assert_no_anomalies, assert_status, MockFixBackend,
        ScriptedTestRunner, TestFixture, ADD_FAILURE, FIX_ADD, FIX_MUL, STALE_PATCH,
    };
    use std::time::Duration;

    fn orchestrator(
        fixture: &TestFixture,
        runner: Arc<dyn TestRunner>,
        backends: Vec<Arc<MockFixBackend>>,
    ) -> Orchestrator {
        let mut registry = BackendRegistry::new();
        for backend in backends {
            registry.push(backend);
        }
        Orchestrator::new(fixture.path(), ProjectConfig::default(), runner, registry)
    }

    fn orchestrator_with(
        fixture: &TestFixture,
        config: ProjectConfig,
        runner: Arc<dyn TestRunner>,
        backend: Arc<MockFixBackend>,
    ) -> Orchestrator {
        Orchestrator::new(fixture.path(), config, runner, BackendRegistry::new().with_backend(backend))
    }

    const WRONG_ADD: &str = "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return a * b\n";

    #[tokio::test]
    async fn test_passing_suite_is_success_without_backends() {
        let fixture = TestFixture::broken_calculator();
        let runner = Arc::new(ScriptedTestRunner::new(vec![TestRun::pass("2 passed")]));
        let report = orchestrator(&fixture, runner, vec![]).run().await.expect("run");

        assert_status(&report, SessionStatus::Success);
        assert_eq!(report.cycles, 1);
        assert!(report.attempts.is_empty());
        assert_no_anomalies(&report);
    }

    #[tokio::test]
    async fn test_fixes_both_failures_in_one_cycle() {
        let fixture = TestFixture::broken_calculator();
        let backend = Arc::new(MockFixBackend::new("model").with_patches(vec![FIX_ADD, FIX_MUL]));
        let report = orchestrator(&fixture, Arc::new(fixture.runner()), vec![backend.clone()])
            .run()
            .await
            .expect("run");

        assert_status(&report, SessionStatus::Success);
        assert_eq!(report.verified_count(), 2);
        assert_eq!(report.cycles, 2);
        assert!(report.manual_review.is_empty());
        assert_no_anomalies(&report);
        assert_file_content(
            fixture.path(),
            "calc.py",
            "def add(a, b):\n    return a + b\n\ndef mul(a, b):\n    return a * b\n",
        );

        let store = LearningStore::open(ProjectConfig::default().learning_dir(fixture.path()));
        for attempt in &report.attempts {
            assert!(store.latest_success(&attempt.signature).is_some());
        }
        let saved = ReportStore::new(ProjectConfig::reports_dir(fixture.path()));
        assert_eq!(saved.load_latest().map(|r| r.id), Some(report.id.clone()));
    }

    #[tokio::test]
    async fn test_first_backend_empty_second_wins() {
        let fixture = TestFixture::broken_calculator();
        let runner = Arc::new(ScriptedTestRunner::new(vec![
            TestRun::fail(ADD_FAILURE),
            TestRun::pass("1 passed"),
        ]));
        let empty = Arc::new(MockFixBackend::new("empty"));
        let good = Arc::new(MockFixBackend::new("good").with_patches(vec![FIX_ADD]));
        let report = orchestrator(&fixture, runner, vec![empty.clone(), good])
            .run()
            .await
            .expect("run");

        assert_status(&report, SessionStatus::Success);
        assert_eq!(empty.call_count(), 1);
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.attempts[0].outcome, PatchOutcome::Verified);
        assert_eq!(report.attempts[0].backend, "good");
    }

    #[tokio::test]
    async fn test_no_candidate_escalates_and_restores_nothing() {
        let fixture = TestFixture::broken_calculator();
        let runner = Arc::new(ScriptedTestRunner::new(vec![TestRun::fail(ADD_FAILURE)]));
        let report = orchestrator(&fixture, runner, vec![Arc::new(MockFixBackend::new("empty"))])
            .run()
            .await
            .expect("run");

        assert_status(&report, SessionStatus::PartialFailure);
        assert_escalated(&report, EscalationReason::NoCandidate);
        assert_file_content(fixture.path(), "calc.py", TestFixture::calc_content());
    }

    #[tokio::test]
    async fn test_unparseable_failure_is_undiagnosable() {
        let fixture = TestFixture::broken_calculator();
        let runner = Arc::new(ScriptedTestRunner::new(vec![TestRun::fail("Segmentation fault")]));
        let backend = Arc::new(MockFixBackend::new("model").with_patches(vec![FIX_ADD]));
        let report = orchestrator(&fixture, runner, vec![backend.clone()])
            .run()
            .await
            .expect("run");

        assert_status(&report, SessionStatus::PartialFailure);
        assert_escalated(&report, EscalationReason::Undiagnosable);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failing_patches_exhaust_and_restore_baseline() {
        let fixture = TestFixture::broken_calculator();
        let runner = Arc::new(ScriptedTestRunner::new(vec![TestRun::fail(ADD_FAILURE)]));
        let wrong = "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return a * b\n";
        let wronger = "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,3 @@\n def add(a, b):\n-    return a - b\n+    b = b\n+    return a * b\n";
        let backend = Arc::new(MockFixBackend::new("model").with_patches(vec![
            wrong, wrong, wronger, wrong, wrong, wrong,
        ]));
        let orch = orchestrator(&fixture, runner, vec![backend]);
        let report = orch.run().await.expect("run");

        assert_status(&report, SessionStatus::PartialFailure);
        assert_escalated(&report, EscalationReason::Exhausted);
        assert_file_content(fixture.path(), "calc.py", TestFixture::calc_content());

        let applied: Vec<f64> = report
            .attempts
            .iter()
            .filter(|a| !a.reason.contains("does not improve") && !a.reason.contains("below threshold"))
            .map(|a| a.confidence)
            .collect();
        assert!(applied.windows(2).all(|w| w[0] < w[1]), "{applied:?}");
        assert!(report.attempts.len() as u32 <= 1 + ProjectConfig::default().limits.modification_limit);
    }

    #[tokio::test]
    async fn test_stale_patch_never_touches_tree() {
        let fixture = TestFixture::broken_calculator();
        let runner = Arc::new(ScriptedTestRunner::new(vec![TestRun::fail(ADD_FAILURE)]));
        let backend = Arc::new(MockFixBackend::new("model").with_patches(vec![STALE_PATCH]));
        let report = orchestrator(&fixture, runner.clone(), vec![backend])
            .run()
            .await
            .expect("run");

        assert_status(&report, SessionStatus::PartialFailure);
        assert_eq!(runner.call_count(), 1, "no verification run for a patch that does not apply");
        assert_file_content(fixture.path(), "calc.py", TestFixture::calc_content());
    }

    #[tokio::test]
    async fn test_known_fix_replayed_without_generation() {
        let fixture = TestFixture::broken_calculator();
        let first = Arc::new(MockFixBackend::new("model").with_patches(vec![FIX_ADD]));
        let runner = Arc::new(ScriptedTestRunner::new(vec![
            TestRun::fail(ADD_FAILURE),
            TestRun::pass("1 passed"),
        ]));
        let report = orchestrator(&fixture, runner, vec![first])
            .run()
            .await
            .expect("run");
        assert_status(&report, SessionStatus::Success);

        fixture
            .write_file("calc.py", TestFixture::calc_content())
            .expect("reset");
        let second = Arc::new(MockFixBackend::new("model"));
        let runner = Arc::new(ScriptedTestRunner::new(vec![
            TestRun::fail(ADD_FAILURE),
            TestRun::pass("1 passed"),
        ]));
        let report = orchestrator(&fixture, runner, vec![second.clone()])
            .run()
            .await
            .expect("run");

        assert_status(&report, SessionStatus::Success);
        assert_eq!(second.call_count(), 0);
        assert_eq!(report.attempts[0].backend, LEARNING_STORE_BACKEND);
    }

    #[tokio::test]
    async fn test_cycle_budget_ends_in_partial_failure() {
        let fixture = TestFixture::broken_calculator();
        let mut config = ProjectConfig::default();
        config.limits.max_retry_cycles = 1;
        let backend = Arc::new(MockFixBackend::new("model").with_patches(vec![FIX_ADD]));
        let runner: Arc<dyn TestRunner> = Arc::new(fixture.runner());
        let mut registry = BackendRegistry::new();
        registry.push(backend);
        let report = Orchestrator::new(fixture.path(), config, runner, registry)
            .run()
            .await
            .expect("run");

        assert_status(&report, SessionStatus::PartialFailure);
        assert_eq!(report.cycles, 2);
        assert_eq!(report.verified_count(), 1);
        assert!(report
            .manual_review
            .iter()
            .any(|e| e.test_name.as_deref() == Some("test_mul")));
        assert!(fixture.read_file("calc.py").expect("read").contains("a + b"));
    }

    #[tokio::test]
    async fn test_attempt_bound_holds_across_sessions() {
        let fixture = TestFixture::broken_calculator();
        let mut config = ProjectConfig::default();
        config.limits.max_attempts = 1;
        config.limits.modification_limit = 10;
        let store = LearningStore::open(config.learning_dir(fixture.path()));

        let backend = Arc::new(MockFixBackend::new("model").with_patches(vec![WRONG_ADD; 8]));
        let runner = Arc::new(ScriptedTestRunner::new(vec![TestRun::fail(ADD_FAILURE)]));
        let report = orchestrator_with(&fixture, config.clone(), runner, backend.clone())
            .run()
            .await
            .expect("run");

        assert_status(&report, SessionStatus::PartialFailure);
        assert_escalated(&report, EscalationReason::Exhausted);
        assert_eq!(backend.call_count(), 1, "bound reached before any refinement");
        let sig = report.attempts[0].signature.clone();
        assert_eq!(store.history(&sig).len(), 1);
        assert_file_content(fixture.path(), "calc.py", TestFixture::calc_content());

        // A new session finds the bound already spent and asks no backend.
        let backend = Arc::new(MockFixBackend::new("model").with_patches(vec![WRONG_ADD; 8]));
        let runner = Arc::new(ScriptedTestRunner::new(vec![TestRun::fail(ADD_FAILURE)]));
        let report = orchestrator_with(&fixture, config, runner, backend.clone())
            .run()
            .await
            .expect("run");

        assert_status(&report, SessionStatus::PartialFailure);
        assert_escalated(&report, EscalationReason::Exhausted);
        assert_eq!(backend.call_count(), 0);
        assert!(report.attempts.is_empty());
        assert_eq!(store.history(&sig).len(), 1);
    }

    #[tokio::test]
    async fn test_attempt_bound_counts_earlier_sessions() {
        let fixture = TestFixture::broken_calculator();
        let mut config = ProjectConfig::default();
        config.limits.max_attempts = 2;
        config.limits.modification_limit = 10;

        // Learn the signature from a session that gets no candidate.
        let runner = Arc::new(ScriptedTestRunner::new(vec![TestRun::fail(ADD_FAILURE)]));
        let report = orchestrator_with(&fixture, config.clone(), runner, Arc::new(MockFixBackend::new("empty")))
            .run()
            .await
            .expect("run");
        let sig = report.failures_seen[0].signature.clone();

        let store = LearningStore::open(config.learning_dir(fixture.path()));
        let mut earlier = PatchAttempt::new(sig.clone(), WRONG_ADD, 0.1, "earlier session");
        earlier.outcome = PatchOutcome::Failed;
        store.record_failure(&earlier).expect("record");

        let backend = Arc::new(MockFixBackend::new("model").with_patches(vec![WRONG_ADD; 8]));
        let runner = Arc::new(ScriptedTestRunner::new(vec![TestRun::fail(ADD_FAILURE)]));
        let report = orchestrator_with(&fixture, config, runner, backend.clone())
            .run()
            .await
            .expect("run");

        assert_status(&report, SessionStatus::PartialFailure);
        assert_escalated(&report, EscalationReason::Exhausted);
        assert_eq!(backend.call_count(), 1);
        assert_eq!(store.history(&sig).len(), 2);
    }

    #[tokio::test]
    async fn test_recorded_best_confidence_gates_later_sessions() {
        let fixture = TestFixture::broken_calculator();
        let config = ProjectConfig::default();
        let first = orchestrator_with(
            &fixture,
            config.clone(),
            Arc::new(ScriptedTestRunner::new(vec![TestRun::fail(ADD_FAILURE)])),
            Arc::new(MockFixBackend::new("model").with_patches(vec![WRONG_ADD])),
        )
        .run()
        .await
        .expect("run");
        let best = first.attempts[0].confidence;

        let report = orchestrator_with(
            &fixture,
            config,
            Arc::new(ScriptedTestRunner::new(vec![TestRun::fail(ADD_FAILURE)])),
            Arc::new(MockFixBackend::new("model").with_patches(vec![WRONG_ADD])),
        )
        .run()
        .await
        .expect("run");

        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.attempts[0].outcome, PatchOutcome::Failed);
        assert!(report.attempts[0].confidence < best);
        assert!(report.attempts[0].reason.contains("does not improve"));
        assert_file_content(fixture.path(), "calc.py", TestFixture::calc_content());
    }

    #[tokio::test]
    async fn test_cancellation_during_verification_restores_baseline() {
        let fixture = TestFixture::broken_calculator();
        let runner = Arc::new(
            ScriptedTestRunner::new(vec![TestRun::fail(ADD_FAILURE), TestRun::pass("1 passed")])
                .with_stall(2, Duration::from_secs(5)),
        );
        let backend = Arc::new(MockFixBackend::new("model").with_patches(vec![FIX_ADD]));
        let report = orchestrator(&fixture, runner.clone(), vec![backend])
            .run_until(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .expect("run");

        assert_eq!(runner.call_count(), 2, "cancelled while verifying");
        assert!(report.cancelled);
        assert_status(&report, SessionStatus::PartialFailure);
        assert_escalated(&report, EscalationReason::Cancelled);
        assert_file_content(fixture.path(), "calc.py", TestFixture::calc_content());
    }

    #[tokio::test]
    async fn test_cancellation_rolls_back() {
        let fixture = TestFixture::broken_calculator();
        let backend = Arc::new(
            MockFixBackend::new("slow")
                .with_patches(vec![FIX_ADD])
                .with_delay(Duration::from_secs(5)),
        );
        let runner = Arc::new(ScriptedTestRunner::new(vec![TestRun::fail(ADD_FAILURE)]));
        let report = orchestrator(&fixture, runner, vec![backend])
            .run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .expect("run");

        assert!(report.cancelled);
        assert_status(&report, SessionStatus::PartialFailure);
        assert_escalated(&report, EscalationReason::Cancelled);
        assert_file_content(fixture.path(), "calc.py", TestFixture::calc_content());
    }
}
