//! Confidence scoring and the retry gate.
//!
//! A candidate's confidence blends a static read of the diff with how often
//! patches for the same signature have verified before:
//!
//! ```text
//! confidence = 0.6 * heuristic + 0.4 * history_rate
//! ```
//!
//! History falls back to a neutral 0.5 when the signature has never been
//! seen. The gate then admits a candidate only when it clears the fixed
//! threshold *and* beats the best confidence already accepted for that
//! signature in this session, so accepted scores strictly increase.

use regex::Regex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

use crate::patch::UnifiedPatch;
use crate::signature::ErrorSignature;
use crate::store::LearningStore;

const HEURISTIC_WEIGHT: f64 = 0.6;
const HISTORY_WEIGHT: f64 = 0.4;
const NEUTRAL_PRIOR: f64 = 0.5;

const UNPARSEABLE_SCORE: f64 = 0.05;
const BASE_SCORE: f64 = 0.5;
const CONTENT_CHANGE_BONUS: f64 = 0.2;
const NOOP_PENALTY: f64 = 0.3;
const TOUCHES_FAILING_FILE_BONUS: f64 = 0.1;
const DISABLES_TESTS_PENALTY: f64 = 0.25;
const LARGE_PATCH_PENALTY: f64 = 0.1;
const LARGE_PATCH_LINES: usize = 200;

/// Scored candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    /// Final score in [0, 1].
    pub confidence: f64,
    /// Static score over the diff.
    pub heuristic: f64,
    /// Stored verified ÷ total, if any history exists.
    pub history_rate: Option<f64>,
    /// Contributing factors, human-readable.
    pub reason: String,
}

/// Outcome of the retry gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Apply the candidate.
    Accept,
    /// Confidence below the fixed threshold.
    BelowThreshold { threshold: f64 },
    /// Confidence does not beat the best already accepted.
    NotImproved { best: f64 },
}

impl RetryDecision {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept)
    }

    /// Why the candidate was rejected, or `None` when accepted.
    #[must_use]
    pub fn rejection(&self, confidence: f64) -> Option<String> {
        match self {
            Self::Accept => None,
            Self::BelowThreshold { threshold } => Some(format!(
                "confidence {:.2} below threshold {:.2}",
                confidence, threshold
            )),
            Self::NotImproved { best } => Some(format!(
                "confidence {:.2} does not improve on {:.2}",
                confidence, best
            )),
        }
    }
}

fn disabling_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            @pytest\.mark\.(skip|xfail)
            | @unittest\.skip
            | \bpytest\.skip\(
            | \#\[ignore\]
            | \b(xit|xdescribe|it\.skip|describe\.skip|test\.skip)\(
            | @(Disabled|Ignore)\b
            | \bt\.Skip\(
            | ^\s*assert\s+True\b
            | ^\s*assert!\(\s*true\s*\)
            ",
        )
        .expect("test-disabling regex is valid")
    })
}

fn assert_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bassert").expect("assert regex is valid"))
}

fn normalize_path(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Static score for a patch, with the factors that produced it.
#[must_use]
pub fn heuristic_score(patch_text: &str, failing_file: Option<&Path>) -> (f64, Vec<String>) {
    if patch_text.trim().is_empty() {
        return (0.0, vec!["empty patch".to_string()]);
    }

    let patch = match UnifiedPatch::parse(patch_text) {
        Ok(patch) => patch,
        Err(e) => {
            return (
                UNPARSEABLE_SCORE,
                vec![format!("not a unified diff ({})", e)],
            )
        }
    };

    let mut score = BASE_SCORE;
    let mut factors = vec![format!("parseable diff ({:.2})", BASE_SCORE)];

    let (added, removed) = patch.counts();
    if patch.is_noop() {
        score -= NOOP_PENALTY;
        factors.push(format!("no-op (-{:.2})", NOOP_PENALTY));
    } else {
        score += CONTENT_CHANGE_BONUS;
        factors.push(format!("changes content (+{:.2})", CONTENT_CHANGE_BONUS));
    }

    if let Some(failing) = failing_file {
        let failing = normalize_path(failing);
        if patch
            .target_files()
            .iter()
            .any(|t| normalize_path(t) == failing)
        {
            score += TOUCHES_FAILING_FILE_BONUS;
            factors.push(format!(
                "touches failing file (+{:.2})",
                TOUCHES_FAILING_FILE_BONUS
            ));
        }
    }

    let adds_skip = patch.added_lines().any(|l| disabling_re().is_match(l));
    let removed_asserts = patch.removed_lines().filter(|l| assert_re().is_match(l)).count();
    let added_asserts = patch.added_lines().filter(|l| assert_re().is_match(l)).count();
    if adds_skip || removed_asserts > added_asserts {
        score -= DISABLES_TESTS_PENALTY;
        factors.push(format!(
            "appears to disable tests (-{:.2})",
            DISABLES_TESTS_PENALTY
        ));
    }

    if added + removed > LARGE_PATCH_LINES {
        score -= LARGE_PATCH_PENALTY;
        factors.push(format!(
            "{} changed lines (-{:.2})",
            added + removed,
            LARGE_PATCH_PENALTY
        ));
    }

    (score.clamp(0.0, 1.0), factors)
}

/// Scores candidates and gates retries.
///
/// The best accepted confidence per signature starts from the highest
/// confidence the learning store has on record (see [`Self::recall`]), or
/// 0.0 for a signature never seen before.
#[derive(Debug, Clone)]
pub struct ConfidenceManager {
    threshold: f64,
    best: HashMap<ErrorSignature, f64>,
}

impl ConfidenceManager {
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            best: HashMap::new(),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Best confidence accepted for `signature` so far (0.0 if none).
    #[must_use]
    pub fn best(&self, signature: &ErrorSignature) -> f64 {
        self.best.get(signature).copied().unwrap_or(0.0)
    }

    /// Seed the best confidence for `signature` from stored attempts.
    ///
    /// Only the first call per signature reads the store; later calls return
    /// the in-memory best, which may have moved on since.
    pub fn recall(&mut self, store: &LearningStore, signature: &ErrorSignature) -> f64 {
        if let Some(best) = self.best.get(signature) {
            return *best;
        }
        let best = store.history(signature).best_confidence().unwrap_or(0.0);
        if best > 0.0 {
            debug!("Best recorded confidence for {} is {:.2}", signature.short(), best);
        }
        self.best.insert(signature.clone(), best);
        best
    }

    /// Score a candidate using the store's history for `signature`.
    #[must_use]
    pub fn score(
        &self,
        store: &LearningStore,
        signature: &ErrorSignature,
        patch_text: &str,
        failing_file: Option<&Path>,
    ) -> Assessment {
        let rate = store.success_rate(signature);
        self.score_with_rate(patch_text, failing_file, rate)
    }

    /// Score a candidate against an explicit history rate.
    #[must_use]
    pub fn score_with_rate(
        &self,
        patch_text: &str,
        failing_file: Option<&Path>,
        history_rate: Option<f64>,
    ) -> Assessment {
        let (heuristic, mut factors) = heuristic_score(patch_text, failing_file);
        let rate = history_rate.unwrap_or(NEUTRAL_PRIOR);
        factors.push(match history_rate {
            Some(r) => format!("history {:.0}% verified", r * 100.0),
            None => "no history (prior 0.50)".to_string(),
        });

        let confidence = (HEURISTIC_WEIGHT * heuristic + HISTORY_WEIGHT * rate).clamp(0.0, 1.0);
        Assessment {
            confidence,
            heuristic,
            history_rate,
            reason: factors.join("; "),
        }
    }

    /// Gate a candidate; accepting records it as the new best.
    pub fn decide_retry(&mut self, signature: &ErrorSignature, confidence: f64) -> RetryDecision {
        if confidence < self.threshold {
            return RetryDecision::BelowThreshold {
                threshold: self.threshold,
            };
        }
        let best = self.best(signature);
        if confidence <= best {
            return RetryDecision::NotImproved { best };
        }
        debug!(
            "Accepting {:.2} for {} (previous best {:.2})",
            confidence,
            signature.short(),
            best
        );
        self.best.insert(signature.clone(), confidence);
        RetryDecision::Accept
    }
}
