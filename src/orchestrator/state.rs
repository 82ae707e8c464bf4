//! Loop states and legal transitions.
//!
//! ```text
//! Idle ─> Running ─┬─> AllPassed ─> Terminal(Success)
//!                  └─> Diagnosing ─> Patching ─> Verifying ─┬─> Succeeded
//!                          ▲                                 └─> RetryNeeded ─> Exhausted
//!                          └──────────── RollingBack <──────────────────────────────┘
//! ```
//!
//! Any non-terminal state may move to `RollingBack`, which is how
//! cancellation and the final `PartialFailure` pass are expressed.

use serde::{Deserialize, Serialize};

use crate::session::SessionStatus;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    PartialFailure,
}

impl From<Outcome> for SessionStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => SessionStatus::Success,
            Outcome::PartialFailure => SessionStatus::PartialFailure,
        }
    }
}

/// State of the retry loop.
///
/// # Example
///
/// ```
/// use mender::orchestrator::state::{LoopState, Outcome};
///
/// assert!(LoopState::Idle.can_transition_to(&LoopState::Running));
/// assert!(!LoopState::Idle.can_transition_to(&LoopState::Patching));
/// assert!(LoopState::Terminal(Outcome::Success).is_terminal());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    /// Full suite running.
    Running,
    /// Parsing failures and working through them.
    Diagnosing,
    AllPassed,
    /// Writing a candidate to the working tree.
    Patching,
    /// Re-running the suite against a candidate.
    Verifying,
    Succeeded,
    /// The last candidate was rejected or failed verification.
    RetryNeeded,
    /// No more attempts for the current signature.
    Exhausted,
    RollingBack,
    Terminal(Outcome),
}

impl LoopState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    /// Whether moving from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition_to(&self, next: &LoopState) -> bool {
        use LoopState::*;

        if self.is_terminal() {
            return false;
        }
        if *next == RollingBack {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Diagnosing | AllPassed)
                | (AllPassed, Terminal(Outcome::Success))
                | (Diagnosing, Patching | RetryNeeded | Exhausted | Running)
                | (Patching, Verifying)
                | (Verifying, Succeeded | RetryNeeded)
                | (Succeeded, Diagnosing | Running)
                | (RetryNeeded, Patching | Exhausted | Diagnosing | Running)
                | (Exhausted, RollingBack)
                | (RollingBack, Diagnosing | Running | Terminal(_))
        )
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Diagnosing => write!(f, "diagnosing"),
            Self::AllPassed => write!(f, "all-passed"),
            Self::Patching => write!(f, "patching"),
            Self::Verifying => write!(f, "verifying"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::RetryNeeded => write!(f, "retry-needed"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::RollingBack => write!(f, "rolling-back"),
            Self::Terminal(Outcome::Success) => write!(f, "terminal(success)"),
            Self::Terminal(Outcome::PartialFailure) => write!(f, "terminal(partial-failure)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            LoopState::Idle,
            LoopState::Running,
            LoopState::Diagnosing,
            LoopState::Patching,
            LoopState::Verifying,
            LoopState::Succeeded,
            LoopState::Running,
            LoopState::AllPassed,
            LoopState::Terminal(Outcome::Success),
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_exhaustion_path_is_legal() {
        let path = [
            LoopState::Verifying,
            LoopState::RetryNeeded,
            LoopState::Exhausted,
            LoopState::RollingBack,
            LoopState::Terminal(Outcome::PartialFailure),
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!LoopState::Idle.can_transition_to(&LoopState::Verifying));
        assert!(!LoopState::Patching.can_transition_to(&LoopState::Succeeded));
        assert!(!LoopState::AllPassed.can_transition_to(&LoopState::Terminal(Outcome::PartialFailure)));
        assert!(!LoopState::Terminal(Outcome::Success).can_transition_to(&LoopState::RollingBack));
    }

    #[test]
    fn test_rolling_back_from_anywhere_live() {
        for state in [LoopState::Idle, LoopState::Patching, LoopState::Verifying] {
            assert!(state.can_transition_to(&LoopState::RollingBack));
        }
    }

    #[test]
    fn test_outcome_maps_to_status() {
        assert_eq!(SessionStatus::from(Outcome::Success), SessionStatus::Success);
        assert_eq!(
            SessionStatus::from(Outcome::PartialFailure),
            SessionStatus::PartialFailure
        );
    }
}
