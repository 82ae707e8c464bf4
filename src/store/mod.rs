//! Learning store: per-signature patch history that outlives sessions.
//!
//! Three independent JSON files live in the store directory:
//!
//! - `failed_patches.json` and `successful_patches.json`, each mapping a
//!   signature to the attempts recorded for it
//! - `daily_analytics.json`, counting fixes and successes per day
//!
//! Every mutation takes an exclusive lock, re-reads the file from disk,
//! modifies it, and writes it back atomically, so concurrent sessions on the
//! same project never lose each other's writes. Reads never fail: a corrupt
//! or incompatible file is reported as an anomaly and treated as empty.
//!
//! # Example
//!
//! ```rust,ignore
//! use mender::store::LearningStore;
//!
//! let store = LearningStore::open("/path/to/project/.mender/learning");
//! store.record_success(&attempt)?;
//! let history = store.history(&attempt.signature);
//! assert_eq!(history.verified_count(), 1);
//! ```

pub mod persistence;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::attempt::{PatchAttempt, PatchOutcome};
use crate::error::Result;
use crate::signature::ErrorSignature;
use persistence::{load_or_empty, lock_exclusive, lock_shared, save_atomic, Versioned, STORE_VERSION};

pub const FAILED_FILE: &str = "failed_patches.json";
pub const SUCCESS_FILE: &str = "successful_patches.json";
pub const DAILY_FILE: &str = "daily_analytics.json";

fn current_version() -> u32 {
    STORE_VERSION
}

// ============================================================================
// File layouts
// ============================================================================

/// `{ "version": 1, "entries": { "<signature>": [PatchAttempt, ...] } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PatchFile {
    #[serde(default = "current_version")]
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, Vec<PatchAttempt>>,
}

impl Default for PatchFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl Versioned for PatchFile {
    fn version(&self) -> u32 {
        self.version
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct DayRecord {
    #[serde(default)]
    total_fixes: u64,
    #[serde(default)]
    successes: u64,
}

/// `{ "version": 1, "days": { "YYYY-MM-DD": { "totalFixes": n, "successes": m } } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DailyFile {
    #[serde(default = "current_version")]
    version: u32,
    #[serde(default)]
    days: BTreeMap<NaiveDate, DayRecord>,
}

impl Default for DailyFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            days: BTreeMap::new(),
        }
    }
}

impl Versioned for DailyFile {
    fn version(&self) -> u32 {
        self.version
    }
}

// ============================================================================
// Public views
// ============================================================================

/// All recorded attempts for one signature, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchHistory {
    pub signature: ErrorSignature,
    pub attempts: Vec<PatchAttempt>,
}

impl PatchHistory {
    #[must_use]
    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    #[must_use]
    pub fn verified_count(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.outcome == PatchOutcome::Verified)
            .count()
    }

    /// Verified ÷ total, or `None` with no history.
    #[must_use]
    pub fn success_rate(&self) -> Option<f64> {
        if self.attempts.is_empty() {
            None
        } else {
            Some(self.verified_count() as f64 / self.attempts.len() as f64)
        }
    }
    /// Attempts recorded after the most recent verified one.
    ///
    /// For a signature that never verified this is the whole history.
    #[must_use]
    pub fn attempts_since_success(&self) -> usize {
        self.attempts
            .iter()
            .rev()
            .take_while(|a| a.outcome != PatchOutcome::Verified)
            .count()
    }

    /// Highest confidence ever recorded, `None` with no history.
    #[must_use]
    pub fn best_confidence(&self) -> Option<f64> {
        self.attempts.iter().map(|a| a.confidence).reduce(f64::max)
    }
}

/// One day of analytics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub total_fixes: u64,
    pub successes: u64,
    pub success_rate: f64,
}

// ============================================================================
// Learning Store
// ============================================================================

/// Durable per-signature history.
#[derive(Debug)]
pub struct LearningStore {
    dir: PathBuf,
    anomalies: Mutex<Vec<String>>,
}

impl LearningStore {
    /// Open (lazily) the store in `dir`. Nothing is read or created until used.
    pub fn open(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            anomalies: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Corruption events seen since the last call.
    pub fn take_anomalies(&self) -> Vec<String> {
        match self.anomalies.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    fn note(&self, anomaly: Option<String>) {
        if let Some(anomaly) = anomaly {
            match self.anomalies.lock() {
                Ok(mut guard) => guard.push(anomaly),
                Err(poisoned) => poisoned.into_inner().push(anomaly),
            }
        }
    }

    fn read_patches(&self, file: &str) -> PatchFile {
        let loaded = load_or_empty::<PatchFile>(&self.dir.join(file));
        self.note(loaded.anomaly);
        loaded.value
    }

    fn read_daily(&self) -> DailyFile {
        let loaded = load_or_empty::<DailyFile>(&self.dir.join(DAILY_FILE));
        self.note(loaded.anomaly);
        loaded.value
    }

    /// Read both patch files under one shared lock. A lock failure degrades
    /// to an unlocked read.
    fn read_both(&self) -> (PatchFile, PatchFile) {
        let _lock = lock_shared(&self.dir)
            .map_err(|e| debug!("Reading learning store without lock: {}", e))
            .ok();
        (self.read_patches(FAILED_FILE), self.read_patches(SUCCESS_FILE))
    }

    fn record(&self, attempt: &PatchAttempt, file: &str, success: bool) -> Result<()> {
        let _lock = lock_exclusive(&self.dir)?;

        let mut patches = self.read_patches(file);
        patches
            .entries
            .entry(attempt.signature.as_str().to_string())
            .or_default()
            .push(attempt.clone());
        save_atomic(&self.dir.join(file), &patches)?;

        let mut daily = self.read_daily();
        let day = daily.days.entry(Utc::now().date_naive()).or_default();
        day.total_fixes += 1;
        if success {
            day.successes += 1;
        }
        save_atomic(&self.dir.join(DAILY_FILE), &daily)?;

        debug!(
            "Recorded {} attempt {} for {}",
            if success { "successful" } else { "failed" },
            attempt.id,
            attempt.signature.short()
        );
        Ok(())
    }

    /// Append a failed attempt.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be locked or written.
    pub fn record_failure(&self, attempt: &PatchAttempt) -> Result<()> {
        self.record(attempt, FAILED_FILE, false)
    }

    /// Append a verified attempt.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be locked or written.
    pub fn record_success(&self, attempt: &PatchAttempt) -> Result<()> {
        self.record(attempt, SUCCESS_FILE, true)
    }

    /// Both lists for `signature`, merged and ordered by timestamp.
    #[must_use]
    pub fn history(&self, signature: &ErrorSignature) -> PatchHistory {
        let (failed, successful) = self.read_both();
        let key = signature.as_str();
        let mut attempts: Vec<PatchAttempt> = failed
            .entries
            .get(key)
            .into_iter()
            .chain(successful.entries.get(key))
            .flatten()
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.timestamp);
        PatchHistory {
            signature: signature.clone(),
            attempts,
        }
    }

    /// Most recent verified patch for `signature`.
    #[must_use]
    pub fn latest_success(&self, signature: &ErrorSignature) -> Option<PatchAttempt> {
        let _lock = lock_shared(&self.dir).ok();
        self.read_patches(SUCCESS_FILE)
            .entries
            .get(signature.as_str())
            .and_then(|list| list.last().cloned())
    }

    /// Patch texts that failed for `signature`, oldest first.
    #[must_use]
    pub fn failed_patches(&self, signature: &ErrorSignature) -> Vec<String> {
        let _lock = lock_shared(&self.dir).ok();
        self.read_patches(FAILED_FILE)
            .entries
            .get(signature.as_str())
            .map(|list| list.iter().map(|a| a.patch_text.clone()).collect())
            .unwrap_or_default()
    }

    /// Remove and return the most recent successful patch.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be locked or written.
    pub fn undo_last_success(&self, signature: &ErrorSignature) -> Result<Option<PatchAttempt>> {
        let _lock = lock_exclusive(&self.dir)?;
        let mut successful = self.read_patches(SUCCESS_FILE);

        let key = signature.as_str();
        let popped = successful.entries.get_mut(key).and_then(Vec::pop);
        if popped.is_none() {
            return Ok(None);
        }
        if successful.entries.get(key).is_some_and(Vec::is_empty) {
            successful.entries.remove(key);
        }
        save_atomic(&self.dir.join(SUCCESS_FILE), &successful)?;
        info!("Undid last successful patch for {}", signature.short());
        Ok(popped)
    }

    /// Stored attempts for `signature` since its last verified fix.
    ///
    /// This is the count bounded by `maxAttempts`; it spans sessions.
    #[must_use]
    pub fn attempts_since_success(&self, signature: &ErrorSignature) -> usize {
        self.history(signature).attempts_since_success()
    }

    /// Verified ÷ total for `signature`, `None` with no history.
    #[must_use]
    pub fn success_rate(&self, signature: &ErrorSignature) -> Option<f64> {
        self.history(signature).success_rate()
    }

    /// Per-day totals, oldest first.
    #[must_use]
    pub fn daily_stats(&self) -> BTreeMap<NaiveDate, DailyStats> {
        let _lock = lock_shared(&self.dir).ok();
        self.read_daily()
            .days
            .into_iter()
            .map(|(date, day)| {
                let success_rate = if day.total_fixes == 0 {
                    0.0
                } else {
                    day.successes as f64 / day.total_fixes as f64
                };
                (
                    date,
                    DailyStats {
                        total_fixes: day.total_fixes,
                        successes: day.successes,
                        success_rate,
                    },
                )
            })
            .collect()
    }

    /// Every signature with stored history.
    #[must_use]
    pub fn signatures(&self) -> Vec<ErrorSignature> {
        let (failed, successful) = self.read_both();
        let keys: BTreeSet<String> = failed
            .entries
            .into_keys()
            .chain(successful.entries.into_keys())
            .collect();
        keys.into_iter().filter_map(|k| k.parse().ok()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::signature_of;
    use tempfile::TempDir;

    fn attempt(sig: &ErrorSignature, session: &str, outcome: PatchOutcome) -> PatchAttempt {
        let mut a = PatchAttempt::new(sig.clone(), "--- a/x\n+++ b/x\n", 0.6, "test")
            .with_session(session);
        a.outcome = outcome;
        a
    }

    fn store() -> (TempDir, LearningStore) {
        let dir = TempDir::new().expect("temp dir");
        let store = LearningStore::open(dir.path().join("learning"));
        (dir, store)
    }

    #[test]
    fn test_empty_store() {
        let (_dir, store) = store();
        let sig = signature_of("e", "c");
        assert!(store.history(&sig).is_empty());
        assert_eq!(store.success_rate(&sig), None);
        assert!(store.latest_success(&sig).is_none());
        assert!(store.signatures().is_empty());
        assert!(store.daily_stats().is_empty());
    }

    #[test]
    fn test_history_survives_reopen() {
        let (dir, store) = store();
        let sig = signature_of("e", "c");
        let failed = attempt(&sig, "s1", PatchOutcome::Failed);
        let verified = attempt(&sig, "s1", PatchOutcome::Verified);
        store.record_failure(&failed).expect("record");
        store.record_success(&verified).expect("record");

        let reopened = LearningStore::open(dir.path().join("learning"));
        let history = reopened.history(&sig);
        assert_eq!(history.attempts, vec![failed, verified]);
        assert_eq!(history.success_rate(), Some(0.5));
        assert_eq!(reopened.signatures(), vec![sig]);
    }

    #[test]
    fn test_undo_last_success() {
        let (_dir, store) = store();
        let sig = signature_of("e", "c");
        let first = attempt(&sig, "s1", PatchOutcome::Verified);
        let second = attempt(&sig, "s2", PatchOutcome::Verified);
        store.record_success(&first).expect("record");
        store.record_success(&second).expect("record");

        assert_eq!(store.undo_last_success(&sig).expect("undo"), Some(second));
        assert_eq!(store.latest_success(&sig), Some(first.clone()));
        assert_eq!(store.undo_last_success(&sig).expect("undo"), Some(first));
        assert_eq!(store.undo_last_success(&sig).expect("undo"), None);
    }

    #[test]
    fn test_attempts_since_success_spans_sessions() {
        let (dir, store) = store();
        let sig = signature_of("e", "c");
        store.record_failure(&attempt(&sig, "s1", PatchOutcome::Failed)).expect("record");
        store.record_failure(&attempt(&sig, "s2", PatchOutcome::Failed)).expect("record");
        assert_eq!(store.attempts_since_success(&sig), 2);

        store.record_success(&attempt(&sig, "s3", PatchOutcome::Verified)).expect("record");
        assert_eq!(store.attempts_since_success(&sig), 0);

        store.record_failure(&attempt(&sig, "s4", PatchOutcome::Failed)).expect("record");
        let reopened = LearningStore::open(dir.path().join("learning"));
        assert_eq!(reopened.attempts_since_success(&sig), 1);
        assert_eq!(reopened.attempts_since_success(&signature_of("other", "c")), 0);
    }

    #[test]
    fn test_best_confidence() {
        let (_dir, store) = store();
        let sig = signature_of("e", "c");
        assert_eq!(store.history(&sig).best_confidence(), None);

        let mut high = attempt(&sig, "s1", PatchOutcome::Failed);
        high.confidence = 0.68;
        let mut low = attempt(&sig, "s2", PatchOutcome::Failed);
        low.confidence = 0.48;
        store.record_failure(&high).expect("record");
        store.record_failure(&low).expect("record");
        assert_eq!(store.history(&sig).best_confidence(), Some(0.68));
    }

    #[test]
    fn test_daily_stats() {
        let (_dir, store) = store();
        let sig = signature_of("e", "c");
        store.record_failure(&attempt(&sig, "s", PatchOutcome::Failed)).expect("record");
        store.record_success(&attempt(&sig, "s", PatchOutcome::Verified)).expect("record");

        let stats = store.daily_stats();
        let today = stats.get(&Utc::now().date_naive()).expect("today");
        assert_eq!(today.total_fixes, 2);
        assert_eq!(today.successes, 1);
        assert!((today.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_corrupt_file_degrades_and_is_rewritten() {
        let (_dir, store) = store();
        std::fs::create_dir_all(store.dir()).expect("mkdir");
        std::fs::write(store.dir().join(FAILED_FILE), "{ broken").expect("write");

        let sig = signature_of("e", "c");
        assert!(store.history(&sig).is_empty());
        assert!(!store.take_anomalies().is_empty());

        store.record_failure(&attempt(&sig, "s", PatchOutcome::Failed)).expect("record");
        assert_eq!(store.history(&sig).len(), 1);
        store.take_anomalies();
        assert_eq!(store.history(&sig).len(), 1);
        assert!(store.take_anomalies().is_empty(), "file was rewritten cleanly");
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let (_dir, store) = store();
        let sig = signature_of("e", "c");
        store.record_success(&attempt(&sig, "s", PatchOutcome::Verified)).expect("record");

        let path = store.dir().join(SUCCESS_FILE);
        let mut value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        value["writtenBy"] = serde_json::json!("a newer mender");
        std::fs::write(&path, value.to_string()).expect("write");

        assert_eq!(store.history(&sig).len(), 1);
        assert!(store.take_anomalies().is_empty());
    }
}
