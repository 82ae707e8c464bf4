//! Pre-patch file snapshots.
//!
//! At most one backup is live per file. A second `ensure` for a file that
//! already has one is a no-op, so two failures patching the same file in one
//! cycle share the original snapshot and restoring it returns the file to
//! the last verified state.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::ensure_within_project;
use crate::error::Result;

/// Snapshot of one file taken before it was patched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    /// Path relative to the project directory.
    pub file_path: PathBuf,
    /// Previous content, or `None` when the file did not exist.
    pub snapshot: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

/// Proof that a set of files had live backups at apply time.
///
/// Only [`BackupStore::ensure_all`] hands out non-empty receipts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReceipt {
    files: Vec<PathBuf>,
}

impl BackupReceipt {
    /// Files covered by the receipt.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Live backups for the current session, keyed by relative path.
#[derive(Debug)]
pub struct BackupStore {
    project_dir: PathBuf,
    backups: BTreeMap<PathBuf, Backup>,
}

impl BackupStore {
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        Self {
            project_dir: project_dir.as_ref().to_path_buf(),
            backups: BTreeMap::new(),
        }
    }

    /// Project directory the relative paths resolve against.
    #[must_use]
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Snapshot `path` unless a backup is already live.
    ///
    /// Returns `true` when a new backup was taken.
    ///
    /// # Errors
    ///
    /// Fails for paths outside the project or when the file exists but
    /// cannot be read.
    pub fn ensure(&mut self, path: &Path) -> Result<bool> {
        ensure_within_project(path)?;
        if self.backups.contains_key(path) {
            debug!("Backup already live for {}", path.display());
            return Ok(false);
        }

        let absolute = self.project_dir.join(path);
        let snapshot = if absolute.exists() {
            Some(std::fs::read(&absolute)?)
        } else {
            None
        };

        debug!(
            "Backed up {} ({})",
            path.display(),
            snapshot
                .as_ref()
                .map_or_else(|| "absent".to_string(), |s| format!("{} bytes", s.len()))
        );
        self.backups.insert(
            path.to_path_buf(),
            Backup {
                file_path: path.to_path_buf(),
                snapshot,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    /// Ensure backups for every path and return a receipt covering them.
    ///
    /// # Errors
    ///
    /// Stops at the first path that cannot be backed up. Backups taken for
    /// earlier paths stay live.
    pub fn ensure_all(&mut self, paths: &[PathBuf]) -> Result<BackupReceipt> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            self.ensure(path)?;
            files.push(path.clone());
        }
        Ok(BackupReceipt { files })
    }

    #[must_use]
    pub fn is_live(&self, path: &Path) -> bool {
        self.backups.contains_key(path)
    }

    #[must_use]
    pub fn get(&self, path: &Path) -> Option<&Backup> {
        self.backups.get(path)
    }

    /// Drop backups for `paths`; their current content becomes the baseline.
    pub fn commit(&mut self, paths: &[PathBuf]) {
        for path in paths {
            if self.backups.remove(path).is_some() {
                debug!("Committed {}", path.display());
            }
        }
    }

    /// Remove and return the backup for `path`.
    pub fn take(&mut self, path: &Path) -> Option<Backup> {
        self.backups.remove(path)
    }

    /// Put a taken backup back, e.g. after a restore failed midway.
    pub fn reinstate(&mut self, backup: Backup) {
        self.backups.entry(backup.file_path.clone()).or_insert(backup);
    }

    /// Paths with live backups, sorted.
    #[must_use]
    pub fn live_paths(&self) -> Vec<PathBuf> {
        self.backups.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.backups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }

    /// Discard every backup (session ended successfully).
    pub fn clear(&mut self) {
        self.backups.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_ensure_keeps_original_snapshot() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("a.py"), "v1").expect("write");
        let mut store = BackupStore::new(dir.path());

        assert!(store.ensure(Path::new("a.py")).expect("ensure"));
        std::fs::write(dir.path().join("a.py"), "v2").expect("write");
        assert!(!store.ensure(Path::new("a.py")).expect("ensure"));

        assert_eq!(store.len(), 1);
        let backup = store.get(Path::new("a.py")).expect("backup");
        assert_eq!(backup.snapshot.as_deref(), Some(b"v1".as_slice()));
    }

    #[test]
    fn test_missing_file_snapshot_is_none() {
        let dir = TempDir::new().expect("temp dir");
        let mut store = BackupStore::new(dir.path());
        store.ensure(Path::new("new.py")).expect("ensure");
        assert_eq!(store.get(Path::new("new.py")).expect("backup").snapshot, None);
    }

    #[test]
    fn test_receipt_covers_requested_paths() {
        let dir = TempDir::new().expect("temp dir");
        let mut store = BackupStore::new(dir.path());
        let receipt = store
            .ensure_all(&["a.py".into(), "b.py".into()])
            .expect("ensure_all");
        assert_eq!(receipt.files().len(), 2);
        assert!(!receipt.is_empty());
        assert!(BackupReceipt::default().is_empty());
    }

    #[test]
    fn test_commit_and_take() {
        let dir = TempDir::new().expect("temp dir");
        let mut store = BackupStore::new(dir.path());
        store
            .ensure_all(&["a.py".into(), "b.py".into()])
            .expect("ensure_all");

        store.commit(&["a.py".into()]);
        assert_eq!(store.live_paths(), vec![PathBuf::from("b.py")]);
        assert!(store.take(Path::new("b.py")).is_some());
        assert!(store.take(Path::new("b.py")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = TempDir::new().expect("temp dir");
        let mut store = BackupStore::new(dir.path());
        assert!(store.ensure(Path::new("../x")).is_err());
        assert!(store.ensure_all(&["/etc/hosts".into()]).is_err());
    }
}
