//! Rollback of patched files from their backups.
//!
//! Restoring consumes the backup, so restoring the same file twice leaves it
//! exactly as the first restore did. A file whose backup recorded "did not
//! exist" is deleted on restore.
//!
//! # Example
//!
//! ```rust,ignore
//! use mender::patch::BackupStore;
//! use mender::rollback::RollbackManager;
//!
//! let mut backups = BackupStore::new("/path/to/project");
//! backups.ensure(Path::new("src/calc.py"))?;
//! // ... patch fails verification ...
//! let result = RollbackManager::new("/path/to/project").restore_everything(&mut backups);
//! println!("{}", result.summary());
//! ```

use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{MenderError, Result};
use crate::patch::backup::{Backup, BackupStore};

// ============================================================================
// Rollback Result
// ============================================================================

/// What happened to a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The snapshot was written back (or the created file removed).
    Restored,
    /// No live backup; the file was left as-is.
    NoBackup,
}

/// Result of a bulk rollback.
#[derive(Debug, Clone, Default)]
pub struct RollbackResult {
    /// Files restored from a backup.
    pub restored: Vec<PathBuf>,

    /// Files that had no live backup.
    pub missing: Vec<PathBuf>,

    /// Files whose restore failed, with the error text.
    pub failed: Vec<(PathBuf, String)>,
}

impl RollbackResult {
    /// True when every requested file was restored.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.failed.is_empty()
    }

    /// Format a summary for display.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = format!("Restored {} file(s)", self.restored.len());
        if !self.missing.is_empty() {
            out.push_str(&format!(", {} without backup", self.missing.len()));
        }
        if !self.failed.is_empty() {
            out.push_str(&format!(", {} failed", self.failed.len()));
        }
        out
    }
}

// ============================================================================
// Rollback Manager
// ============================================================================

/// Writes backups back over the working tree.
#[derive(Debug, Clone)]
pub struct RollbackManager {
    /// Project root directory.
    project_dir: PathBuf,
}

impl RollbackManager {
    #[must_use]
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        Self {
            project_dir: project_dir.as_ref().to_path_buf(),
        }
    }

    /// Restore one file, consuming its backup.
    ///
    /// # Errors
    ///
    /// Returns [`MenderError::RestoreFailed`] when the write or delete fails.
    /// The backup stays live in that case so a later pass can retry.
    pub fn restore(&self, backups: &mut BackupStore, path: &Path) -> Result<RestoreOutcome> {
        let Some(backup) = backups.take(path) else {
            debug!("No live backup for {}; nothing to restore", path.display());
            return Ok(RestoreOutcome::NoBackup);
        };

        match self.write_back(&backup) {
            Ok(()) => {
                debug!("Restored {}", path.display());
                Ok(RestoreOutcome::Restored)
            }
            Err(e) => {
                backups.reinstate(backup);
                Err(MenderError::RestoreFailed {
                    path: path.to_path_buf(),
                    message: format!("{:#}", e),
                })
            }
        }
    }

    /// Restore each of `paths`, continuing past failures.
    pub fn restore_all(&self, backups: &mut BackupStore, paths: &[PathBuf]) -> RollbackResult {
        let mut result = RollbackResult::default();
        for path in paths {
            match self.restore(backups, path) {
                Ok(RestoreOutcome::Restored) => result.restored.push(path.clone()),
                Ok(RestoreOutcome::NoBackup) => result.missing.push(path.clone()),
                Err(e) => {
                    warn!("{}", e);
                    result.failed.push((path.clone(), e.to_string()));
                }
            }
        }
        if !result.restored.is_empty() {
            info!("Rollback: {}", result.summary());
        }
        result
    }

    /// Restore every live backup.
    pub fn restore_everything(&self, backups: &mut BackupStore) -> RollbackResult {
        let paths = backups.live_paths();
        self.restore_all(backups, &paths)
    }

    fn write_back(&self, backup: &Backup) -> anyhow::Result<()> {
        let absolute = self.project_dir.join(&backup.file_path);
        match &backup.snapshot {
            Some(bytes) => {
                if let Some(parent) = absolute.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                let tmp = absolute.with_extension("mender-restore");
                std::fs::write(&tmp, bytes)
                    .with_context(|| format!("Failed to write {}", tmp.display()))?;
                std::fs::rename(&tmp, &absolute)
                    .with_context(|| format!("Failed to replace {}", absolute.display()))?;
            }
            None => {
                if absolute.exists() {
                    std::fs::remove_file(&absolute)
                        .with_context(|| format!("Failed to remove {}", absolute.display()))?;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, BackupStore, RollbackManager) {
        let dir = TempDir::new().expect("create temp dir");
        std::fs::write(dir.path().join("a.py"), "original").expect("write");
        let store = BackupStore::new(dir.path());
        let manager = RollbackManager::new(dir.path());
        (dir, store, manager)
    }

    #[test]
    fn test_restore_writes_snapshot_back() {
        let (dir, mut store, manager) = setup();
        store.ensure(Path::new("a.py")).expect("ensure");
        std::fs::write(dir.path().join("a.py"), "patched").expect("write");

        let outcome = manager.restore(&mut store, Path::new("a.py")).expect("restore");
        assert_eq!(outcome, RestoreOutcome::Restored);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.py")).expect("read"),
            "original"
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_restore_is_idempotent() {
        let (dir, mut store, manager) = setup();
        store.ensure(Path::new("a.py")).expect("ensure");
        std::fs::write(dir.path().join("a.py"), "patched").expect("write");

        manager.restore(&mut store, Path::new("a.py")).expect("restore");
        let first = std::fs::read_to_string(dir.path().join("a.py")).expect("read");
        let outcome = manager.restore(&mut store, Path::new("a.py")).expect("restore");
        let second = std::fs::read_to_string(dir.path().join("a.py")).expect("read");

        assert_eq!(outcome, RestoreOutcome::NoBackup);
        assert_eq!(first, second);
    }

    #[test]
    fn test_restore_without_backup_leaves_file() {
        let (dir, mut store, manager) = setup();
        std::fs::write(dir.path().join("a.py"), "edited").expect("write");
        let outcome = manager.restore(&mut store, Path::new("a.py")).expect("restore");
        assert_eq!(outcome, RestoreOutcome::NoBackup);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.py")).expect("read"),
            "edited"
        );
    }

    #[test]
    fn test_restore_deletes_created_file() {
        let (dir, mut store, manager) = setup();
        store.ensure(Path::new("new/mod.py")).expect("ensure");
        std::fs::create_dir_all(dir.path().join("new")).expect("mkdir");
        std::fs::write(dir.path().join("new/mod.py"), "created").expect("write");

        manager.restore(&mut store, Path::new("new/mod.py")).expect("restore");
        assert!(!dir.path().join("new/mod.py").exists());
    }

    #[test]
    fn test_restore_all_reports_missing() {
        let (dir, mut store, manager) = setup();
        store.ensure(Path::new("a.py")).expect("ensure");
        std::fs::write(dir.path().join("a.py"), "patched").expect("write");

        let result = manager.restore_all(&mut store, &["a.py".into(), "b.py".into()]);
        assert_eq!(result.restored, vec![PathBuf::from("a.py")]);
        assert_eq!(result.missing, vec![PathBuf::from("b.py")]);
        assert!(!result.is_clean());
        assert!(result.summary().contains("1 without backup"));
    }

    #[test]
    fn test_restore_everything_empties_store() {
        let (dir, mut store, manager) = setup();
        std::fs::write(dir.path().join("b.py"), "b").expect("write");
        store
            .ensure_all(&["a.py".into(), "b.py".into()])
            .expect("ensure");
        std::fs::write(dir.path().join("a.py"), "x").expect("write");
        std::fs::write(dir.path().join("b.py"), "y").expect("write");

        let result = manager.restore_everything(&mut store);
        assert!(result.is_clean());
        assert_eq!(result.restored.len(), 2);
        assert!(store.is_empty());
        assert_eq!(std::fs::read_to_string(dir.path().join("b.py")).expect("read"), "b");
    }
}
