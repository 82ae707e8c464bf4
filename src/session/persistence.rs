//! Report persistence: atomic writes of finished session reports.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use super::{SessionReport, SESSION_REPORT_VERSION};
use crate::error::{MenderError, Result};
use crate::store::persistence::save_atomic;

/// Copy of the most recent report.
const LATEST_FILE: &str = "latest.json";

/// Lock file guarding the reports directory.
const LOCK_FILE: &str = "reports.lock";

/// Reads and writes reports in `.mender/reports/`.
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Path of the report for session `id`.
    #[must_use]
    pub fn report_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    #[must_use]
    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_FILE)
    }

    /// Write `<id>.json` and `latest.json` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`MenderError::Session`] if the directory cannot be locked,
    /// or any I/O or serialization error.
    pub fn save(&self, report: &SessionReport) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(LOCK_FILE))?;
        FileExt::lock_exclusive(&lock_file).map_err(|e| MenderError::Session {
            message: format!("Failed to acquire report lock: {e}"),
        })?;

        let path = self.report_path(&report.id);
        save_atomic(&path, report)?;
        save_atomic(&self.latest_path(), report)?;
        debug!("Saved session report to {}", path.display());

        let _ = FileExt::unlock(&lock_file);
        Ok(path)
    }

    /// Load a report by id. Missing, corrupted, or incompatible files yield `None`.
    #[must_use]
    pub fn load(&self, id: &str) -> Option<SessionReport> {
        Self::read(&self.report_path(id))
    }

    #[must_use]
    pub fn load_latest(&self) -> Option<SessionReport> {
        Self::read(&self.latest_path())
    }

    fn read(path: &Path) -> Option<SessionReport> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read session report {}: {}", path.display(), e);
                return None;
            }
        };

        let report: SessionReport = match serde_json::from_str(&contents) {
            Ok(report) => report,
            Err(e) => {
                warn!("Corrupted session report at {}: {}", path.display(), e);
                return None;
            }
        };

        if report.version != SESSION_REPORT_VERSION {
            warn!(
                "Incompatible session report version {} (supported: {})",
                report.version, SESSION_REPORT_VERSION
            );
            return None;
        }
        Some(report)
    }
}
