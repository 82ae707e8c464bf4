//! Locked, atomic JSON files for the learning store.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{MenderError, Result};

/// On-disk format version for every store file.
pub const STORE_VERSION: u32 = 1;

/// Lock file guarding all store files in a directory.
pub const LOCK_FILE: &str = "learning.lock";

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Store files carry a version so incompatible layouts can be discarded.
pub trait Versioned {
    fn version(&self) -> u32;
}

/// Held advisory lock; released when dropped.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn open_lock_file(dir: &Path) -> Result<File> {
    fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .read(true)
        .open(dir.join(LOCK_FILE))?;
    Ok(file)
}

/// Take the exclusive lock for a read-modify-write.
///
/// # Errors
///
/// Fails if the directory or lock file cannot be created or locked.
pub fn lock_exclusive(dir: &Path) -> Result<StoreLock> {
    let file = open_lock_file(dir)?;
    FileExt::lock_exclusive(&file)
        .map_err(|e| MenderError::store(format!("Failed to acquire store lock: {e}")))?;
    Ok(StoreLock { file })
}

/// Take a shared lock for reading.
///
/// # Errors
///
/// Fails if the directory or lock file cannot be created or locked.
pub fn lock_shared(dir: &Path) -> Result<StoreLock> {
    let file = open_lock_file(dir)?;
    FileExt::lock_shared(&file)
        .map_err(|e| MenderError::store(format!("Failed to acquire store lock: {e}")))?;
    Ok(StoreLock { file })
}

/// A loaded file plus a description of any corruption that was discarded.
#[derive(Debug)]
pub struct Loaded<T> {
    pub value: T,
    pub anomaly: Option<String>,
}

/// Read `path`, degrading to `T::default()` when the file is missing,
/// unreadable, malformed, or from an incompatible version.
///
/// Corrupt files are left in place; the next save overwrites them.
pub fn load_or_empty<T>(path: &Path) -> Loaded<T>
where
    T: DeserializeOwned + Default + Versioned,
{
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Loaded {
                value: T::default(),
                anomaly: None,
            }
        }
        Err(e) => return degraded(path, format!("unreadable: {e}")),
    };

    let value: T = match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(e) => return degraded(path, format!("corrupted: {e}")),
    };

    if value.version() != STORE_VERSION {
        return degraded(
            path,
            format!(
                "incompatible version {} (supported: {})",
                value.version(),
                STORE_VERSION
            ),
        );
    }

    Loaded {
        value,
        anomaly: None,
    }
}

fn degraded<T: Default>(path: &Path, problem: String) -> Loaded<T> {
    let anomaly = format!("{} is {}; starting fresh", path.display(), problem);
    warn!("{}", anomaly);
    Loaded {
        value: T::default(),
        anomaly: Some(anomaly),
    }
}

/// Write `value` as pretty JSON via a temp file and rename.
///
/// # Errors
///
/// Fails on serialization or I/O errors.
pub fn save_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = tmp_path_for(path);
    let json = serde_json::to_string_pretty(value)?;

    let mut tmp_file = File::create(&tmp_path)?;
    tmp_file.write_all(json.as_bytes())?;
    tmp_file.sync_all()?;

    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        version: u32,
        #[serde(default)]
        items: Vec<String>,
    }

    impl Default for Sample {
        fn default() -> Self {
            Self {
                version: STORE_VERSION,
                items: Vec::new(),
            }
        }
    }

    impl Versioned for Sample {
        fn version(&self) -> u32 {
            self.version
        }
    }

    #[test]
    fn test_missing_file_is_empty_without_anomaly() {
        let dir = TempDir::new().expect("temp dir");
        let loaded: Loaded<Sample> = load_or_empty(&dir.path().join("none.json"));
        assert_eq!(loaded.value, Sample::default());
        assert!(loaded.anomaly.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("nested/sample.json");
        let sample = Sample {
            version: STORE_VERSION,
            items: vec!["a".into()],
        };
        save_atomic(&path, &sample).expect("save");
        assert!(!tmp_path_for(&path).exists());

        let loaded: Loaded<Sample> = load_or_empty(&path);
        assert_eq!(loaded.value, sample);
    }

    #[test]
    fn test_corrupt_and_future_versions_degrade() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("sample.json");

        fs::write(&path, "not valid json {{{").expect("write");
        let loaded: Loaded<Sample> = load_or_empty(&path);
        assert_eq!(loaded.value, Sample::default());
        assert!(loaded.anomaly.expect("anomaly").contains("corrupted"));

        fs::write(&path, r#"{"version": 999, "items": ["x"]}"#).expect("write");
        let loaded: Loaded<Sample> = load_or_empty(&path);
        assert!(loaded.value.items.is_empty());
        assert!(loaded.anomaly.expect("anomaly").contains("incompatible"));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().expect("temp dir");
        {
            let _lock = lock_exclusive(dir.path()).expect("lock");
            assert!(dir.path().join(LOCK_FILE).exists());
        }
        let _again = lock_exclusive(dir.path()).expect("relock after drop");
    }
}
