//! Test fixtures for reproducible broken projects.
//!
//! Provides a small project with two failing tests and the patches that
//! fix them.

use std::path::{Path, PathBuf};
use tempfile::TempDir;

use super::mocks::FileCheckRunner;

/// Failure line for the broken `add`.
pub const ADD_FAILURE: &str =
    "FAILED test_calc.py::test_add - AssertionError: assert add(2, 2) == 4";

/// Failure line for the broken `mul`.
pub const MUL_FAILURE: &str =
    "FAILED test_calc.py::test_mul - AssertionError: assert mul(2, 3) == 6";

/// Patch that fixes `add`.
pub const FIX_ADD: &str = "\
--- a/calc.py
+++ b/calc.py
@@ -1,2 +1,2 @@
 def add(a, b):
-    return a - b
+    return a + b
";

/// Patch that fixes `mul`.
pub const FIX_MUL: &str = "\
--- a/calc.py
+++ b/calc.py
@@ -4,2 +4,2 @@
 def mul(a, b):
-    return a + b
+    return a * b
";

/// Patch whose context matches nothing in the project.
pub const STALE_PATCH: &str = "\
--- a/calc.py
+++ b/calc.py
@@ -1,2 +1,2 @@
 def add(x, y):
-    return x ^ y
+    return x + y
";

/// A temporary project directory, removed on drop.
///
/// # Example
///
/// ```rust,ignore
/// let fixture = TestFixture::broken_calculator();
/// let runner = fixture.runner();
/// assert!(!runner.run().await.passed);
/// ```
pub struct TestFixture {
    temp_dir: TempDir,
}

impl TestFixture {
    /// An empty project.
    ///
    /// # Panics
    ///
    /// Panics if temporary directory creation fails.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// `calc.py` with a broken `add` and a broken `mul`, plus its tests.
    ///
    /// # Panics
    ///
    /// Panics if file creation fails.
    #[must_use]
    pub fn broken_calculator() -> Self {
        let fixture = Self::empty();
        fixture
            .write_file("calc.py", Self::calc_content())
            .expect("Failed to write calc.py");
        fixture
            .write_file("test_calc.py", Self::test_content())
            .expect("Failed to write test_calc.py");
        fixture
    }

    /// Runner that fails each test until its fix is on disk.
    #[must_use]
    pub fn runner(&self) -> FileCheckRunner {
        FileCheckRunner::new(self.path())
            .with_check("calc.py", "def add(a, b):\n    return a + b", ADD_FAILURE)
            .with_check("calc.py", "def mul(a, b):\n    return a * b", MUL_FAILURE)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    #[must_use]
    pub fn path_buf(&self) -> PathBuf {
        self.temp_dir.path().to_path_buf()
    }

    /// Write a file relative to the project root, creating directories.
    pub fn write_file(&self, relative_path: &str, content: &str) -> std::io::Result<()> {
        let path = self.temp_dir.path().join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    pub fn read_file(&self, relative_path: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.temp_dir.path().join(relative_path))
    }

    #[must_use]
    pub fn calc_content() -> &'static str {
        "def add(a, b):\n    return a - b\n\ndef mul(a, b):\n    return a + b\n"
    }

    fn test_content() -> &'static str {
        r"from calc import add, mul


def test_add():
    assert add(2, 2) == 4


def test_mul():
    assert mul(2, 3) == 6
"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::UnifiedPatch;
    use crate::runner::TestRunner;

    #[tokio::test]
    async fn test_broken_calculator_fails_both_tests() {
        let fixture = TestFixture::broken_calculator();
        let run = fixture.runner().run().await;
        assert!(!run.passed);
        assert!(run.output.contains("test_add"));
        assert!(run.output.contains("test_mul"));
    }

    #[test]
    fn test_fix_patches_apply_to_fixture() {
        let fixture = TestFixture::broken_calculator();
        let original = fixture.read_file("calc.py").expect("read");
        for fix in [FIX_ADD, FIX_MUL] {
            let patch = UnifiedPatch::parse(fix).expect("parse");
            let updated = patch.files[0]
                .apply_to(Some(&original))
                .expect("apply")
                .expect("content");
            assert_ne!(updated, original);
        }
    }

    #[test]
    fn test_write_file_creates_directories() {
        let fixture = TestFixture::empty();
        fixture.write_file("a/b/c.txt", "nested").expect("write");
        assert_eq!(fixture.read_file("a/b/c.txt").expect("read"), "nested");
    }
}
