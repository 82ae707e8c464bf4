//! Controllable test doubles for the test runner and fix backends.
//!
//! These mocks let the applier, registry and orchestrator be exercised
//! deterministically, without spawning processes or calling models.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::backend::{FixBackend, FixRequest};
use crate::error::{MenderError, Result};
use crate::runner::{TestRun, TestRunner};

/// Test runner that replays a fixed script of runs.
///
/// Once the script is exhausted the last run repeats; an empty script
/// always passes.
///
/// # Example
///
/// ```rust,ignore
/// let runner = ScriptedTestRunner::new(vec![
///     TestRun::fail("FAILED test_calc.py::test_add - AssertionError"),
///     TestRun::pass("1 passed"),
/// ]);
/// ```
#[derive(Debug)]
pub struct ScriptedTestRunner {
    runs: Mutex<VecDeque<TestRun>>,
    last: Mutex<Option<TestRun>>,
    call_count: AtomicU32,
    stall: Option<(u32, Duration)>,
}

impl ScriptedTestRunner {
    #[must_use]
    pub fn new(runs: Vec<TestRun>) -> Self {
        Self {
            runs: Mutex::new(runs.into()),
            last: Mutex::new(None),
            call_count: AtomicU32::new(0),
            stall: None,
        }
    }

    /// Sleep for `delay` before answering the `call`-th run (1-based).
    #[must_use]
    pub fn with_stall(mut self, call: u32, delay: Duration) -> Self {
        self.stall = Some((call, delay));
        self
    }

    /// Number of times the suite was "run".
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestRunner for ScriptedTestRunner {
    async fn run(&self) -> TestRun {
        let call = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((stalled, delay)) = self.stall {
            if stalled == call {
                tokio::time::sleep(delay).await;
            }
        }
        let next = self.runs.lock().ok().and_then(|mut runs| runs.pop_front());
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match next {
            Some(run) => {
                *last = Some(run.clone());
                run
            }
            None => last
                .clone()
                .unwrap_or_else(|| TestRun::pass("all tests passed")),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// One expectation checked by [`FileCheckRunner`].
#[derive(Debug, Clone)]
struct FileCheck {
    file: PathBuf,
    needle: String,
    failure_line: String,
}

/// Test runner that inspects real files on disk.
///
/// Each check passes when `file` contains `needle`; a failing check emits its
/// failure line, so the output looks like a real suite's.
///
/// # Example
///
/// ```rust,ignore
/// let runner = FileCheckRunner::new(dir.path()).with_check(
///     "calc.py",
///     "return a + b",
///     "FAILED test_calc.py::test_add - AssertionError: add(1, 1) == 0",
/// );
/// ```
#[derive(Debug)]
pub struct FileCheckRunner {
    project_dir: PathBuf,
    checks: Vec<FileCheck>,
    call_count: AtomicU32,
}

impl FileCheckRunner {
    #[must_use]
    pub fn new(project_dir: impl AsRef<Path>) -> Self {
        Self {
            project_dir: project_dir.as_ref().to_path_buf(),
            checks: Vec::new(),
            call_count: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_check(mut self, file: &str, needle: &str, failure_line: &str) -> Self {
        self.checks.push(FileCheck {
            file: PathBuf::from(file),
            needle: needle.to_string(),
            failure_line: failure_line.to_string(),
        });
        self
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestRunner for FileCheckRunner {
    async fn run(&self) -> TestRun {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let failures: Vec<&str> = self
            .checks
            .iter()
            .filter(|check| {
                let content =
                    std::fs::read_to_string(self.project_dir.join(&check.file)).unwrap_or_default();
                !content.contains(&check.needle)
            })
            .map(|check| check.failure_line.as_str())
            .collect();

        if failures.is_empty() {
            TestRun::pass(format!("{} passed", self.checks.len()))
        } else {
            TestRun::fail(format!("{}\n{} failed", failures.join("\n"), failures.len()))
        }
    }

    fn describe(&self) -> String {
        format!("file checks ({})", self.checks.len())
    }
}

/// Fix backend returning queued patches.
///
/// An exhausted queue yields an empty string, which the registry treats as
/// "nothing to offer".
///
/// # Example
///
/// ```rust,ignore
/// let backend = MockFixBackend::new("local").with_patches(vec![FIX_ADD]);
/// assert_eq!(backend.generate(&request).await.unwrap(), FIX_ADD);
/// ```
#[derive(Debug)]
pub struct MockFixBackend {
    name: String,
    patches: Mutex<VecDeque<String>>,
    error: Option<String>,
    delay: Option<Duration>,
    timeout: Duration,
    call_count: AtomicU32,
    last_request: Mutex<Option<FixRequest>>,
}

impl MockFixBackend {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            patches: Mutex::new(VecDeque::new()),
            error: None,
            delay: None,
            timeout: Duration::from_secs(5),
            call_count: AtomicU32::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Patches returned by successive calls.
    #[must_use]
    pub fn with_patches(self, patches: Vec<&str>) -> Self {
        if let Ok(mut queue) = self.patches.lock() {
            queue.extend(patches.into_iter().map(str::to_string));
        }
        self
    }

    /// Fail every call with `error`.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Sleep before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of generate/refine calls received.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// The most recent request, with any refinement folded in.
    pub fn last_request(&self) -> Option<FixRequest> {
        self.last_request.lock().ok().and_then(|r| r.clone())
    }
}

#[async_trait]
impl FixBackend for MockFixBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &FixRequest) -> Result<String> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some(request.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = &self.error {
            return Err(MenderError::backend(&self.name, error));
        }
        Ok(self
            .patches
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or_default())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
