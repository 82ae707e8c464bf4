//! Failure parsing for raw test-runner output.
//!
//! Test commands print failures in many shapes. This module turns raw output
//! into [`FailureRecord`]s by running every known dialect over the text and
//! merging what they find. Parsing is best-effort: unrecognised output yields
//! an empty list rather than an error, and the orchestrator treats an empty
//! list from a failing run as "undiagnosable".
//!
//! # Dialects
//!
//! - **Simple**: one failure per line, `FAILED <file>::<test> - <message>`
//!   (markers `FAILED`, `FAIL`, `ERROR`; separator ` - `).
//! - **Structured**: key-delimited blocks of `File:`, `Test:` and `Error:`
//!   lines, in any order, with the message allowed to continue on the
//!   following lines.
//! - **Cargo**: `---- name stdout ----` sections containing a
//!   `thread 'name' panicked at file:line:col:` line.
//!
//! # Example
//!
//! ```rust
//! use mender::parser::FailureParser;
//!
//! let output = "FAILED mod_a.py::test_add - AssertionError: 1+1 != 3\n";
//! let failures = FailureParser::new().parse(output);
//! assert_eq!(failures.len(), 1);
//! assert_eq!(failures[0].test_name, "test_add");
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::debug;

// ============================================================================
// Failure Records
// ============================================================================

/// Coarse classification of a failure's error text.
///
/// Only used for prompts and reporting; control flow never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Assertion or expectation mismatch
    Assertion,
    /// Import / module resolution failure
    Import,
    /// Syntax or parse error in source
    Syntax,
    /// Type or attribute error
    Type,
    /// Panic or uncaught exception
    Panic,
    /// Test timed out
    Timeout,
    /// Nothing matched
    #[default]
    Unknown,
}

impl FailureKind {
    /// Human-readable description.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Assertion => "Assertion failure",
            Self::Import => "Import error",
            Self::Syntax => "Syntax error",
            Self::Type => "Type error",
            Self::Panic => "Panic / uncaught exception",
            Self::Timeout => "Timeout",
            Self::Unknown => "Unknown error",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// A single failing test extracted from runner output.
///
/// Records are created fresh on every test run and are never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// File the failure is attributed to (usually the test file).
    pub source_file: PathBuf,
    /// Name of the failing test.
    pub test_name: String,
    /// Error message reported for the failure.
    pub error_message: String,
    /// Classification of the error message.
    #[serde(default)]
    pub kind: FailureKind,
}

impl FailureRecord {
    /// Create a record, classifying the message.
    pub fn new(
        source_file: impl Into<PathBuf>,
        test_name: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        let error_message = error_message.into();
        let kind = FailureClassifier::global().classify(&error_message);
        Self {
            source_file: source_file.into(),
            test_name: test_name.into(),
            error_message,
            kind,
        }
    }

    /// Whether two records describe the same failing test.
    #[must_use]
    pub fn same_test(&self, other: &FailureRecord) -> bool {
        self.source_file == other.source_file && self.test_name == other.test_name
    }

    /// One-line summary for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        let first_line = self.error_message.lines().next().unwrap_or_default();
        format!(
            "{}::{} - {}",
            self.source_file.display(),
            self.test_name,
            first_line
        )
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Regex-based classifier for error messages.
///
/// Patterns are ordered from most specific to least specific.
#[derive(Debug)]
pub struct FailureClassifier {
    patterns: Vec<(Regex, FailureKind)>,
}

impl FailureClassifier {
    /// Create a classifier with the default pattern table.
    #[must_use]
    pub fn new() -> Self {
        let patterns = vec![
            // Timeouts first, they often mention other errors in passing
            (r"(?i)timed? ?out", FailureKind::Timeout),
            (r"(?i)deadline exceeded", FailureKind::Timeout),
            // Imports before generic errors
            (r"ModuleNotFoundError", FailureKind::Import),
            (r"ImportError", FailureKind::Import),
            (r"unresolved import", FailureKind::Import),
            (r"(?i)cannot find module", FailureKind::Import),
            // Syntax
            (r"SyntaxError", FailureKind::Syntax),
            (r"IndentationError", FailureKind::Syntax),
            (r"(?i)unexpected token", FailureKind::Syntax),
            (r"expected .+, found .+", FailureKind::Syntax),
            // Types
            (r"TypeError", FailureKind::Type),
            (r"AttributeError", FailureKind::Type),
            (r"NameError", FailureKind::Type),
            (r"mismatched types", FailureKind::Type),
            (r"error\[E\d+\]", FailureKind::Type),
            // Assertions
            (r"AssertionError", FailureKind::Assertion),
            (r"assertion .*failed", FailureKind::Assertion),
            (r"(?i)expected .+ (to equal|but got|received)", FailureKind::Assertion),
            (r"left: .+", FailureKind::Assertion),
            // Generic panics / exceptions last
            (r"panicked at", FailureKind::Panic),
            (r"Traceback \(most recent call last\)", FailureKind::Panic),
            (r"\b[A-Z][A-Za-z]+(Error|Exception):", FailureKind::Panic),
        ];

        let compiled = patterns
            .into_iter()
            .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|re| (re, kind)))
            .collect();

        Self { patterns: compiled }
    }

    /// Shared instance so records can classify without recompiling.
    pub fn global() -> &'static FailureClassifier {
        static CLASSIFIER: OnceLock<FailureClassifier> = OnceLock::new();
        CLASSIFIER.get_or_init(FailureClassifier::new)
    }

    /// Classify an error message.
    #[must_use]
    pub fn classify(&self, message: &str) -> FailureKind {
        self.patterns
            .iter()
            .find(|(re, _)| re.is_match(message))
            .map(|(_, kind)| *kind)
            .unwrap_or(FailureKind::Unknown)
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Dialects
// ============================================================================

/// Output dialects understood by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `FAILED file::test - message`
    Simple,
    /// `File:` / `Test:` / `Error:` blocks
    Structured,
    /// `cargo test` panic sections
    Cargo,
}

impl Dialect {
    /// All dialects in the order they are tried.
    #[must_use]
    pub fn all() -> [Dialect; 3] {
        [Dialect::Simple, Dialect::Structured, Dialect::Cargo]
    }
}

fn simple_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:FAILED|FAIL|ERROR)[:\s]\s*(?P<file>[^\s:][^\s]*?)::(?P<test>\S+?)(?:\s+-\s+(?P<msg>.*))?\s*$")
            .expect("simple dialect regex is valid")
    })
}

fn structured_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?P<key>file|test|error)\s*:\s*(?P<value>.*?)\s*$")
            .expect("structured dialect regex is valid")
    })
}

fn cargo_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^---- (?P<test>\S+) stdout ----\s*$").expect("cargo header regex is valid")
    })
}

fn cargo_panic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^thread '(?P<test>[^']+)' panicked at (?P<file>[^:\s]+):\d+(?::\d+)?:?\s*(?P<msg>.*)$")
            .expect("cargo panic regex is valid")
    })
}

const DEFAULT_MESSAGE: &str = "test failed";

/// Parse the simple marker + separator dialect.
#[must_use]
pub fn parse_simple(output: &str) -> Vec<FailureRecord> {
    output
        .lines()
        .filter_map(|line| {
            let caps = simple_line_re().captures(line)?;
            let message = caps
                .name("msg")
                .map(|m| m.as_str().trim())
                .filter(|m| !m.is_empty())
                .unwrap_or(DEFAULT_MESSAGE);
            Some(FailureRecord::new(&caps["file"], &caps["test"], message))
        })
        .collect()
}

/// Parse the key-delimited structured dialect.
#[must_use]
pub fn parse_structured(output: &str) -> Vec<FailureRecord> {
    #[derive(Default)]
    struct Block {
        file: Option<String>,
        test: Option<String>,
        error: Option<String>,
    }

    impl Block {
        fn take_record(&mut self) -> Option<FailureRecord> {
            if self.file.is_some() && self.test.is_some() && self.error.is_some() {
                let block = std::mem::take(self);
                Some(FailureRecord::new(
                    block.file.unwrap_or_default(),
                    block.test.unwrap_or_default(),
                    block.error.unwrap_or_default(),
                ))
            } else {
                None
            }
        }
    }

    let mut records = Vec::new();
    let mut block = Block::default();
    let mut in_message = false;

    for line in output.lines() {
        if let Some(caps) = structured_key_re().captures(line) {
            let value = caps["value"].to_string();
            let key = caps["key"].to_ascii_lowercase();

            // A repeated key means a new block started before the old one finished.
            let repeated = match key.as_str() {
                "file" => block.file.is_some(),
                "test" => block.test.is_some(),
                _ => block.error.is_some(),
            };
            if repeated {
                if let Some(record) = block.take_record() {
                    records.push(record);
                }
                block = Block::default();
            }

            in_message = key == "error";
            match key.as_str() {
                "file" => block.file = Some(value),
                "test" => block.test = Some(value),
                _ => block.error = Some(value),
            }
            continue;
        }

        if line.trim().is_empty() {
            in_message = false;
            match block.take_record() {
                Some(record) => records.push(record),
                None => block = Block::default(),
            }
            continue;
        }

        if in_message {
            if let Some(ref mut error) = block.error {
                error.push('\n');
                error.push_str(line.trim_end());
            }
        }
    }

    if let Some(record) = block.take_record() {
        records.push(record);
    }

    records
}

/// Parse `cargo test` panic sections.
#[must_use]
pub fn parse_cargo(output: &str) -> Vec<FailureRecord> {
    let mut records = Vec::new();
    let mut lines = output.lines().peekable();

    while let Some(line) = lines.next() {
        let Some(header) = cargo_header_re().captures(line) else {
            continue;
        };
        let test = header["test"].to_string();

        while let Some(next) = lines.peek() {
            if cargo_header_re().is_match(next) {
                break;
            }
            let next = lines.next().unwrap_or_default();
            let Some(caps) = cargo_panic_re().captures(next) else {
                continue;
            };

            // Message is either on the panic line (older toolchains) or the lines after it.
            let mut message = caps["msg"].trim().to_string();
            if message.is_empty() {
                let mut body = Vec::new();
                while let Some(follow) = lines.peek() {
                    if follow.trim().is_empty()
                        || follow.starts_with("note:")
                        || cargo_header_re().is_match(follow)
                    {
                        break;
                    }
                    body.push(lines.next().unwrap_or_default().trim_end());
                }
                message = body.join("\n");
            }
            if message.is_empty() {
                message = DEFAULT_MESSAGE.to_string();
            }

            records.push(FailureRecord::new(&caps["file"], test.clone(), message));
            break;
        }
    }

    records
}

// ============================================================================
// Parser
// ============================================================================

/// Multi-dialect failure parser.
#[derive(Debug, Clone)]
pub struct FailureParser {
    dialects: Vec<Dialect>,
}

impl Default for FailureParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FailureParser {
    /// Parser that tries every dialect.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dialects: Dialect::all().to_vec(),
        }
    }

    /// Restrict the parser to the given dialects.
    #[must_use]
    pub fn with_dialects(dialects: &[Dialect]) -> Self {
        Self {
            dialects: dialects.to_vec(),
        }
    }

    /// Parse raw output into failure records.
    ///
    /// Records are de-duplicated on (file, test, message) and keep the order
    /// in which the dialects produced them.
    #[must_use]
    pub fn parse(&self, output: &str) -> Vec<FailureRecord> {
        if output.trim().is_empty() {
            return Vec::new();
        }

        let mut seen = HashSet::new();
        let mut records = Vec::new();

        for dialect in &self.dialects {
            let found = match dialect {
                Dialect::Simple => parse_simple(output),
                Dialect::Structured => parse_structured(output),
                Dialect::Cargo => parse_cargo(output),
            };
            debug!("{:?} dialect produced {} failure(s)", dialect, found.len());

            for record in found {
                let key = (
                    record.source_file.clone(),
                    record.test_name.clone(),
                    record.error_message.clone(),
                );
                if seen.insert(key) {
                    records.push(record);
                }
            }
        }

        records
    }
}
