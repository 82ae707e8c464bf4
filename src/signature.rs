//! Error signatures: the join key shared by every component.
//!
//! A signature is the SHA-256 of a normalized error message plus a snippet of
//! the code around the failure. Normalization strips the noise that changes
//! between otherwise identical runs (memory addresses, line/column numbers,
//! whitespace) so the same failure maps to the same signature across sessions.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::OnceLock;

use crate::error::MenderError;
use crate::parser::FailureRecord;

/// Separator between the error and context halves of the hashed material.
const CONTEXT_SEPARATOR: &str = "\n--context--\n";

/// Deterministic identifier for an (error, context) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorSignature(String);

impl ErrorSignature {
    /// Full hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for logs and terminal output.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for ErrorSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ErrorSignature {
    type Err = MenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(MenderError::InvalidSignature {
                value: s.to_string(),
            })
        }
    }
}

fn hex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"0x[0-9a-fA-F]+").expect("hex regex is valid"))
}

fn position_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(line \d+|:\d+:\d+|:\d+\b)").expect("position regex is valid")
    })
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex is valid"))
}

/// Normalize text before hashing.
#[must_use]
pub fn normalize(text: &str) -> String {
    let normalized = hex_re().replace_all(text, "0x_");
    let normalized = position_re().replace_all(&normalized, "");
    let normalized = whitespace_re().replace_all(&normalized, " ");
    normalized.trim().to_string()
}

/// Compute the signature for an error message and its code context.
///
/// Pure and deterministic: identical inputs always give identical output.
///
/// # Example
///
/// ```rust
/// use mender::signature::signature_of;
///
/// let a = signature_of("AssertionError: 1+1 != 3", "def test_add():");
/// let b = signature_of("AssertionError:   1+1 != 3 ", "def test_add():");
/// assert_eq!(a, b);
/// ```
#[must_use]
pub fn signature_of(error_message: &str, code_context: &str) -> ErrorSignature {
    let mut hasher = Sha256::new();
    hasher.update(normalize(error_message).as_bytes());
    hasher.update(CONTEXT_SEPARATOR.as_bytes());
    hasher.update(normalize(code_context).as_bytes());
    ErrorSignature(hex::encode(hasher.finalize()))
}

/// Extract the code surrounding a failure.
///
/// Looks for the first line mentioning the test name and returns `radius`
/// lines either side; falls back to the head of the file. Unreadable files
/// give an empty context so a signature can still be formed from the error
/// alone.
#[must_use]
pub fn code_context(
    project_dir: &Path,
    record: &FailureRecord,
    radius: usize,
    max_bytes: usize,
) -> String {
    let path = if record.source_file.is_absolute() {
        record.source_file.clone()
    } else {
        project_dir.join(&record.source_file)
    };

    let Ok(content) = std::fs::read_to_string(&path) else {
        return String::new();
    };

    let lines: Vec<&str> = content.lines().collect();
    // Parametrised / nested names: match on the last path segment without brackets.
    let needle = record
        .test_name
        .rsplit("::")
        .next()
        .unwrap_or(&record.test_name)
        .split('[')
        .next()
        .unwrap_or_default();

    let (start, end) = match lines
        .iter()
        .position(|l| !needle.is_empty() && l.contains(needle))
    {
        Some(idx) => (idx.saturating_sub(radius), (idx + radius + 1).min(lines.len())),
        None => (0, (radius * 2).min(lines.len())),
    };

    truncate_on_char_boundary(&lines[start..end].join("\n"), max_bytes)
}

fn truncate_on_char_boundary(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Signature for a parsed failure, reading its context from disk.
#[must_use]
pub fn signature_for(
    project_dir: &Path,
    record: &FailureRecord,
    radius: usize,
    max_bytes: usize,
) -> (ErrorSignature, String) {
    let context = code_context(project_dir, record, radius, max_bytes);
    (signature_of(&record.error_message, &context), context)
}
