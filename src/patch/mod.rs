//! Unified diffs: parsing, inspection, and in-memory application.
//!
//! Candidate patches arrive as unified diffs. Backends, language models in
//! particular, are sloppy about hunk line counts, so the parser ignores the
//! counts and ends a hunk at the next header instead. Application is
//! all-or-nothing: every hunk of every file is resolved against the current
//! file contents in memory first, and only a fully resolved patch is handed
//! to the [`applier`] for writing.
//!
//! # Example
//!
//! ```rust
//! use mender::patch::UnifiedPatch;
//!
//! let diff = "--- a/calc.py\n+++ b/calc.py\n@@ -1,2 +1,2 @@\n def add(a, b):\n-    return a - b\n+    return a + b\n";
//! let patch = UnifiedPatch::parse(diff).unwrap();
//! assert_eq!(patch.target_files().len(), 1);
//! let updated = patch.files[0].apply_to(Some("def add(a, b):\n    return a - b\n")).unwrap();
//! assert_eq!(updated.as_deref(), Some("def add(a, b):\n    return a + b\n"));
//! ```

pub mod applier;
pub mod backup;

pub use applier::{PatchApplier, Verification};
pub use backup::{Backup, BackupReceipt, BackupStore};

use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{MenderError, Result};

/// One line inside a hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    /// Unchanged line, present before and after.
    Context(String),
    /// Line removed by the patch.
    Remove(String),
    /// Line added by the patch.
    Add(String),
}

/// A contiguous change within one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based line where the hunk starts in the old file (0 for empty files).
    pub old_start: usize,
    /// Body lines in order.
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// Lines the hunk expects to find (context + removed).
    #[must_use]
    pub fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    /// Lines the hunk leaves behind (context + added).
    #[must_use]
    pub fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }

    /// Added and removed line counts.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        self.lines.iter().fold((0, 0), |(a, r), l| match l {
            HunkLine::Add(_) => (a + 1, r),
            HunkLine::Remove(_) => (a, r + 1),
            HunkLine::Context(_) => (a, r),
        })
    }

    /// True when the hunk's result equals its input.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.old_lines() == self.new_lines()
    }
}

/// Changes to a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// Path before the change (`None` for file creation).
    pub old_path: Option<PathBuf>,
    /// Path after the change (`None` for deletion).
    pub new_path: Option<PathBuf>,
    /// Hunks in file order.
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    /// The path that is written (or deleted).
    #[must_use]
    pub fn target(&self) -> &Path {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_else(|| Path::new(""))
    }

    /// Whether the patch creates the file.
    #[must_use]
    pub fn is_creation(&self) -> bool {
        self.old_path.is_none()
    }

    /// Whether the patch deletes the file.
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.new_path.is_none()
    }

    /// Apply to the current content (`None` when the file does not exist).
    ///
    /// Returns the new content, or `None` when the file should be deleted.
    ///
    /// # Errors
    ///
    /// Returns [`MenderError::PatchConflict`] when a hunk cannot be located.
    pub fn apply_to(&self, current: Option<&str>) -> Result<Option<String>> {
        let target = self.target().to_path_buf();

        let original = match (current, self.is_creation()) {
            (Some(content), true) if !content.is_empty() => {
                return Err(MenderError::conflict(target, "file already exists"));
            }
            (Some(content), _) => content,
            (None, true) => "",
            (None, false) => return Err(MenderError::conflict(target, "file does not exist")),
        };

        let had_trailing_newline = original.is_empty() || original.ends_with('\n');
        let mut lines: Vec<String> = original.lines().map(str::to_string).collect();
        let mut shift: isize = 0;
        let mut min_pos = 0usize;

        for (index, hunk) in self.hunks.iter().enumerate() {
            let old = hunk.old_lines();
            let new: Vec<String> = hunk.new_lines().into_iter().map(str::to_string).collect();

            let expected = (hunk.old_start.saturating_sub(1) as isize + shift).max(0) as usize;
            let pos = locate(&lines, &old, expected, min_pos).ok_or_else(|| {
                MenderError::conflict(
                    target.clone(),
                    format!("hunk {} does not match (expected near line {})", index + 1, expected + 1),
                )
            })?;

            lines.splice(pos..pos + old.len(), new.iter().cloned());
            shift += new.len() as isize - old.len() as isize;
            min_pos = pos + new.len();
        }

        if self.is_deletion() {
            if lines.iter().any(|l| !l.trim().is_empty()) {
                return Err(MenderError::conflict(
                    target,
                    "deletion patch does not remove the whole file",
                ));
            }
            return Ok(None);
        }

        let mut out = lines.join("\n");
        if had_trailing_newline && !out.is_empty() {
            out.push('\n');
        }
        Ok(Some(out))
    }
}

/// Find where `needle` sits in `haystack`, searching outward from `expected`.
///
/// Exact matches win; a second pass ignores trailing whitespace.
fn locate(haystack: &[String], needle: &[&str], expected: usize, min_pos: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(expected.clamp(min_pos, haystack.len()));
    }
    if needle.len() > haystack.len() {
        return None;
    }
    let last = haystack.len() - needle.len();
    let expected = expected.clamp(min_pos.min(last), last);

    let exact = |pos: usize| haystack[pos..pos + needle.len()].iter().zip(needle).all(|(h, n)| h == n);
    let loose = |pos: usize| {
        haystack[pos..pos + needle.len()]
            .iter()
            .zip(needle)
            .all(|(h, n)| h.trim_end() == n.trim_end())
    };

    for matcher in [&exact as &dyn Fn(usize) -> bool, &loose] {
        for delta in 0..=last {
            let candidates = [expected.checked_add(delta), expected.checked_sub(delta)];
            for pos in candidates.into_iter().flatten() {
                if pos < min_pos || pos > last {
                    continue;
                }
                if matcher(pos) {
                    return Some(pos);
                }
            }
        }
    }
    None
}

fn hunk_header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(?P<old>\d+)(?:,\d+)? \+\d+(?:,\d+)? @@").expect("hunk header regex is valid")
    })
}

fn parse_path(raw: &str) -> Option<PathBuf> {
    // Drop trailing timestamps ("path\t2024-01-01 ...").
    let raw = raw.split('\t').next().unwrap_or_default().trim();
    if raw == "/dev/null" || raw.is_empty() {
        return None;
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(PathBuf::from(stripped))
}

/// A parsed multi-file unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedPatch {
    /// Per-file changes in the order they appear.
    pub files: Vec<FilePatch>,
}

impl UnifiedPatch {
    /// Parse diff text.
    ///
    /// # Errors
    ///
    /// Returns [`MenderError::MalformedPatch`] when no file header or no hunk
    /// is found, or a file header is incomplete.
    pub fn parse(text: &str) -> Result<Self> {
        let lines: Vec<&str> = text.lines().collect();
        let mut files: Vec<FilePatch> = Vec::new();
        let mut i = 0;

        let is_file_header = |idx: usize| {
            lines[idx].starts_with("--- ")
                && lines.get(idx + 1).is_some_and(|next| next.starts_with("+++ "))
        };

        while i < lines.len() {
            if !is_file_header(i) {
                if lines[i].starts_with("@@") && files.is_empty() {
                    return Err(MenderError::malformed_patch("hunk before any file header"));
                }
                i += 1;
                continue;
            }

            let old_path = parse_path(&lines[i][4..]);
            let new_path = parse_path(&lines[i + 1][4..]);
            if old_path.is_none() && new_path.is_none() {
                return Err(MenderError::malformed_patch(
                    "file header names /dev/null on both sides",
                ));
            }
            i += 2;

            let mut hunks = Vec::new();
            while i < lines.len() && !is_file_header(i) && !lines[i].starts_with("diff ") {
                let Some(caps) = hunk_header_re().captures(lines[i]) else {
                    i += 1;
                    continue;
                };
                let old_start = caps["old"].parse::<usize>().unwrap_or(0);
                i += 1;

                let mut body = Vec::new();
                let mut trailing_bare = 0usize;
                while i < lines.len() {
                    let line = lines[i];
                    if line.starts_with("@@") || line.starts_with("diff ") || is_file_header(i) {
                        break;
                    }
                    if let Some(rest) = line.strip_prefix('+') {
                        body.push(HunkLine::Add(rest.to_string()));
                        trailing_bare = 0;
                    } else if let Some(rest) = line.strip_prefix('-') {
                        body.push(HunkLine::Remove(rest.to_string()));
                        trailing_bare = 0;
                    } else if let Some(rest) = line.strip_prefix(' ') {
                        body.push(HunkLine::Context(rest.to_string()));
                        trailing_bare = 0;
                    } else if line.starts_with('\\') {
                        // "\ No newline at end of file"
                    } else if line.is_empty() {
                        body.push(HunkLine::Context(String::new()));
                        trailing_bare += 1;
                    } else {
                        break;
                    }
                    i += 1;
                }
                // Blank lines after the last real hunk line are separators, not context.
                body.truncate(body.len() - trailing_bare);

                if body.is_empty() {
                    return Err(MenderError::malformed_patch("empty hunk"));
                }
                hunks.push(Hunk {
                    old_start,
                    lines: body,
                });
            }

            if hunks.is_empty() {
                return Err(MenderError::malformed_patch(format!(
                    "no hunks for {}",
                    new_path
                        .as_ref()
                        .or(old_path.as_ref())
                        .map(|p| p.display().to_string())
                        .unwrap_or_default()
                )));
            }

            files.push(FilePatch {
                old_path,
                new_path,
                hunks,
            });
        }

        if files.is_empty() {
            return Err(MenderError::malformed_patch("no file headers found"));
        }
        Ok(Self { files })
    }

    /// Files the patch writes or deletes, relative to the project.
    #[must_use]
    pub fn target_files(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        for file in &self.files {
            let target = file.target().to_path_buf();
            if !out.contains(&target) {
                out.push(target);
            }
        }
        out
    }

    /// Total (added, removed) lines.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        self.files
            .iter()
            .flat_map(|f| &f.hunks)
            .map(Hunk::counts)
            .fold((0, 0), |(a, r), (ha, hr)| (a + ha, r + hr))
    }

    /// True when no hunk changes anything.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.files.iter().flat_map(|f| &f.hunks).all(Hunk::is_noop)
    }

    /// Added lines across all hunks.
    pub fn added_lines(&self) -> impl Iterator<Item = &str> {
        self.files.iter().flat_map(|f| &f.hunks).flat_map(|h| {
            h.lines.iter().filter_map(|l| match l {
                HunkLine::Add(s) => Some(s.as_str()),
                _ => None,
            })
        })
    }

    /// Removed lines across all hunks.
    pub fn removed_lines(&self) -> impl Iterator<Item = &str> {
        self.files.iter().flat_map(|f| &f.hunks).flat_map(|h| {
            h.lines.iter().filter_map(|l| match l {
                HunkLine::Remove(s) => Some(s.as_str()),
                _ => None,
            })
        })
    }
}

/// Reject absolute paths and `..` components.
///
/// # Errors
///
/// Returns [`MenderError::PathEscape`] for paths outside the project.
pub fn ensure_within_project(path: &Path) -> Result<()> {
    let escapes = path.is_absolute()
        || path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
    if escapes || path.as_os_str().is_empty() {
        return Err(MenderError::PathEscape {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}
