//! Prompt text handed to command backends.
//!
//! Sections are plain markdown so any model-backed command can read them.
//! Backends that are not models (scripts, heuristics) are free to ignore
//! the prompt entirely.

use super::FixRequest;

/// Builds the individual prompt sections.
pub struct SectionBuilder;

impl SectionBuilder {
    /// Failure details.
    ///
    /// ```
    /// use mender::backend::{FixRequest, prompt::SectionBuilder};
    /// use mender::parser::FailureRecord;
    ///
    /// let record = FailureRecord::new("tests/test_calc.py", "test_add", "AssertionError: 1+1 != 3");
    /// let section = SectionBuilder::build_failure_section(&FixRequest::from_failure(&record, ""));
    /// assert!(section.contains("## Failing Test"));
    /// assert!(section.contains("test_add"));
    /// ```
    #[must_use]
    pub fn build_failure_section(request: &FixRequest) -> String {
        let mut lines = vec![
            "## Failing Test".to_string(),
            String::new(),
            format!("**File:** `{}`", request.test_file.display()),
            format!("**Test:** `{}`", request.test_name),
            format!("**Kind:** {}", request.kind.description()),
            String::new(),
            "```text".to_string(),
            request.error_message.trim_end().to_string(),
            "```".to_string(),
        ];
        lines.push(String::new());
        lines.join("\n")
    }

    #[must_use]
    pub fn build_context_section(request: &FixRequest) -> String {
        if request.code_context.trim().is_empty() {
            return String::new();
        }
        let lines = vec![
            "## Code Context".to_string(),
            String::new(),
            "```".to_string(),
            request.code_context.trim_end().to_string(),
            "```".to_string(),
            String::new(),
        ];
        lines.join("\n")
    }

    /// Earlier patches for the same signature that failed verification.
    #[must_use]
    pub fn build_history_section(request: &FixRequest) -> String {
        if request.failed_patches.is_empty() {
            return String::new();
        }

        let mut lines = vec![
            "## Patches That Already Failed".to_string(),
            String::new(),
            "Do not repeat these.".to_string(),
        ];
        for (i, patch) in request.failed_patches.iter().enumerate() {
            lines.push(String::new());
            lines.push(format!("### Attempt {}", i + 1));
            lines.push("```diff".to_string());
            lines.push(patch.trim_end().to_string());
            lines.push("```".to_string());
        }
        lines.push(String::new());
        lines.join("\n")
    }

    #[must_use]
    pub fn build_refinement_section(request: &FixRequest) -> String {
        let Some(previous) = &request.previous_patch else {
            return String::new();
        };

        let mut lines = vec![
            "## Refine The Previous Patch".to_string(),
            String::new(),
            "```diff".to_string(),
            previous.trim_end().to_string(),
            "```".to_string(),
        ];
        if let Some(feedback) = request.feedback.as_deref().filter(|f| !f.trim().is_empty()) {
            lines.push(String::new());
            lines.push("**Why it was rejected:**".to_string());
            lines.push(String::new());
            lines.push("```text".to_string());
            lines.push(feedback.trim_end().to_string());
            lines.push("```".to_string());
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Assemble the complete prompt for a request.
#[must_use]
pub fn build_prompt(request: &FixRequest) -> String {
    let sections = [
        "# Fix A Failing Test\n\nProduce the smallest source change that makes the failing test pass without weakening the test.\n".to_string(),
        SectionBuilder::build_failure_section(request),
        SectionBuilder::build_context_section(request),
        SectionBuilder::build_history_section(request),
        SectionBuilder::build_refinement_section(request),
        "## Output Format\n\nReply with a single unified diff inside a ```diff fenced block. Paths are relative to the project root.\n".to_string(),
    ];

    sections
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
