//! Structural validation of extracted page content.
//!
//! The validator does not judge whether the model read the form correctly,
//! only whether the output looks like a transcription at all: not empty,
//! not a refusal, no mojibake, no radio group with two selections.
//! A page is valid iff it has zero [`Severity::Error`] issues.

use crate::config::ValidationConfig;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Fewer non-whitespace characters than this counts as empty.
const NEAR_EMPTY_CHARS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Machine-readable issue code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    EmptyOutput,
    ShortOutput,
    MissingField,
    NoFieldsDetected,
    HallucinationDetected,
    EncodingIssue,
    MultipleRadioSelected,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::EmptyOutput => "EMPTY_OUTPUT",
            IssueCode::ShortOutput => "SHORT_OUTPUT",
            IssueCode::MissingField => "MISSING_FIELD",
            IssueCode::NoFieldsDetected => "NO_FIELDS_DETECTED",
            IssueCode::HallucinationDetected => "HALLUCINATION_DETECTED",
            IssueCode::EncodingIssue => "ENCODING_ISSUE",
            IssueCode::MultipleRadioSelected => "MULTIPLE_RADIO_SELECTED",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub code: IssueCode,
    pub message: String,
    /// `Page 5`, or `Page 5, line 12` when a line is known.
    pub location: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationStats {
    pub length: usize,
    pub lines: usize,
    /// Distinct field identifiers such as `1.2`.
    pub field_ids: usize,
    pub radio_options: usize,
    pub checkbox_options: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
    pub stats: ValidationStats,
}

impl ValidationResult {
    fn new(stats: ValidationStats) -> Self {
        Self {
            is_valid: true,
            issues: Vec::new(),
            stats,
        }
    }

    fn add(&mut self, severity: Severity, code: IssueCode, message: String, location: &str) {
        if severity == Severity::Error {
            self.is_valid = false;
        }
        self.issues.push(ValidationIssue {
            severity,
            code,
            message,
            location: location.to_string(),
        });
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn has(&self, code: IssueCode) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }

    /// `Valid: false, Errors: 1, Warnings: 2`
    pub fn summary(&self) -> String {
        format!(
            "Valid: {}, Errors: {}, Warnings: {}",
            self.is_valid,
            self.errors().count(),
            self.warnings().count()
        )
    }

    /// Codes of every ERROR issue, comma separated.
    pub fn error_codes(&self) -> String {
        self.errors()
            .map(|i| i.code.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Combined view over many pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverallValidation {
    pub is_valid: bool,
    pub pages_validated: usize,
    pub pages_with_errors: usize,
    pub total_errors: usize,
    pub total_warnings: usize,
    pub issues: Vec<ValidationIssue>,
}

// ── Patterns ─────────────────────────────────────────────────────────────

static RE_FIELD_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+\.\d+\b").unwrap());

static RE_RADIO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*(?:[-*+][ \t]+)?(?:\([x ]\)|[●○◉◯])").unwrap());

static RE_CHECKBOX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*(?:[-*+][ \t]+)?(?:\[[x ]\]|[☒☑☐□✓✔])").unwrap());

static HALLUCINATION_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"I cannot\s+", "refusal"),
        (r"I['’]m unable\s+", "refusal"),
        (r"As an AI\s+", "model self-reference"),
        (r"I don['’]t have access\s+", "limitation statement"),
        (r"unfortunately\s+", "apologetic language"),
        (r"\[placeholder\]", "placeholder text"),
        (r"\[insert\s+", "insert placeholder"),
        (r"lorem ipsum", "lorem ipsum placeholder"),
    ]
    .into_iter()
    .map(|(p, d)| {
        (
            RegexBuilder::new(p).case_insensitive(true).build().unwrap(),
            d,
        )
    })
    .collect()
});

static ENCODING_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"\x{FFFD}", "replacement character"),
        (r"\\u[0-9a-fA-F]{4}", "escaped unicode"),
        (r"&[a-z]+;", "HTML entity"),
    ]
    .into_iter()
    .map(|(p, d)| (Regex::new(p).unwrap(), d))
    .collect()
});

// ── Validator ────────────────────────────────────────────────────────────

/// Validates one page of extracted content at a time.
#[derive(Debug, Clone)]
pub struct OutputValidator {
    min_content_length: usize,
    expected_field_ids: Vec<String>,
    strict: bool,
}

impl Default for OutputValidator {
    fn default() -> Self {
        Self::from_config(&ValidationConfig::default())
    }
}

impl OutputValidator {
    pub fn from_config(config: &ValidationConfig) -> Self {
        Self {
            min_content_length: config.min_content_length,
            expected_field_ids: config.expected_field_ids.clone(),
            strict: config.strict,
        }
    }

    /// Run every check against `content`, in order.
    pub fn validate(&self, content: &str, page: usize) -> ValidationResult {
        let location = format!("Page {page}");
        let trimmed = content.trim();
        let field_ids: BTreeSet<&str> = RE_FIELD_ID.find_iter(content).map(|m| m.as_str()).collect();

        let mut result = ValidationResult::new(ValidationStats {
            length: content.chars().count(),
            lines: content.lines().count(),
            field_ids: field_ids.len(),
            radio_options: RE_RADIO.find_iter(content).count(),
            checkbox_options: RE_CHECKBOX.find_iter(content).count(),
        });

        // 1. empty
        if trimmed.chars().filter(|c| !c.is_whitespace()).count() < NEAR_EMPTY_CHARS {
            result.add(
                Severity::Error,
                IssueCode::EmptyOutput,
                "Output is empty".into(),
                &location,
            );
            return result;
        }

        // 2. short
        let len = trimmed.chars().count();
        if len < self.min_content_length {
            result.add(
                if self.strict { Severity::Error } else { Severity::Warning },
                IssueCode::ShortOutput,
                format!(
                    "Output is very short ({len} chars, expected >= {})",
                    self.min_content_length
                ),
                &location,
            );
        }

        // 3. field ids
        for expected in &self.expected_field_ids {
            if !field_ids.contains(expected.as_str()) {
                result.add(
                    Severity::Warning,
                    IssueCode::MissingField,
                    format!("Expected field {expected} not found"),
                    &location,
                );
            }
        }
        if field_ids.is_empty() {
            result.add(
                Severity::Info,
                IssueCode::NoFieldsDetected,
                "No numbered field identifiers found".into(),
                &location,
            );
        }

        // 4. refusals and placeholders
        for (re, description) in HALLUCINATION_PATTERNS.iter() {
            if re.is_match(content) {
                result.add(
                    Severity::Error,
                    IssueCode::HallucinationDetected,
                    format!("Suspicious pattern found: {description}"),
                    &location,
                );
            }
        }

        // 5. encoding artefacts
        for (re, description) in ENCODING_PATTERNS.iter() {
            let n = re.find_iter(content).count();
            if n > 0 {
                result.add(
                    Severity::Warning,
                    IssueCode::EncodingIssue,
                    format!("{description} found ({n} occurrences)"),
                    &location,
                );
            }
        }

        // 6. exclusive choice groups
        for (line, selected) in multiply_selected_radio_groups(content) {
            result.add(
                Severity::Warning,
                IssueCode::MultipleRadioSelected,
                format!("Radio group has {selected} selected options (should be 0 or 1)"),
                &format!("{location}, line {line}"),
            );
        }

        result
    }

    /// Validate several pages, keyed by page number.
    pub fn validate_batch<'a>(
        &self,
        pages: impl IntoIterator<Item = (usize, &'a str)>,
    ) -> BTreeMap<usize, ValidationResult> {
        pages
            .into_iter()
            .map(|(page, content)| (page, self.validate(content, page)))
            .collect()
    }

    pub fn overall(results: &BTreeMap<usize, ValidationResult>) -> OverallValidation {
        OverallValidation {
            is_valid: results.values().all(|r| r.is_valid),
            pages_validated: results.len(),
            pages_with_errors: results.values().filter(|r| !r.is_valid).count(),
            total_errors: results.values().map(|r| r.errors().count()).sum(),
            total_warnings: results.values().map(|r| r.warnings().count()).sum(),
            issues: results.values().flat_map(|r| r.issues.iter().cloned()).collect(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RadioLine {
    Selected,
    Unselected,
    Other,
}

fn radio_line(line: &str) -> RadioLine {
    let line = line.trim_start();
    let line = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| line.strip_prefix("+ "))
        .map(str::trim_start)
        .unwrap_or(line);
    if line.starts_with("(x)") || line.starts_with('●') || line.starts_with('◉') {
        RadioLine::Selected
    } else if line.starts_with("( )") || line.starts_with('○') || line.starts_with('◯') {
        RadioLine::Unselected
    } else {
        RadioLine::Other
    }
}

/// `(first line of group, selected count)` for each contiguous run of radio
/// lines with more than one selection. Line numbers are 1-indexed.
fn multiply_selected_radio_groups(content: &str) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut group: Option<(usize, usize)> = None;

    for (idx, line) in content.lines().chain(std::iter::once("")).enumerate() {
        match radio_line(line) {
            RadioLine::Other => {
                if let Some((start, selected)) = group.take() {
                    if selected > 1 {
                        out.push((start, selected));
                    }
                }
            }
            kind => {
                let (_, selected) = group.get_or_insert((idx + 1, 0));
                if kind == RadioLine::Selected {
                    *selected += 1;
                }
            }
        }
    }
    out
}
