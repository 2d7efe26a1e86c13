//! Output types: per-page records, usage accounting and batch results.
//!
//! A [`Page`] is created once per selected page at classification time and
//! completed exactly once by the extraction step. [`BatchResult`] is only
//! built when a run has at least one failed page; it keeps every page that
//! did succeed so a caller can still use them.

use crate::error::{ErrorKind, PageError};
use crate::pipeline::validate::ValidationResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Placeholder body emitted for pages with no content at all.
pub const EMPTY_PAGE_CONTENT: &str = "[This page is empty]";

/// How a page is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PageClass {
    /// Selectable text, no interactive fields. Extracted locally.
    Text,
    /// Carries interactive widgets. Sent to the vision model.
    Form,
    /// Neither text nor widgets.
    Empty,
}

impl PageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageClass::Text => "TEXT",
            PageClass::Form => "FORM",
            PageClass::Empty => "EMPTY",
        }
    }
}

impl fmt::Display for PageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a page inside one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PageState {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
}

/// The strategy that produced a page's final content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionMethod {
    TextExtraction,
    AiVision,
    /// Model output failed validation and was replaced by local text.
    AiFallbackToText,
    Empty,
}

impl ExtractionMethod {
    pub fn label(&self) -> &'static str {
        match self {
            ExtractionMethod::TextExtraction => "TEXT-EXTRACTION",
            ExtractionMethod::AiVision => "AI-VISION-EXTRACTION",
            ExtractionMethod::AiFallbackToText => "AI-FALLBACK-TO-TEXT",
            ExtractionMethod::Empty => "EMPTY",
        }
    }
}

// ── Usage ────────────────────────────────────────────────────────────────

const NANOS_PER_DOLLAR: f64 = 1_000_000_000.0;

/// Token and cost totals.
///
/// Cost is kept in integer nano-dollars so that combining accumulators is
/// exactly associative and commutative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsageAccumulator {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanos: u64,
}

impl UsageAccumulator {
    pub fn new(input_tokens: u64, output_tokens: u64, cost_usd: f64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cost_nanos: dollars_to_nanos(cost_usd),
        }
    }

    /// Total cost in US dollars.
    pub fn cost(&self) -> f64 {
        self.cost_nanos as f64 / NANOS_PER_DOLLAR
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

fn dollars_to_nanos(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * NANOS_PER_DOLLAR).round() as u64
    } else {
        0
    }
}

impl Add for UsageAccumulator {
    type Output = UsageAccumulator;

    fn add(self, rhs: Self) -> Self::Output {
        UsageAccumulator {
            input_tokens: self.input_tokens.saturating_add(rhs.input_tokens),
            output_tokens: self.output_tokens.saturating_add(rhs.output_tokens),
            cost_nanos: self.cost_nanos.saturating_add(rhs.cost_nanos),
        }
    }
}

impl AddAssign for UsageAccumulator {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for UsageAccumulator {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(UsageAccumulator::default(), Add::add)
    }
}

impl<'a> Sum<&'a UsageAccumulator> for UsageAccumulator {
    fn sum<I: Iterator<Item = &'a UsageAccumulator>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

// ── Page ─────────────────────────────────────────────────────────────────

/// One page of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    /// 1-indexed page number.
    pub number: usize,
    pub class: PageClass,
    pub state: PageState,
    pub method: Option<ExtractionMethod>,
    /// Final content. Empty until the page succeeds.
    pub content: String,
    pub usage: UsageAccumulator,
    pub validation: Option<ValidationResult>,
    /// Model output was rejected and replaced by local text.
    pub degraded: bool,
    pub error: Option<PageError>,
    /// Number of remote requests made for this page.
    pub attempts: u32,
    pub duration_ms: u64,
    /// `<!-- PAGE IMAGES: ... -->` comment describing embedded images.
    pub image_descriptor: String,
}

/// Successful result of one extraction step.
#[derive(Debug, Clone)]
pub struct PageOutcome {
    pub method: ExtractionMethod,
    pub content: String,
    pub usage: UsageAccumulator,
    pub validation: Option<ValidationResult>,
    pub degraded: bool,
    pub attempts: u32,
}

impl Page {
    pub fn pending(number: usize, class: PageClass, image_descriptor: String) -> Self {
        Self {
            number,
            class,
            state: PageState::Pending,
            method: None,
            content: String::new(),
            usage: UsageAccumulator::default(),
            validation: None,
            degraded: false,
            error: None,
            attempts: 0,
            duration_ms: 0,
            image_descriptor,
        }
    }

    pub fn mark_dispatched(&mut self) {
        debug_assert_eq!(self.state, PageState::Pending);
        self.state = PageState::Dispatched;
    }

    /// Empty pages skip dispatch entirely.
    pub fn complete_empty(&mut self) {
        debug_assert_eq!(self.state, PageState::Pending);
        self.state = PageState::Succeeded;
        self.method = Some(ExtractionMethod::Empty);
        self.content = EMPTY_PAGE_CONTENT.to_string();
    }

    pub fn succeed(&mut self, outcome: PageOutcome, duration_ms: u64) {
        debug_assert_eq!(self.state, PageState::Dispatched);
        self.state = PageState::Succeeded;
        self.method = Some(outcome.method);
        self.content = outcome.content;
        self.usage = outcome.usage;
        self.validation = outcome.validation;
        self.degraded = outcome.degraded;
        self.attempts = outcome.attempts;
        self.duration_ms = duration_ms;
    }

    pub fn fail(&mut self, error: PageError, attempts: u32, duration_ms: u64) {
        debug_assert_eq!(self.state, PageState::Dispatched);
        self.state = PageState::Failed;
        self.error = Some(error);
        self.attempts = attempts;
        self.duration_ms = duration_ms;
    }

    pub fn is_success(&self) -> bool {
        self.state == PageState::Succeeded
    }
}

// ── Batch result ─────────────────────────────────────────────────────────

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Completed,
    Partial,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Completed => "completed",
            BatchStatus::Partial => "partial",
            BatchStatus::Failed => "failed",
        }
    }
}

/// Failures to spell out before summarising the remainder as "and N more".
const SUMMARY_LISTED_FAILURES: usize = 5;

/// Every page outcome of a run that had at least one failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    /// Pages keyed by number, so iteration is always ascending.
    pub pages: BTreeMap<usize, Page>,
    /// Assembled document, empty when fail-fast discarded it.
    pub content: String,
}

impl BatchResult {
    pub fn new(pages: BTreeMap<usize, Page>, content: String) -> Self {
        Self { pages, content }
    }

    pub fn total_pages(&self) -> usize {
        self.pages.len()
    }

    /// All pages succeeded.
    pub fn success(&self) -> bool {
        self.pages.values().all(Page::is_success)
    }

    pub fn status(&self) -> BatchStatus {
        if self.success() {
            BatchStatus::Completed
        } else if self.pages_completed() > 0 {
            BatchStatus::Partial
        } else {
            BatchStatus::Failed
        }
    }

    pub fn pages_completed(&self) -> usize {
        self.pages.values().filter(|p| p.is_success()).count()
    }

    pub fn pages_failed(&self) -> usize {
        self.total_pages() - self.pages_completed()
    }

    /// Failures in ascending page order.
    pub fn failed_pages(&self) -> Vec<&PageError> {
        self.pages.values().filter_map(|p| p.error.as_ref()).collect()
    }

    /// Content of every page that succeeded, keyed by page number.
    pub fn succeeded_content(&self) -> BTreeMap<usize, &str> {
        self.pages
            .values()
            .filter(|p| p.is_success())
            .map(|p| (p.number, p.content.as_str()))
            .collect()
    }

    /// The failure on the lowest-numbered page.
    pub fn primary_error(&self) -> Option<&PageError> {
        self.failed_pages().into_iter().next()
    }

    pub fn primary_kind(&self) -> Option<ErrorKind> {
        self.primary_error().map(|e| e.kind)
    }

    pub fn usage(&self) -> UsageAccumulator {
        self.pages.values().map(|p| &p.usage).sum()
    }

    /// Human-readable description of what failed, `None` when nothing did.
    pub fn error_summary(&self) -> Option<String> {
        let failed = self.failed_pages();
        let total = self.total_pages();
        match failed.as_slice() {
            [] => None,
            [only] => Some(format!(
                "Page {} of {} failed: {}",
                only.page, total, only.message
            )),
            many => {
                let listed: Vec<String> = many
                    .iter()
                    .take(SUMMARY_LISTED_FAILURES)
                    .map(|e| format!("page {} ({})", e.page, e.message))
                    .collect();
                let mut summary = format!(
                    "{} of {} pages failed: {}",
                    many.len(),
                    total,
                    listed.join(", ")
                );
                if many.len() > SUMMARY_LISTED_FAILURES {
                    summary.push_str(&format!(
                        " and {} more",
                        many.len() - SUMMARY_LISTED_FAILURES
                    ));
                }
                Some(summary)
            }
        }
    }
}

// ── Run output ───────────────────────────────────────────────────────────

/// Aggregate statistics of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionStats {
    /// Pages in the document.
    pub document_pages: usize,
    /// Pages included in this run.
    pub selected_pages: usize,
    pub text_pages: usize,
    pub form_pages: usize,
    pub empty_pages: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub degraded: usize,
    pub usage: UsageAccumulator,
    pub duration_ms: u64,
}

/// The result of a run that was allowed to emit output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    /// The assembled document.
    pub content: String,
    /// Pages in ascending order.
    pub pages: Vec<Page>,
    pub status: BatchStatus,
    pub stats: ExtractionStats,
    /// The document was read back from an earlier complete run instead of
    /// being extracted; `pages` is empty and `stats` only counts pages.
    #[serde(default)]
    pub reused: bool,
}

impl ExtractionOutput {
    /// Structured failure report, only when some page failed.
    pub fn batch_result(&self) -> Option<BatchResult> {
        if self.pages.iter().all(Page::is_success) {
            return None;
        }
        let pages = self.pages.iter().map(|p| (p.number, p.clone())).collect();
        Some(BatchResult::new(pages, self.content.clone()))
    }
}
