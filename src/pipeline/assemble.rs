//! Document assembly: ordered page blocks behind a metadata header and a TOC.
//!
//! ## Layout
//!
//! ```text
//! <!-- metadata -->
//! <!--
//! EXTRA METADATA
//! ...
//! -->
//! <!-- TOC START -->
//! <!--
//! - Page 1: Application for residence
//! - Page 2: Empty page
//! -->
//! <!-- TOC END -->
//!
//! # PAGE 1 OF 2
//! <!-- TOC PAGE_01: Application for residence | ID: FORM 1040 -->
//! <!-- PAGE IMAGES: 0 -->
//! <!-- METHOD: AI-VISION-EXTRACTION -->
//!
//! ...body...
//! ```
//!
//! Pages are emitted strictly in ascending page order regardless of the
//! order in which they finished. Page bodies are free text, so TOC markers
//! and page headers inside them are escaped before [`verify_toc`] checks the
//! marker invariant on the finished string.
//!
//! The metadata comment doubles as a record of the run: [`recorded_run`]
//! reads it back so an existing output file can be recognised.

use crate::config::{OutputFormat, ProviderConfig};
use crate::error::ExtractError;
use crate::output::{BatchStatus, ExtractionStats, Page, PageClass, PageState};
use crate::pipeline::document::DocumentIdentity;
use crate::pipeline::format::to_canonical;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

pub const TOC_START: &str = "<!-- TOC START -->";
pub const TOC_END: &str = "<!-- TOC END -->";
const MAX_SUMMARY_CHARS: usize = 80;
const NO_SUMMARY: &str = "Untitled page";
/// Lines of an existing file searched for the metadata comment.
const METADATA_SCAN_LINES: usize = 30;

/// Everything the header needs besides the pages themselves.
#[derive(Debug, Clone)]
pub struct DocumentHeader<'a> {
    pub identity: &'a DocumentIdentity,
    pub provider: &'a ProviderConfig,
    pub processed_at: DateTime<Utc>,
    pub status: BatchStatus,
    pub stats: &'a ExtractionStats,
    pub extra_metadata: Option<&'a str>,
    pub format: OutputFormat,
}

/// Build the output document and check its TOC markers.
pub fn assemble(header: &DocumentHeader<'_>, pages: &BTreeMap<usize, Page>) -> Result<String, ExtractError> {
    let total = header.stats.document_pages;
    let mut out = String::new();

    let selected: Vec<usize> = pages.keys().copied().collect();
    out.push_str(&metadata_comment(header, &page_list(&selected)));
    if let Some(extra) = header.extra_metadata.map(str::trim).filter(|e| !e.is_empty()) {
        out.push_str("<!--\nEXTRA METADATA\n");
        out.push_str(&defang_comment(extra));
        out.push_str("\n-->\n");
    }

    let summaries: BTreeMap<usize, String> = pages
        .values()
        .map(|p| (p.number, page_summary(p)))
        .collect();

    out.push_str(TOC_START);
    out.push_str("\n<!--\n");
    for (number, summary) in &summaries {
        out.push_str(&format!("- Page {number}: {summary}\n"));
    }
    out.push_str("-->\n");
    out.push_str(TOC_END);
    out.push('\n');

    for page in pages.values() {
        out.push('\n');
        out.push_str(&page_block(page, total, &summaries[&page.number], header.format));
    }

    verify_toc(&out)?;
    Ok(out)
}

fn metadata_comment(header: &DocumentHeader<'_>, selected: &str) -> String {
    let stats = header.stats;
    let usage = stats.usage;
    format!(
        "<!--\n\
SOURCE: {}\n\
SHA-256: {}\n\
PROVIDER: {} ({})\n\
MODEL: {}\n\
PROCESSED: {}\n\
DURATION: {:.2}s\n\
STATUS: {}\n\
FORMAT: {}\n\
SELECTED: {}\n\
PAGES: {} of {} | TEXT: {} | FORM: {} | EMPTY: {} | FAILED: {} | DEGRADED: {}\n\
TOKENS: {} in / {} out\n\
COST: ${:.6}\n\
-->\n",
        defang_comment(&header.identity.name),
        header.identity.sha256,
        defang_comment(&header.provider.name),
        defang_comment(&header.provider.id),
        defang_comment(&header.provider.model),
        header.processed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        stats.duration_ms as f64 / 1000.0,
        header.status.as_str(),
        header.format.as_str(),
        selected,
        stats.selected_pages,
        stats.document_pages,
        stats.text_pages,
        stats.form_pages,
        stats.empty_pages,
        stats.failed,
        stats.degraded,
        usage.input_tokens,
        usage.output_tokens,
        usage.cost(),
    )
}

fn page_block(page: &Page, total: usize, summary: &str, format: OutputFormat) -> String {
    let mut block = format!("# PAGE {} OF {}\n", page.number, total);

    let mut toc_line = format!("<!-- TOC PAGE_{:02}: {}", page.number, summary);
    if page.is_success() {
        if let Some(id) = detect_identifier(&page.content) {
            toc_line.push_str(&format!(" | ID: {id}"));
        }
    }
    toc_line.push_str(" -->\n");
    block.push_str(&toc_line);

    if !page.image_descriptor.is_empty() {
        block.push_str(&page.image_descriptor);
        block.push('\n');
    }
    if let Some(method) = page.method {
        block.push_str(&format!("<!-- METHOD: {} -->\n", method.label()));
    }
    if page.degraded {
        let codes = page
            .validation
            .as_ref()
            .map(|v| v.error_codes())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "validation failed".to_string());
        block.push_str(&format!("<!-- DEGRADED: model output rejected ({codes}) -->\n"));
    }
    block.push('\n');

    match (&page.state, &page.error) {
        (PageState::Failed, Some(error)) => {
            let code = error.code.map(|c| format!(", code {c}")).unwrap_or_default();
            block.push_str(&format!(
                "> **EXTRACTION ERROR** ({}{}): {}\n",
                error.kind,
                code,
                escape_body(&error.message.replace('\n', " "))
            ));
        }
        _ => {
            let canonical = match format {
                OutputFormat::CanonicalMarkdown if page.class != PageClass::Empty => {
                    to_canonical(&page.content)
                }
                _ => None,
            };
            let body = canonical.as_deref().unwrap_or(&page.content);
            block.push_str(escape_body(body).trim_end());
            block.push('\n');
        }
    }
    block
}

static RE_BODY_PAGE_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(# PAGE \d+ OF \d+[ \t]*)$").unwrap());

/// Neutralise document structure that page text may reproduce: TOC markers
/// become visible text, page headers lose their heading level.
fn escape_body(body: &str) -> String {
    let body = body
        .replace(TOC_START, "&lt;!-- TOC START --&gt;")
        .replace(TOC_END, "&lt;!-- TOC END --&gt;");
    RE_BODY_PAGE_HEADER.replace_all(&body, r"\${1}").into_owned()
}

/// Compact page list, e.g. `1-3,5`.
pub fn page_list(pages: &[usize]) -> String {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    for &page in pages {
        match runs.last_mut() {
            Some((_, end)) if *end + 1 == page => *end = page,
            _ => runs.push((page, page)),
        }
    }
    runs.iter()
        .map(|&(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{start}-{end}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

// ── Recorded runs ────────────────────────────────────────────────────────

/// What the metadata comment of an earlier output says about its run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRun {
    pub sha256: String,
    pub status: String,
    pub format: String,
    pub selected: String,
}

impl RecordedRun {
    /// The recorded run covered exactly this document, selection and
    /// format, and every page succeeded.
    pub fn is_complete_for(&self, sha256: &str, selected: &str, format: OutputFormat) -> bool {
        !sha256.is_empty()
            && self.sha256 == sha256
            && self.status == BatchStatus::Completed.as_str()
            && self.format == format.as_str()
            && self.selected == selected
    }
}

/// Read the metadata comment at the top of an assembled document.
///
/// `None` when the document does not open with one, or a field is missing.
pub fn recorded_run(document: &str) -> Option<RecordedRun> {
    let mut lines = document.lines().take(METADATA_SCAN_LINES);
    if lines.next()? != "<!--" {
        return None;
    }
    let (mut sha256, mut status, mut format, mut selected) = (None, None, None, None);
    for line in lines.take_while(|l| *l != "-->") {
        let Some((key, value)) = line.split_once(": ") else {
            continue;
        };
        let slot = match key {
            "SHA-256" => &mut sha256,
            "STATUS" => &mut status,
            "FORMAT" => &mut format,
            "SELECTED" => &mut selected,
            _ => continue,
        };
        *slot = Some(value.trim().to_string());
    }
    Some(RecordedRun {
        sha256: sha256?,
        status: status?,
        format: format?,
        selected: selected?,
    })
}

// ── Summaries ────────────────────────────────────────────────────────────

static RE_ENUMERATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:#+\s*|[-*+>]\s+|\((?:x| )\)\s*|\[(?:x| )\]\s*|(?:\d+(?:\.\d+)*|[A-Za-z])[.)]\s+|\d+(?:\.\d+)+\s+)+").unwrap()
});

/// One-line description of a page for the TOC.
pub fn page_summary(page: &Page) -> String {
    if page.state == PageState::Failed {
        let kind = page
            .error
            .as_ref()
            .map(|e| e.kind.as_str())
            .unwrap_or("UnknownError");
        return format!("Extraction failed ({kind})");
    }
    if page.class == PageClass::Empty {
        return "Empty page".to_string();
    }
    summarize_content(&page.content).unwrap_or_else(|| NO_SUMMARY.to_string())
}

/// First meaningful line with markdown and enumeration stripped.
pub fn summarize_content(content: &str) -> Option<String> {
    let mut in_comment = false;
    for raw in content.lines() {
        let line = raw.trim();
        if in_comment {
            if line.contains("-->") {
                in_comment = false;
            }
            continue;
        }
        if line.starts_with("<!--") {
            in_comment = !line.contains("-->");
            continue;
        }
        if line.is_empty() || line.starts_with("```") || is_table_rule(line) {
            continue;
        }

        let stripped = RE_ENUMERATION.replace(line, "");
        let cleaned: String = stripped
            .trim_matches('|')
            .replace(['*', '_', '`'], "")
            .split('|')
            .map(str::trim)
            .filter(|cell| !cell.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let cleaned = defang_comment(cleaned.trim());
        if cleaned.chars().filter(|c| c.is_alphanumeric()).count() < 2 {
            continue;
        }
        return Some(truncate_chars(&cleaned, MAX_SUMMARY_CHARS));
    }
    None
}

fn is_table_rule(line: &str) -> bool {
    line.starts_with('|') && line.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max - 1).collect();
    format!("{}…", kept.trim_end())
}

/// Keep free text from closing or opening an HTML comment.
fn defang_comment(s: &str) -> String {
    s.replace("-->", "->").replace("<!--", "<!-")
}

// ── Identifiers ──────────────────────────────────────────────────────────

static RE_IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(form|doc(?:ument)?\s+identity|doc(?:ument)?\s+id|reference)\b\s*[:#]?\s*([A-Z0-9][A-Z0-9./-]*[0-9][A-Z0-9./-]*)",
    )
    .unwrap()
});

/// Form or document identifier printed on the page, e.g. `FORM 1040`.
pub fn detect_identifier(content: &str) -> Option<String> {
    let caps = RE_IDENTIFIER.captures(content)?;
    let label = caps[1]
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    let id = caps[2].trim_end_matches(['.', '/', '-']);
    if id.is_empty() {
        return None;
    }
    Some(format!("{} {}", label, id.to_uppercase()))
}

// ── Invariant ────────────────────────────────────────────────────────────

static RE_PAGE_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^# PAGE \d+ OF \d+$").unwrap());

/// Exactly one TOC start and one TOC end marker, in that order, both before
/// the first page header.
pub fn verify_toc(document: &str) -> Result<(), ExtractError> {
    let starts: Vec<usize> = document.match_indices(TOC_START).map(|(i, _)| i).collect();
    let ends: Vec<usize> = document.match_indices(TOC_END).map(|(i, _)| i).collect();

    let (start, end) = match (starts.as_slice(), ends.as_slice()) {
        ([start], [end]) => (*start, *end),
        _ => {
            return Err(ExtractError::AssemblyDefect(format!(
                "expected one TOC start and one TOC end marker, found {} and {}",
                starts.len(),
                ends.len()
            )))
        }
    };
    if start > end {
        return Err(ExtractError::AssemblyDefect(
            "TOC end marker precedes TOC start marker".into(),
        ));
    }
    if let Some(first_page) = RE_PAGE_HEADER.find(document) {
        if end > first_page.start() {
            return Err(ExtractError::AssemblyDefect(
                "TOC block must precede the first page header".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, PageError};
    use crate::output::{ExtractionMethod, PageOutcome, UsageAccumulator};

    fn done(n: usize, class: PageClass, content: &str) -> Page {
        let mut p = Page::pending(n, class, "<!-- PAGE IMAGES: 0 -->".into());
        p.mark_dispatched();
        p.succeed(
            PageOutcome {
                method: ExtractionMethod::AiVision,
                content: content.into(),
                usage: UsageAccumulator::new(100, 20, 0.001),
                validation: None,
                degraded: false,
                attempts: 1,
            },
            5,
        );
        p
    }

    fn header_for<'a>(
        identity: &'a DocumentIdentity,
        provider: &'a ProviderConfig,
        stats: &'a ExtractionStats,
    ) -> DocumentHeader<'a> {
        DocumentHeader {
            identity,
            provider,
            processed_at: Utc::now(),
            status: BatchStatus::Partial,
            stats,
            extra_metadata: Some("batch 7"),
            format: OutputFormat::Markdown,
        }
    }

    #[test]
    fn summary_strips_markdown_and_numbering() {
        assert_eq!(
            summarize_content("<!-- note -->\n\n## 1. Personal details\n### 1.1 Name").as_deref(),
            Some("Personal details")
        );
        assert_eq!(
            summarize_content("- **Applicant** signature").as_deref(),
            Some("Applicant signature")
        );
        assert_eq!(summarize_content("\n\n---\n").as_deref(), None);
    }

    #[test]
    fn summary_is_truncated() {
        let long = "word ".repeat(40);
        let s = summarize_content(&long).unwrap();
        assert_eq!(s.chars().count(), MAX_SUMMARY_CHARS);
        assert!(s.ends_with('…'));
    }

    #[test]
    fn identifiers() {
        assert_eq!(
            detect_identifier("## DOC IDENTITY\nForm 1040 (2024)").as_deref(),
            Some("FORM 1040")
        );
        assert_eq!(
            detect_identifier("Doc identity: K75-19Z.").as_deref(),
            Some("DOC IDENTITY K75-19Z")
        );
        assert_eq!(detect_identifier("Please fill in the form below."), None);
    }

    #[test]
    fn failed_and_empty_summaries() {
        let mut empty = Page::pending(2, PageClass::Empty, String::new());
        empty.complete_empty();
        assert_eq!(page_summary(&empty), "Empty page");

        let mut failed = Page::pending(3, PageClass::Form, String::new());
        failed.mark_dispatched();
        failed.fail(PageError::new(3, ErrorKind::RateLimit, Some(429), "slow down"), 4, 10);
        assert_eq!(page_summary(&failed), "Extraction failed (RateLimitError)");
    }

    #[test]
    fn assembled_document_is_ordered_and_marked() {
        let identity = DocumentIdentity::from_bytes("form.pdf", b"%PDF-1.7");
        let provider = ProviderConfig::default();
        let stats = ExtractionStats {
            document_pages: 3,
            selected_pages: 3,
            ..Default::default()
        };
        let mut pages = BTreeMap::new();
        let mut failed = Page::pending(3, PageClass::Form, String::new());
        failed.mark_dispatched();
        failed.fail(PageError::new(3, ErrorKind::Server, Some(503), "unavailable"), 4, 10);
        pages.insert(3, failed);
        pages.insert(1, done(1, PageClass::Form, "## 1. Residence permit\nFORM 1040"));
        let mut empty = Page::pending(2, PageClass::Empty, String::new());
        empty.complete_empty();
        pages.insert(2, empty);

        let doc = assemble(&header_for(&identity, &provider, &stats), &pages).unwrap();

        let p1 = doc.find("# PAGE 1 OF 3").unwrap();
        let p2 = doc.find("# PAGE 2 OF 3").unwrap();
        let p3 = doc.find("# PAGE 3 OF 3").unwrap();
        assert!(doc.find(TOC_END).unwrap() < p1);
        assert!(p1 < p2 && p2 < p3);
        assert!(doc.contains("- Page 1: Residence permit\n"));
        assert!(doc.contains("<!-- TOC PAGE_01: Residence permit | ID: FORM 1040 -->"));
        assert!(doc.contains("<!-- TOC PAGE_02: Empty page -->"));
        assert!(doc.contains("[This page is empty]"));
        assert!(doc.contains("> **EXTRACTION ERROR** (ServerError, code 503): unavailable"));
        assert!(doc.contains("EXTRA METADATA\nbatch 7"));
        assert!(doc.contains(&format!("SHA-256: {}", identity.sha256)));
        assert!(verify_toc(&doc).is_ok());
    }

    #[test]
    fn structure_inside_page_text_is_escaped() {
        let identity = DocumentIdentity::from_bytes("form.pdf", b"%PDF-1.7");
        let provider = ProviderConfig::default();
        let stats = ExtractionStats {
            document_pages: 2,
            selected_pages: 2,
            ..Default::default()
        };
        let quoted = format!("## 1. Notes\n{TOC_START}\n# PAGE 9 OF 9\n{TOC_END}\nend");
        let mut failed = Page::pending(2, PageClass::Form, String::new());
        failed.mark_dispatched();
        failed.fail(
            PageError::new(2, ErrorKind::ModelResponse, None, format!("echoed {TOC_END}")),
            1,
            3,
        );
        let mut pages = BTreeMap::new();
        pages.insert(1, done(1, PageClass::Text, &quoted));
        pages.insert(2, failed);

        let doc = assemble(&header_for(&identity, &provider, &stats), &pages).unwrap();
        assert_eq!(doc.matches(TOC_START).count(), 1);
        assert_eq!(doc.matches(TOC_END).count(), 1);
        assert!(doc.contains("&lt;!-- TOC START --&gt;\n\\# PAGE 9 OF 9\n&lt;!-- TOC END --&gt;"));
        assert!(doc.contains("echoed &lt;!-- TOC END --&gt;"));
        assert!(!doc.contains("\n# PAGE 9 OF 9"));
    }

    #[test]
    fn canonical_format_rewrites_bodies() {
        let identity = DocumentIdentity::from_bytes("form.pdf", b"%PDF-1.7");
        let provider = ProviderConfig::default();
        let stats = ExtractionStats {
            document_pages: 2,
            selected_pages: 2,
            ..Default::default()
        };
        let mut pages = BTreeMap::new();
        pages.insert(1, done(1, PageClass::Form, "## 1. Applicant\n### 1.1 Name\nJan\n### 1.2 Single\n- ● yes\n- ○ no"));
        pages.insert(2, done(2, PageClass::Text, "Dear applicant,\nthank you."));
        let header = DocumentHeader {
            format: OutputFormat::CanonicalMarkdown,
            ..header_for(&identity, &provider, &stats)
        };

        let doc = assemble(&header, &pages).unwrap();
        assert!(doc.contains("FORMAT: canonical-markdown\n"));
        assert!(doc.contains(
            "## 1. Applicant\n\n### 1.1 Name\nvalue: `Jan`\n\n### 1.2 Single\n(type: radio)\n- (x) yes\n- ( ) no\n"
        ));
        assert!(doc.contains("Dear applicant,\nthank you.\n"));
        assert!(doc.contains("<!-- TOC PAGE_01: Applicant -->"));
    }

    #[test]
    fn metadata_comment_reads_back() {
        let identity = DocumentIdentity::from_bytes("form.pdf", b"%PDF-1.7");
        let provider = ProviderConfig::default();
        let stats = ExtractionStats {
            document_pages: 6,
            selected_pages: 4,
            ..Default::default()
        };
        let pages: BTreeMap<usize, Page> = [1, 2, 3, 5]
            .into_iter()
            .map(|n| (n, done(n, PageClass::Form, "## 1. Section")))
            .collect();
        let header = DocumentHeader {
            status: BatchStatus::Completed,
            ..header_for(&identity, &provider, &stats)
        };

        let doc = assemble(&header, &pages).unwrap();
        let run = recorded_run(&doc).unwrap();
        assert_eq!(run.selected, "1-3,5");
        assert!(run.is_complete_for(&identity.sha256, "1-3,5", OutputFormat::Markdown));
        assert!(!run.is_complete_for(&identity.sha256, "1-6", OutputFormat::Markdown));
        assert!(!run.is_complete_for(&identity.sha256, "1-3,5", OutputFormat::CanonicalMarkdown));
        assert!(!run.is_complete_for("", "1-3,5", OutputFormat::Markdown));

        assert_eq!(recorded_run("# Notes\nSHA-256: abc"), None);
        assert_eq!(recorded_run("<!--\nSHA-256: abc\n-->\n"), None);
    }

    #[test]
    fn page_lists_are_compact() {
        assert_eq!(page_list(&[1, 2, 3, 5, 7, 8]), "1-3,5,7-8");
        assert_eq!(page_list(&[4]), "4");
        assert_eq!(page_list(&[]), "");
    }

    #[test]
    fn toc_violations_are_detected() {
        let ok = format!("{TOC_START}\n{TOC_END}\n# PAGE 1 OF 1\nbody");
        assert!(verify_toc(&ok).is_ok());

        let twice = format!("{TOC_START}\n{TOC_END}\n# PAGE 1 OF 1\n{TOC_START}");
        assert!(matches!(verify_toc(&twice), Err(ExtractError::AssemblyDefect(_))));

        let late = format!("{TOC_START}\n# PAGE 1 OF 1\n{TOC_END}");
        assert!(matches!(verify_toc(&late), Err(ExtractError::AssemblyDefect(_))));

        let missing = "# PAGE 1 OF 1\nbody";
        assert!(matches!(verify_toc(missing), Err(ExtractError::AssemblyDefect(_))));
    }
}
