//! End-to-end tests against real PDF forms.
//!
//! These tests use PDF files in `./test_cases/`, a pdfium library on the
//! loader path and, for the extraction tests, a live provider key. They are
//! gated behind the `E2E_ENABLED` environment variable so they do not run in
//! CI unless explicitly requested.
//!
//! Run with:
//!   E2E_ENABLED=1 DYLD_LIBRARY_PATH=. cargo test --test e2e -- --nocapture
//!
//! To restrict to a specific test:
//!   E2E_ENABLED=1 cargo test --test e2e test_analyze -- --nocapture

use edgequake_pdfx::pipeline::assemble::verify_toc;
use edgequake_pdfx::{
    analyze, extract, extract_to_file, AuditConfig, AuditLog, AuditStatus, BatchPolicy,
    BatchStatus, ExtractError, ExtractionConfig, PageClass, PageSelection, ProviderConfig,
};
use std::path::PathBuf;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn test_cases_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases")
}

fn output_dir() -> PathBuf {
    let d = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases/output");
    std::fs::create_dir_all(&d).ok();
    d
}

/// Skip this test if E2E_ENABLED is not set *or* no PDF file at `path`.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP: test file not found: {}", p.display());
            return;
        }
        p
    }};
}

/// Skip unless the default provider has a key.
macro_rules! require_api_key {
    () => {{
        if ProviderConfig::default().resolve_api_key().is_err() {
            println!("SKIP: no provider key in the environment");
            return;
        }
    }};
}

/// Structural checks every assembled document must pass.
fn assert_document_shape(doc: &str, pages: &[usize], total: usize, context: &str) {
    verify_toc(doc).unwrap_or_else(|e| panic!("[{context}] {e}"));
    assert!(doc.starts_with("<!--\nSOURCE: "), "[{context}] missing metadata header");

    let mut last = 0;
    for page in pages {
        let header = format!("# PAGE {page} OF {total}\n");
        let at = doc
            .find(&header)
            .unwrap_or_else(|| panic!("[{context}] missing {header:?}"));
        assert!(at > last, "[{context}] page {page} out of order");
        assert_eq!(doc.matches(&header).count(), 1, "[{context}] duplicate {header:?}");
        assert!(
            doc.contains(&format!("<!-- TOC PAGE_{page:02}: ")),
            "[{context}] missing TOC line for page {page}"
        );
        last = at;
    }

    let invisible = ['\u{200B}', '\u{FEFF}', '\u{200C}', '\u{200D}', '\u{2060}'];
    for ch in invisible {
        assert!(
            !doc.contains(ch),
            "[{context}] Output contains invisible char U+{:04X}",
            ch as u32
        );
    }
}

fn form_pdf() -> PathBuf {
    test_cases_dir().join("application_form.pdf")
}

fn text_pdf() -> PathBuf {
    test_cases_dir().join("plain_letter.pdf")
}

// ── Analyze ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_analyze_form_document() {
    let path = e2e_skip_unless_ready!(form_pdf());
    let summary = analyze(&path, &ExtractionConfig::default()).await.unwrap();

    println!(
        "{} pages: text {:?}, form {:?}, empty {:?}",
        summary.page_count,
        summary.text_pages(),
        summary.form_pages(),
        summary.empty_pages()
    );
    assert!(summary.page_count > 0);
    assert!(!summary.form_pages().is_empty(), "expected at least one FORM page");
    assert_eq!(
        summary.text_pages().len() + summary.form_pages().len() + summary.empty_pages().len(),
        summary.page_count
    );
    assert!(summary.estimate.hybrid_cost <= summary.estimate.full_ai_cost);
}

#[tokio::test]
async fn test_analyze_plain_document_has_no_forms() {
    let path = e2e_skip_unless_ready!(text_pdf());
    let summary = analyze(&path, &ExtractionConfig::default()).await.unwrap();
    assert!(summary.form_pages().is_empty());
    assert_eq!(summary.class_of(1), Some(PageClass::Text));
}

#[tokio::test]
async fn test_missing_file_is_fatal() {
    if std::env::var("E2E_ENABLED").is_err() {
        println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
        return;
    }
    let err = extract(test_cases_dir().join("does-not-exist.pdf"), &ExtractionConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::FileNotFound { .. }));
}

// ── Extraction ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_plain_document_needs_no_provider() {
    let path = e2e_skip_unless_ready!(text_pdf());
    let provider = ProviderConfig {
        api_key_env: "PDFX_E2E_UNSET_KEY".into(),
        ..ProviderConfig::default()
    };
    let config = ExtractionConfig::builder().provider(provider).build().unwrap();

    let output = extract(&path, &config).await.unwrap();
    let pages: Vec<usize> = output.pages.iter().map(|p| p.number).collect();
    assert_document_shape(&output.content, &pages, output.stats.document_pages, "plain");
    assert!(output.stats.usage.is_zero());
    assert!(output.content.contains("<!-- METHOD: TEXT-EXTRACTION -->"));
}

#[tokio::test]
async fn test_extract_form_to_file() {
    let path = e2e_skip_unless_ready!(form_pdf());
    require_api_key!();

    let out = output_dir().join("application_form.md");
    let audit_path = output_dir().join("audit.log");
    let audit = AuditConfig {
        path: audit_path.clone(),
        retention_hours: Some(24),
    };
    let config = ExtractionConfig::builder()
        .batch_policy(BatchPolicy::Partial)
        .audit(audit.clone())
        .force_reextract(true)
        .build()
        .unwrap();

    let output = extract_to_file(&path, &out, &config).await.unwrap();
    let written = std::fs::read_to_string(&out).unwrap();
    assert_eq!(written, output.content);

    let pages: Vec<usize> = output.pages.iter().map(|p| p.number).collect();
    assert_document_shape(&written, &pages, output.stats.document_pages, "form");
    assert!(output.stats.form_pages > 0);
    assert!(output.stats.usage.input_tokens > 0);
    println!(
        "{:?}: {} tokens, ${:.6}",
        output.status,
        output.stats.usage.total_tokens(),
        output.stats.usage.cost()
    );

    let last = AuditLog::from_config(&audit)
        .read_entries()
        .unwrap()
        .pop()
        .expect("audit entry");
    assert_eq!(last.status, AuditStatus::Success);
    assert_eq!(last.output_path.as_deref(), Some(out.display().to_string().as_str()));
}

#[tokio::test]
async fn test_page_selection() {
    let path = e2e_skip_unless_ready!(form_pdf());
    require_api_key!();

    let config = ExtractionConfig::builder()
        .pages(PageSelection::Single(1))
        .batch_policy(BatchPolicy::Partial)
        .build()
        .unwrap();
    let output = extract(&path, &config).await.unwrap();
    assert_eq!(output.pages.len(), 1);
    assert_document_shape(&output.content, &[1], output.stats.document_pages, "single");
}

#[tokio::test]
async fn test_bad_key_fails_fast() {
    let path = e2e_skip_unless_ready!(form_pdf());
    let provider = ProviderConfig {
        api_key: Some("sk-invalid-e2e-key".into()),
        ..ProviderConfig::default()
    };
    let config = ExtractionConfig::builder().provider(provider).build().unwrap();

    match extract(&path, &config).await {
        Err(ExtractError::BatchFailed(batch)) => {
            assert_ne!(batch.status(), BatchStatus::Completed);
            println!("{}", batch.error_summary().unwrap_or_default());
        }
        other => panic!("expected BatchFailed, got {other:?}"),
    }
}
