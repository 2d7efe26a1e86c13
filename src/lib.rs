//! # edgequake-pdfx
//!
//! Hybrid extraction of PDF forms into structured markdown.
//!
//! ## Why hybrid?
//!
//! Sending every page of a 40-page application pack to a vision model is
//! slow and expensive, yet only a handful of those pages carry form fields.
//! This crate classifies each page first and routes it to the cheapest
//! strategy that can read it: the document's own text layer for plain text
//! pages, a vision model for pages with interactive fields, nothing at all
//! for blank pages. The per-page results are validated and merged into one
//! deterministic document with a table of contents and an audit trail.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Classify  TEXT / FORM / EMPTY per page (pdfium, spawn_blocking)
//!  ├─ 2. Dispatch  bounded buffer_unordered pool, one worker per page
//!  │      ├─ TEXT  local text layer, free
//!  │      └─ FORM  render → encode → vision model (retry, backoff, rotation)
//!  ├─ 3. Validate  structural checks, optional fallback to local text
//!  ├─ 4. Merge     BTreeMap by page number, fail-fast or partial
//!  ├─ 5. Assemble  metadata + TOC + ordered page blocks (optionally canonical)
//!  └─ 6. Audit     one JSON line per run
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdfx::{extract, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // API key read from OPENROUTER_API_KEY
//!     let config = ExtractionConfig::default();
//!     let output = extract("application.pdf", &config).await?;
//!     println!("{}", output.content);
//!     eprintln!(
//!         "{} form pages, ${:.4}",
//!         output.stats.form_pages,
//!         output.stats.usage.cost()
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfx` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdfx = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod audit;
pub mod config;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use audit::{AuditEntry, AuditLog, AuditStatus};
pub use config::{
    AuditConfig, BatchPolicy, ExtractionConfig, ExtractionConfigBuilder, OutputFormat,
    PageSelection, ProviderConfig, TokenPricing, ValidationConfig,
};
pub use error::{ErrorKind, ExtractError, PageError};
pub use extract::{
    analyze, extract, extract_document, extract_document_to_file, extract_sync, extract_to_file,
    open_document,
};
pub use output::{
    BatchResult, BatchStatus, ExtractionMethod, ExtractionOutput, ExtractionStats, Page,
    PageClass, PageState, UsageAccumulator,
};
pub use pipeline::classify::{ClassificationSummary, CostEstimate};
pub use pipeline::client::{
    ChatTransport, EndpointRotation, ExtractionFailure, PageExtractor, RemoteExtraction,
    VisionClient,
};
pub use pipeline::document::{DocumentIdentity, DocumentSource, PdfiumDocument};
pub use pipeline::validate::{OutputValidator, ValidationResult};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
