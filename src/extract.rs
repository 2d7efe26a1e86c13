//! Extraction entry points and the orchestrator.
//!
//! A run classifies the document once, resolves the page selection, settles
//! EMPTY pages immediately and fans every other page out over a bounded
//! `buffer_unordered` pool. Workers only produce outcomes; the coordinating
//! loop that drains the stream owns the page table and the usage totals.
//! Results are merged through a `BTreeMap`, so the assembled document is in
//! page order however the workers finished.
//!
//! Writing to a file first looks at what the file already holds: a complete
//! earlier run of the same document bytes, page selection and output format
//! is returned as is unless [`ExtractionConfig::force_reextract`] is set.

use crate::audit::{AuditEntry, AuditLog, AuditStatus};
use crate::config::{BatchPolicy, ExtractionConfig};
use crate::error::{ErrorKind, ExtractError, PageError};
use crate::output::{
    BatchResult, BatchStatus, ExtractionMethod, ExtractionOutput, ExtractionStats, Page,
    PageClass, PageOutcome, UsageAccumulator,
};
use crate::pipeline::assemble::{assemble, page_list, recorded_run, DocumentHeader};
use crate::pipeline::classify::{ClassificationSummary, PageClassifier};
use crate::pipeline::client::{extract_text_locally, ExtractionFailure, PageExtractor, VisionClient};
use crate::pipeline::document::{DocumentIdentity, DocumentSource, PdfiumDocument};
use crate::pipeline::validate::OutputValidator;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Extract a PDF file.
///
/// # Errors
/// Fatal problems only: unreadable or invalid input, a missing provider key,
/// an out-of-range page selection, a structural defect in the assembled
/// output, and [`ExtractError::BatchFailed`] when some page failed under
/// [`BatchPolicy::FailFast`]. Page failures under [`BatchPolicy::Partial`]
/// are reported inside the returned output.
pub async fn extract(
    input: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    let input = input.as_ref();
    let started_at = Utc::now();
    info!("Starting extraction: {}", input.display());

    let (identity, result) = match open_document(input, config.password.as_deref()).await {
        Ok(document) => {
            let identity = document.identity().clone();
            (identity, run(document, config).await)
        }
        Err(e) => (unopened_identity(input), Err(e)),
    };
    audit_run(config, &identity, started_at, None, &result).await;
    result
}

/// Extract an already opened document.
pub async fn extract_document(
    document: Arc<dyn DocumentSource>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    let started_at = Utc::now();
    let identity = document.identity().clone();
    let result = run(document, config).await;
    audit_run(config, &identity, started_at, None, &result).await;
    result
}

/// Extract a PDF and write the document to `output_path`.
///
/// Uses atomic write (temp file + rename) so a failed run never leaves a
/// partial file behind. When `output_path` already holds a complete
/// extraction of the same document, selection and format, that file is
/// returned with [`ExtractionOutput::reused`] set and nothing is extracted.
pub async fn extract_to_file(
    input: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    let input = input.as_ref();
    let path = output_path.as_ref();
    let started_at = Utc::now();
    info!("Starting extraction: {} → {}", input.display(), path.display());

    match open_document(input, config.password.as_deref()).await {
        Ok(document) => write_document(document, path, config, started_at).await,
        Err(e) => {
            let result = Err(e);
            audit_run(config, &unopened_identity(input), started_at, Some(path), &result).await;
            result
        }
    }
}

/// [`extract_to_file`] for an already opened document.
pub async fn extract_document_to_file(
    document: Arc<dyn DocumentSource>,
    output_path: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    write_document(document, output_path.as_ref(), config, Utc::now()).await
}

async fn write_document(
    document: Arc<dyn DocumentSource>,
    path: &Path,
    config: &ExtractionConfig,
    started_at: DateTime<Utc>,
) -> Result<ExtractionOutput, ExtractError> {
    let identity = document.identity().clone();
    let result = match reusable_output(&document, path, config).await {
        Ok(Some(output)) => Ok(output),
        Ok(None) => match run(document, config).await {
            Ok(output) => write_atomic(path, &output.content).await.map(|_| output),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };
    audit_run(config, &identity, started_at, Some(path), &result).await;
    result
}

/// The file at `path`, when it records a complete run over the same
/// document bytes, page selection and output format.
async fn reusable_output(
    document: &Arc<dyn DocumentSource>,
    path: &Path,
    config: &ExtractionConfig,
) -> Result<Option<ExtractionOutput>, ExtractError> {
    if config.force_reextract {
        return Ok(None);
    }
    let Ok(existing) = tokio::fs::read_to_string(path).await else {
        return Ok(None);
    };
    let identity = document.identity();
    let document_pages = document.page_count();
    let selected = config.pages.resolve(document_pages)?;

    let reusable = recorded_run(&existing).is_some_and(|run| {
        run.is_complete_for(&identity.sha256, &page_list(&selected), config.output_format)
    });
    if !reusable {
        debug!("{} holds no reusable extraction", path.display());
        return Ok(None);
    }
    info!(
        "Reusing existing extraction of {} at {}",
        identity.name,
        path.display()
    );
    Ok(Some(ExtractionOutput {
        content: existing,
        pages: Vec::new(),
        status: BatchStatus::Completed,
        stats: ExtractionStats {
            document_pages,
            selected_pages: selected.len(),
            succeeded: selected.len(),
            ..ExtractionStats::default()
        },
        reused: true,
    }))
}

/// Synchronous wrapper around [`extract`].
///
/// Creates a temporary tokio runtime internally.
pub fn extract_sync(
    input: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ExtractError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(input, config))
}

/// Classify a PDF and estimate its cost without extracting anything.
///
/// Needs no API key.
pub async fn analyze(
    input: impl AsRef<Path>,
    config: &ExtractionConfig,
) -> Result<ClassificationSummary, ExtractError> {
    let document = open_document(input.as_ref(), config.password.as_deref()).await?;
    let classifier = PageClassifier::new(document, config.provider.pricing);
    let summary = classifier.classify().await?;
    Ok(if config.force_ai {
        summary.forced_ai()
    } else {
        summary.clone()
    })
}

/// Open a PDF through pdfium off the async runtime.
pub async fn open_document(
    path: &Path,
    password: Option<&str>,
) -> Result<Arc<dyn DocumentSource>, ExtractError> {
    let path = path.to_path_buf();
    let password = password.map(str::to_string);
    let document = tokio::task::spawn_blocking(move || {
        PdfiumDocument::open(&path, password.as_deref())
    })
    .await
    .map_err(|e| ExtractError::Internal(format!("Open task panicked: {e}")))??;
    Ok(Arc::new(document))
}

// ── Orchestration ────────────────────────────────────────────────────────

/// Everything a worker needs to settle one dispatched TEXT or FORM page.
struct PageWorker {
    document: Arc<dyn DocumentSource>,
    extractor: Option<Arc<dyn PageExtractor>>,
    validator: Option<OutputValidator>,
    fallback_to_text: bool,
    progress: ProgressCallback,
    selected_pages: usize,
}

impl PageWorker {
    async fn process(&self, page: usize, class: PageClass) -> Result<PageOutcome, ExtractionFailure> {
        self.progress.on_page_start(page, self.selected_pages, class);
        if class == PageClass::Form {
            return self.process_remote(page).await;
        }
        let content = self.local_text(page).await?;
        let validation = self.validator.as_ref().map(|v| v.validate(&content, page));
        Ok(PageOutcome {
            method: ExtractionMethod::TextExtraction,
            content,
            usage: UsageAccumulator::default(),
            validation,
            degraded: false,
            attempts: 0,
        })
    }

    async fn process_remote(&self, page: usize) -> Result<PageOutcome, ExtractionFailure> {
        let extractor = self.extractor.as_ref().ok_or_else(|| ExtractionFailure {
            error: PageError::new(page, ErrorKind::Unknown, None, "no extractor configured"),
            attempts: 0,
        })?;
        let remote = extractor.extract(page).await?;

        let Some(validator) = &self.validator else {
            return Ok(PageOutcome {
                method: ExtractionMethod::AiVision,
                content: remote.content,
                usage: remote.usage,
                validation: None,
                degraded: false,
                attempts: remote.attempts,
            });
        };

        let validation = validator.validate(&remote.content, page);
        if validation.is_valid {
            return Ok(PageOutcome {
                method: ExtractionMethod::AiVision,
                content: remote.content,
                usage: remote.usage,
                validation: Some(validation),
                degraded: false,
                attempts: remote.attempts,
            });
        }

        warn!(
            "Page {}: model output failed validation ({})",
            page,
            validation.error_codes()
        );
        if self.fallback_to_text {
            match self.local_text(page).await {
                Ok(text) => {
                    info!("Page {}: falling back to local text", page);
                    return Ok(PageOutcome {
                        method: ExtractionMethod::AiFallbackToText,
                        content: text,
                        usage: remote.usage,
                        validation: Some(validation),
                        degraded: true,
                        attempts: remote.attempts,
                    });
                }
                Err(e) => warn!("Page {}: local text fallback failed: {}", page, e),
            }
        }
        Ok(PageOutcome {
            method: ExtractionMethod::AiVision,
            content: remote.content,
            usage: remote.usage,
            validation: Some(validation),
            degraded: false,
            attempts: remote.attempts,
        })
    }

    async fn local_text(&self, page: usize) -> Result<String, ExtractionFailure> {
        extract_text_locally(&self.document, page)
            .await
            .map_err(|error| ExtractionFailure { error, attempts: 0 })
    }
}

async fn run(
    document: Arc<dyn DocumentSource>,
    config: &ExtractionConfig,
) -> Result<ExtractionOutput, ExtractError> {
    let start = Instant::now();
    let identity = document.identity().clone();
    let document_pages = document.page_count();

    // ── Step 1: Classify ─────────────────────────────────────────────────
    let classifier = PageClassifier::new(Arc::clone(&document), config.provider.pricing);
    let summary = classifier.classify().await?;
    let summary = if config.force_ai {
        summary.forced_ai()
    } else {
        summary.clone()
    };

    // ── Step 2: Select pages ─────────────────────────────────────────────
    let selected = config.pages.resolve(document_pages)?;
    let mut pages: BTreeMap<usize, Page> = BTreeMap::new();
    for &number in &selected {
        let class = summary.class_of(number).ok_or(ExtractError::PageOutOfRange {
            page: number,
            total: summary.page_count,
        })?;
        pages.insert(number, Page::pending(number, class, summary.image_descriptor_of(number)));
    }
    let count_of = |class: PageClass| pages.values().filter(|p| p.class == class).count();
    let (text_pages, form_pages, empty_pages) =
        (count_of(PageClass::Text), count_of(PageClass::Form), count_of(PageClass::Empty));
    debug!(
        "Selected {} of {} pages: {} text, {} form, {} empty",
        selected.len(),
        document_pages,
        text_pages,
        form_pages,
        empty_pages
    );

    let progress: ProgressCallback = config
        .progress_callback
        .clone()
        .unwrap_or_else(|| Arc::new(NoopProgressCallback));
    progress.on_extraction_start(selected.len(), form_pages);

    // ── Step 3: Settle empty pages ───────────────────────────────────────
    for page in pages.values_mut().filter(|p| p.class == PageClass::Empty) {
        progress.on_page_start(page.number, selected.len(), PageClass::Empty);
        page.complete_empty();
        progress.on_page_complete(page.number, selected.len(), page.content.len());
    }

    // ── Step 4: Resolve the extractor (only when it will be used) ────────
    let extractor: Option<Arc<dyn PageExtractor>> = if form_pages == 0 {
        None
    } else if let Some(extractor) = &config.extractor {
        Some(Arc::clone(extractor))
    } else {
        Some(Arc::new(VisionClient::from_config(config, Arc::clone(&document))?))
    };

    // ── Step 5: Dispatch ─────────────────────────────────────────────────
    let dispatch: Vec<(usize, PageClass)> = pages
        .values_mut()
        .filter(|p| p.class != PageClass::Empty)
        .map(|p| {
            p.mark_dispatched();
            (p.number, p.class)
        })
        .collect();

    let worker = Arc::new(PageWorker {
        document,
        extractor,
        validator: config
            .validation
            .enabled
            .then(|| OutputValidator::from_config(&config.validation)),
        fallback_to_text: config.validation.fallback_to_text,
        progress: Arc::clone(&progress),
        selected_pages: selected.len(),
    });
    let parallelism = config.provider.max_parallelism.max(1);
    info!(
        "Dispatching {} pages ({} to {}), parallelism {}",
        dispatch.len(),
        form_pages,
        config.provider.model,
        parallelism
    );

    let mut results = stream::iter(dispatch.into_iter().map(|(number, class)| {
        let worker = Arc::clone(&worker);
        async move {
            let started = Instant::now();
            let outcome = worker.process(number, class).await;
            (number, outcome, started.elapsed().as_millis() as u64)
        }
    }))
    .buffer_unordered(parallelism);

    // ── Step 6: Merge ────────────────────────────────────────────────────
    let mut usage = UsageAccumulator::default();
    while let Some((number, outcome, duration_ms)) = results.next().await {
        let Some(page) = pages.get_mut(&number) else {
            continue;
        };
        match outcome {
            Ok(outcome) => {
                usage += outcome.usage;
                progress.on_page_complete(number, selected.len(), outcome.content.len());
                page.succeed(outcome, duration_ms);
            }
            Err(failure) => {
                warn!("{}", failure.error);
                progress.on_page_error(number, selected.len(), &failure.error.to_string());
                page.fail(failure.error, failure.attempts, duration_ms);
            }
        }
    }
    drop(results);

    let succeeded = pages.values().filter(|p| p.is_success()).count();
    let stats = ExtractionStats {
        document_pages,
        selected_pages: selected.len(),
        text_pages,
        form_pages,
        empty_pages,
        succeeded,
        failed: selected.len() - succeeded,
        degraded: pages.values().filter(|p| p.degraded).count(),
        usage,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    progress.on_extraction_complete(selected.len(), succeeded);

    // ── Step 7: Batch policy ─────────────────────────────────────────────
    if stats.failed > 0 && config.batch_policy == BatchPolicy::FailFast {
        let batch = BatchResult::new(pages, String::new());
        warn!(
            "Extraction failed: {}",
            batch.error_summary().unwrap_or_default()
        );
        return Err(ExtractError::BatchFailed(Box::new(batch)));
    }
    let status = if stats.failed == 0 {
        BatchStatus::Completed
    } else if stats.succeeded > 0 {
        BatchStatus::Partial
    } else {
        BatchStatus::Failed
    };

    // ── Step 8: Assemble ─────────────────────────────────────────────────
    let header = DocumentHeader {
        identity: &identity,
        provider: &config.provider,
        processed_at: Utc::now(),
        status,
        stats: &stats,
        extra_metadata: config.extra_metadata.as_deref(),
        format: config.output_format,
    };
    let content = assemble(&header, &pages)?;

    info!(
        "Extraction {}: {}/{} pages, {} tokens, ${:.6}, {}ms",
        status.as_str(),
        stats.succeeded,
        stats.selected_pages,
        stats.usage.total_tokens(),
        stats.usage.cost(),
        stats.duration_ms
    );

    Ok(ExtractionOutput {
        content,
        pages: pages.into_values().collect(),
        status,
        stats,
        reused: false,
    })
}

// ── Output & audit ───────────────────────────────────────────────────────

async fn write_atomic(path: &Path, content: &str) -> Result<(), ExtractError> {
    let write_err = |source| ExtractError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let tmp_path = path.with_extension("md.tmp");
    tokio::fs::write(&tmp_path, content).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}

fn unopened_identity(path: &Path) -> DocumentIdentity {
    DocumentIdentity {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string()),
        sha256: String::new(),
    }
}

/// Append one audit entry for the run. Failures are logged and discarded.
async fn audit_run<T>(
    config: &ExtractionConfig,
    identity: &DocumentIdentity,
    started_at: DateTime<Utc>,
    output_path: Option<&Path>,
    result: &Result<T, ExtractError>,
) {
    let Some(audit) = &config.audit else {
        return;
    };
    let finished_at = Utc::now();
    let duration_seconds = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;
    let entry = AuditEntry {
        timestamp: finished_at,
        status: if result.is_ok() {
            AuditStatus::Success
        } else {
            AuditStatus::Failure
        },
        file: identity.name.clone(),
        sha256: identity.sha256.clone(),
        provider_id: config.provider.id.clone(),
        provider_name: config.provider.name.clone(),
        model_id: config.provider.model.clone(),
        started_at,
        finished_at,
        duration_seconds,
        output_path: output_path
            .filter(|_| result.is_ok())
            .map(|p| p.display().to_string()),
        error: result.as_ref().err().map(|e| e.to_string()),
    };
    if let Err(e) = AuditLog::from_config(audit).record(entry).await {
        warn!("Audit log write failed: {}", e);
    }
}
