//! CLI binary for edgequake-pdfx.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pdfx::{
    analyze, extract, extract_to_file, AuditConfig, BatchPolicy, ExtractError,
    ExtractionConfig, ExtractionOutput, ExtractionProgressCallback, OutputFormat, PageClass,
    PageSelection, ProgressCallback, ProviderConfig, ValidationConfig,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per finished page. Pages finish out
/// of order, so start times are tracked per page.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, (Instant, PageClass)>>,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Classifying pages…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn finish_page(&self, page: usize) -> (f64, &'static str) {
        let entry = self
            .start_times
            .lock()
            .ok()
            .and_then(|mut times| times.remove(&page));
        match entry {
            Some((started, class)) => (started.elapsed().as_secs_f64(), class.as_str()),
            None => (0.0, ""),
        }
    }
}

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_extraction_start(&self, total_pages: usize, form_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!(
                "Extracting {total_pages} pages ({form_pages} via vision model)…"
            ))
        ));
    }

    fn on_page_start(&self, page: usize, _total: usize, class: PageClass) {
        if let Ok(mut times) = self.start_times.lock() {
            times.insert(page, (Instant::now(), class));
        }
        self.bar.set_message(format!("page {page}"));
    }

    fn on_page_complete(&self, page: usize, total: usize, content_len: usize) {
        let (secs, class) = self.finish_page(page);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<5}  {:<8}  {}",
            green("✓"),
            page,
            total,
            class,
            dim(&format!("{content_len:>5} chars")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page: usize, total: usize, error: &str) {
        let (secs, class) = self.finish_page(page);
        let msg: String = if error.chars().count() > 80 {
            format!("{}…", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<5}  {}  {}",
            red("✗"),
            page,
            total,
            class,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_extraction_complete(&self, total_pages: usize, success_count: usize) {
        let failed = total_pages.saturating_sub(success_count);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} {} pages extracted successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages extracted  ({} failed)",
                if failed == total_pages { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract to stdout
  pdfx application.pdf

  # Extract to a file, keep going when pages fail
  pdfx application.pdf -o application.md --partial

  # Classify only and show the cost estimate (no API key needed)
  pdfx --analyze-only application.pdf

  # Send every non-empty page to the model
  pdfx --force-ai --pages 1-4 scan.pdf

  # Two regional endpoints in round robin
  pdfx --endpoint https://eu.example/v1/chat/completions \
       --endpoint https://us.example/v1/chat/completions application.pdf

  # Canonical field layout; an unchanged PDF is not extracted twice
  pdfx application.pdf -o application.md --format canonical-markdown

  # Replace rejected model output with the page's own text
  pdfx --fallback-to-text --expect-field 1.1 --expect-field 2.3 form.pdf

ENVIRONMENT VARIABLES:
  OPENROUTER_API_KEY          API key for the default provider
  PDFX_AUDIT_LOG              Append one JSON line per run to this file
  PDFX_AUDIT_RETENTION_HOURS  Prune audit entries older than this (default 24)
  PDFIUM_LIB_PATH             Path to libpdfium (or its directory)
  RUST_LOG                    Override log filtering
"#;

/// Hybrid PDF form extraction: local text for text pages, vision models for forms.
#[derive(Parser, Debug)]
#[command(
    name = "pdfx",
    version,
    about = "Extract PDF forms to structured markdown with a hybrid text/vision pipeline",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file.
    input: PathBuf,

    /// Write the document to this file instead of stdout.
    #[arg(short, long, env = "PDFX_OUTPUT")]
    output: Option<PathBuf>,

    /// Classify pages and print the cost estimate, no extraction.
    #[arg(long)]
    analyze_only: bool,

    /// Output structured JSON instead of markdown.
    #[arg(long, env = "PDFX_JSON")]
    json: bool,

    /// Page body layout: markdown or canonical-markdown.
    #[arg(long, env = "PDFX_FORMAT", default_value = "markdown")]
    format: String,

    /// Extract again even if --output already holds this document.
    #[arg(short, long, env = "PDFX_FORCE")]
    force: bool,

    /// Page selection: all, 5, 3-15, or 1,3,5-7.
    #[arg(long, env = "PDFX_PAGES", default_value = "all")]
    pages: String,

    /// Route every non-empty page to the vision model.
    #[arg(long, env = "PDFX_FORCE_AI")]
    force_ai: bool,

    /// Emit the document even when pages fail, with error markers in place.
    #[arg(long, env = "PDFX_PARTIAL")]
    partial: bool,

    /// Chat-completions endpoint URL. Repeat for round robin.
    #[arg(long = "endpoint", env = "PDFX_ENDPOINTS", value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Model identifier sent with each request.
    #[arg(long, env = "PDFX_MODEL")]
    model: Option<String>,

    /// Provider id recorded in metadata and the audit log.
    #[arg(long, env = "PDFX_PROVIDER_ID")]
    provider_id: Option<String>,

    /// Provider display name.
    #[arg(long, env = "PDFX_PROVIDER_NAME")]
    provider_name: Option<String>,

    /// Environment variable holding the API key.
    #[arg(long, env = "PDFX_API_KEY_ENV")]
    api_key_env: Option<String>,

    /// API key (takes precedence over --api-key-env).
    #[arg(long, env = "PDFX_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Concurrent requests to the provider.
    #[arg(long, env = "PDFX_PARALLELISM")]
    parallelism: Option<usize>,

    /// Retry budget per page; each page gets at most retries + 2 attempts.
    #[arg(long, env = "PDFX_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Per-request timeout in seconds.
    #[arg(long, env = "PDFX_TIMEOUT", default_value_t = 60)]
    timeout: u64,

    /// Largest base64 image payload the endpoint accepts, in bytes.
    #[arg(long, env = "PDFX_MAX_PAYLOAD_BYTES")]
    max_payload_bytes: Option<usize>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "PDFX_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDFX_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Skip output validation.
    #[arg(long, env = "PDFX_NO_VALIDATE")]
    no_validate: bool,

    /// Replace model output that fails validation with local text.
    #[arg(long, env = "PDFX_FALLBACK_TO_TEXT")]
    fallback_to_text: bool,

    /// Treat short output as an error.
    #[arg(long, env = "PDFX_STRICT")]
    strict: bool,

    /// Minimum content length before output is flagged as short.
    #[arg(long, env = "PDFX_MIN_LENGTH", default_value_t = 100)]
    min_length: usize,

    /// Field identifier every page must contain. Repeatable.
    #[arg(long = "expect-field", env = "PDFX_EXPECT_FIELDS", value_delimiter = ',')]
    expect_fields: Vec<String>,

    /// Append one JSON line per run to this file.
    #[arg(long, env = "PDFX_AUDIT_LOG")]
    audit_log: Option<PathBuf>,

    /// Prune audit entries older than this many hours (0 keeps everything).
    #[arg(long, env = "PDFX_AUDIT_RETENTION_HOURS",
          default_value_t = AuditConfig::DEFAULT_RETENTION_HOURS)]
    audit_retention_hours: u64,

    /// Free text embedded in the output as an EXTRA METADATA comment.
    #[arg(long, env = "PDFX_EXTRA_METADATA")]
    extra_metadata: Option<String>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDFX_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDFX_QUIET")]
    quiet: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDFX_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // INFO logs would tear the progress bar, so it gets the error level.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.analyze_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new_dynamic() as Arc<dyn ExtractionProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Analyze-only mode ────────────────────────────────────────────────
    if cli.analyze_only {
        let summary = analyze(&cli.input, &config)
            .await
            .context("Failed to analyze PDF")?;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
            );
        } else {
            let e = &summary.estimate;
            println!("File:          {}", cli.input.display());
            println!("Pages:         {}", summary.page_count);
            println!("Text pages:    {:?}", summary.text_pages());
            println!("Form pages:    {:?}", summary.form_pages());
            println!("Empty pages:   {:?}", summary.empty_pages());
            println!("Full AI cost:  ${:.4}", e.full_ai_cost);
            println!("Hybrid cost:   ${:.4}", e.hybrid_cost);
            println!("Savings:       ${:.4} ({:.1}%)", e.savings, e.savings_percentage);
        }
        return Ok(());
    }

    // ── Run extraction ───────────────────────────────────────────────────
    let result = match &cli.output {
        Some(path) => extract_to_file(&cli.input, path, &config).await,
        None => extract(&cli.input, &config).await,
    };
    let output = match result {
        Ok(output) => output,
        Err(ExtractError::BatchFailed(batch)) => {
            if !cli.quiet {
                for error in batch.failed_pages() {
                    let code = error.code.map(|c| format!(" {c}")).unwrap_or_default();
                    eprintln!("  {} page {}: {}{} {}", red("✗"), error.page, error.kind, code, dim(&error.message));
                }
                eprintln!(
                    "{}",
                    dim("Re-run with --partial to keep the pages that succeeded.")
                );
            }
            return Err(ExtractError::BatchFailed(batch)).context("Extraction failed");
        }
        Err(e) => return Err(e).context("Extraction failed"),
    };

    if cli.output.is_none() {
        print_output(&output, cli.json)?;
    } else if cli.json {
        print_output(&output, true)?;
    }

    if output.reused && !cli.quiet && !cli.json {
        let target = cli.output.as_ref().map(|p| p.display().to_string()).unwrap_or_default();
        eprintln!(
            "{}  {} already holds this extraction {}",
            green("✔"),
            bold(&target),
            dim("(--force to extract again)")
        );
    } else if !cli.quiet && !cli.json {
        let stats = &output.stats;
        let target = cli
            .output
            .as_ref()
            .map(|p| format!("  →  {}", bold(&p.display().to_string())))
            .unwrap_or_default();
        eprintln!(
            "{}  {}/{} pages  {}ms{}",
            if stats.failed == 0 { green("✔") } else { cyan("⚠") },
            stats.succeeded,
            stats.selected_pages,
            stats.duration_ms,
            target,
        );
        eprintln!(
            "   {} tokens in  /  {} tokens out  /  ${:.6}",
            dim(&stats.usage.input_tokens.to_string()),
            dim(&stats.usage.output_tokens.to_string()),
            stats.usage.cost(),
        );
        if stats.degraded > 0 {
            eprintln!("   {} pages fell back to local text", stats.degraded);
        }
    }

    Ok(())
}

fn print_output(output: &ExtractionOutput, json: bool) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if json {
        let json = serde_json::to_string_pretty(output).context("Failed to serialise output")?;
        writeln!(handle, "{json}").context("Failed to write to stdout")?;
    } else {
        handle
            .write_all(output.content.as_bytes())
            .context("Failed to write to stdout")?;
        if !output.content.ends_with('\n') {
            handle.write_all(b"\n").ok();
        }
    }
    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let mut provider = ProviderConfig::default();
    if !cli.endpoints.is_empty() {
        provider.endpoints = cli.endpoints.clone();
    }
    if let Some(model) = &cli.model {
        provider.model = model.clone();
    }
    if let Some(id) = &cli.provider_id {
        provider.id = id.clone();
    }
    if let Some(name) = &cli.provider_name {
        provider.name = name.clone();
    }
    if let Some(env) = &cli.api_key_env {
        provider.api_key_env = env.clone();
    }
    if let Some(n) = cli.parallelism {
        provider.max_parallelism = n;
    }
    if let Some(bytes) = cli.max_payload_bytes {
        provider.max_payload_bytes = bytes;
    }
    provider.api_key = cli.api_key.clone();

    let validation = ValidationConfig {
        enabled: !cli.no_validate,
        fallback_to_text: cli.fallback_to_text,
        min_content_length: cli.min_length,
        strict: cli.strict,
        expected_field_ids: cli.expect_fields.clone(),
    };

    let mut builder = ExtractionConfig::builder()
        .provider(provider)
        .max_retries(cli.max_retries)
        .request_timeout_secs(cli.timeout)
        .dpi(cli.dpi)
        .force_ai(cli.force_ai)
        .batch_policy(if cli.partial {
            BatchPolicy::Partial
        } else {
            BatchPolicy::FailFast
        })
        .validation(validation)
        .pages(parse_pages(&cli.pages)?)
        .output_format(
            cli.format
                .parse::<OutputFormat>()
                .context("Invalid --format")?,
        )
        .force_reextract(cli.force);

    if let Some(password) = &cli.password {
        builder = builder.password(password.clone());
    }
    if let Some(extra) = &cli.extra_metadata {
        builder = builder.extra_metadata(extra.clone());
    }
    if let Some(path) = &cli.audit_log {
        builder = builder.audit(AuditConfig {
            path: path.clone(),
            retention_hours: Some(cli.audit_retention_hours).filter(|h| *h > 0),
        });
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Parse `--pages` into a `PageSelection`.
fn parse_pages(s: &str) -> Result<PageSelection> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("all") {
        return Ok(PageSelection::All);
    }
    PageSelection::parse(s).with_context(|| format!("Invalid --pages value '{s}'"))
}
