//! Configuration types for hybrid PDF extraction.
//!
//! All run behaviour is controlled through [`ExtractionConfig`], built via its
//! [`ExtractionConfigBuilder`]. Provider specifics (endpoints, payload
//! ceiling, parallelism, pricing) live in [`ProviderConfig`] and are treated
//! as opaque parameters by the rest of the pipeline.

use crate::error::ExtractError;
use crate::pipeline::client::PageExtractor;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for one extraction run.
///
/// # Example
/// ```rust
/// use edgequake_pdfx::{BatchPolicy, ExtractionConfig};
///
/// let config = ExtractionConfig::builder()
///     .max_retries(3)
///     .batch_policy(BatchPolicy::Partial)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Remote vision provider used for FORM pages.
    pub provider: ProviderConfig,

    /// Retry budget of the extraction client. Default: 2.
    ///
    /// A page gets at most `max_retries + 2` remote attempts before it fails.
    pub max_retries: u32,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Nucleus sampling. Default: 0.1.
    pub top_p: f32,

    /// Maximum tokens the model may generate per page. Default: 4000.
    pub max_tokens: u32,

    /// Per-HTTP-call timeout in seconds. Default: 60.
    ///
    /// There is no per-page or per-batch timeout; a page whose attempts all
    /// time out simply fails.
    pub request_timeout_secs: u64,

    /// Rendering DPI for pages sent to the model. Range: 72–400. Default: 150.
    pub dpi: u32,

    /// Render pages in grayscale. Default: true.
    ///
    /// Forms are almost always black ink on white; grayscale roughly thirds
    /// the payload without hurting field detection.
    pub grayscale: bool,

    /// Route every non-empty page to the model. Default: false.
    pub force_ai: bool,

    /// What to do when any page fails. Default: [`BatchPolicy::FailFast`].
    pub batch_policy: BatchPolicy,

    /// Per-page output validation.
    pub validation: ValidationConfig,

    /// Pages to process. Default: all.
    pub pages: PageSelection,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Custom system prompt. If None, uses the built-in form extractor prompt.
    pub system_prompt: Option<String>,

    /// Custom user instruction sent next to the page image.
    pub vision_prompt: Option<String>,

    /// Free text embedded as an `EXTRA METADATA` comment in the output.
    pub extra_metadata: Option<String>,

    /// Shape of the page bodies. Default: [`OutputFormat::Markdown`].
    pub output_format: OutputFormat,

    /// Extract again even when the target file already holds a complete
    /// extraction of the same document. Default: false.
    pub force_reextract: bool,

    /// Run audit log. Default: none.
    pub audit: Option<AuditConfig>,

    /// Pre-built extractor. Takes precedence over the HTTP client built from
    /// `provider`.
    pub extractor: Option<Arc<dyn PageExtractor>>,

    /// Optional per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            max_retries: 2,
            temperature: 0.0,
            top_p: 0.1,
            max_tokens: 4000,
            request_timeout_secs: 60,
            dpi: 150,
            grayscale: true,
            force_ai: false,
            batch_policy: BatchPolicy::default(),
            validation: ValidationConfig::default(),
            pages: PageSelection::default(),
            password: None,
            system_prompt: None,
            vision_prompt: None,
            extra_metadata: None,
            output_format: OutputFormat::default(),
            force_reextract: false,
            audit: None,
            extractor: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("provider", &self.provider)
            .field("max_retries", &self.max_retries)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("dpi", &self.dpi)
            .field("grayscale", &self.grayscale)
            .field("force_ai", &self.force_ai)
            .field("batch_policy", &self.batch_policy)
            .field("validation", &self.validation)
            .field("pages", &self.pages)
            .field("output_format", &self.output_format)
            .field("force_reextract", &self.force_reextract)
            .field("audit", &self.audit)
            .field("extractor", &self.extractor.as_ref().map(|_| "<dyn PageExtractor>"))
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Total remote attempts a single page may make.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 2
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn provider(mut self, provider: ProviderConfig) -> Self {
        self.config.provider = provider;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn top_p(mut self, p: f32) -> Self {
        self.config.top_p = p.clamp(0.0, 1.0);
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn grayscale(mut self, v: bool) -> Self {
        self.config.grayscale = v;
        self
    }

    pub fn force_ai(mut self, v: bool) -> Self {
        self.config.force_ai = v;
        self
    }

    pub fn batch_policy(mut self, policy: BatchPolicy) -> Self {
        self.config.batch_policy = policy;
        self
    }

    pub fn validation(mut self, validation: ValidationConfig) -> Self {
        self.config.validation = validation;
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn vision_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.vision_prompt = Some(prompt.into());
        self
    }

    pub fn extra_metadata(mut self, text: impl Into<String>) -> Self {
        self.config.extra_metadata = Some(text.into());
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.config.output_format = format;
        self
    }

    pub fn force_reextract(mut self, v: bool) -> Self {
        self.config.force_reextract = v;
        self
    }

    pub fn audit(mut self, audit: AuditConfig) -> Self {
        self.config.audit = Some(audit);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn PageExtractor>) -> Self {
        self.config.extractor = Some(extractor);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(ExtractError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.provider.endpoints.is_empty() {
            return Err(ExtractError::InvalidConfig(format!(
                "Provider '{}' has no endpoints",
                c.provider.id
            )));
        }
        if c.provider.max_parallelism == 0 {
            return Err(ExtractError::InvalidConfig(
                "Provider parallelism must be ≥ 1".into(),
            ));
        }
        if c.provider.max_payload_bytes < 1024 {
            return Err(ExtractError::InvalidConfig(format!(
                "Payload ceiling of {} bytes is too small to carry a page",
                c.provider.max_payload_bytes
            )));
        }
        if c.request_timeout_secs == 0 {
            return Err(ExtractError::InvalidConfig(
                "Request timeout must be ≥ 1 second".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Provider ─────────────────────────────────────────────────────────────

/// One OpenAI-compatible chat-completions provider.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Short stable identifier, recorded in the audit log.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Full chat-completions URLs. More than one enables round robin.
    pub endpoints: Vec<String>,
    /// Model identifier sent with each request.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Explicit API key. Takes precedence over `api_key_env`.
    #[serde(skip)]
    pub api_key: Option<String>,
    /// Concurrent requests the provider tolerates. Default: 5.
    pub max_parallelism: usize,
    /// Largest base64 image the endpoint accepts, in bytes. Default: 4 MiB.
    pub max_payload_bytes: usize,
    pub pricing: TokenPricing,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: "openrouter".into(),
            name: "OpenRouter".into(),
            endpoints: vec!["https://openrouter.ai/api/v1/chat/completions".into()],
            model: "google/gemini-2.5-flash-lite".into(),
            api_key_env: "OPENROUTER_API_KEY".into(),
            api_key: None,
            max_parallelism: 5,
            max_payload_bytes: 4 * 1024 * 1024,
            pricing: TokenPricing::default(),
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("endpoints", &self.endpoints)
            .field("model", &self.model)
            .field("api_key_env", &self.api_key_env)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("max_parallelism", &self.max_parallelism)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .field("pricing", &self.pricing)
            .finish()
    }
}

impl ProviderConfig {
    /// Resolve the API key from the explicit value or the environment.
    pub fn resolve_api_key(&self) -> Result<String, ExtractError> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Ok(key.clone());
        }
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ExtractError::ProviderNotConfigured {
                provider: self.id.clone(),
                hint: format!("Set {} or pass --api-key.", self.api_key_env),
            }),
        }
    }
}

/// Per-million-token prices plus the input-token estimate for one page image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    /// Input tokens one rendered page costs, used for up-front estimates.
    pub image_tokens_estimate: u64,
}

impl Default for TokenPricing {
    fn default() -> Self {
        Self {
            input_per_million: 0.10,
            output_per_million: 0.40,
            image_tokens_estimate: 1_290,
        }
    }
}

impl TokenPricing {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (output_tokens as f64 / 1_000_000.0) * self.output_per_million
    }
}

// ── Validation / audit ───────────────────────────────────────────────────

/// How model output is checked before it is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Run the validator on model output. Default: true.
    pub enabled: bool,
    /// Replace invalid model output by local text instead of keeping it.
    /// Default: false.
    pub fallback_to_text: bool,
    /// Content shorter than this is flagged. Default: 100.
    pub min_content_length: usize,
    /// Promote short output from WARNING to ERROR. Default: false.
    pub strict: bool,
    /// Field identifiers (e.g. `1.2`) every page is expected to carry.
    pub expected_field_ids: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_to_text: false,
            min_content_length: 100,
            strict: false,
            expected_field_ids: Vec::new(),
        }
    }
}

/// Append-only JSON-lines audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub path: PathBuf,
    /// Entries older than this are pruned before each append.
    pub retention_hours: Option<u64>,
}

impl AuditConfig {
    /// Default retention when enabled from the environment.
    pub const DEFAULT_RETENTION_HOURS: u64 = 24;

    /// Read `PDFX_AUDIT_LOG` / `PDFX_AUDIT_RETENTION_HOURS`.
    pub fn from_env() -> Option<Self> {
        let path = std::env::var("PDFX_AUDIT_LOG").ok().filter(|p| !p.is_empty())?;
        let retention_hours = std::env::var("PDFX_AUDIT_RETENTION_HOURS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(Self::DEFAULT_RETENTION_HOURS);
        Some(Self {
            path: PathBuf::from(path),
            retention_hours: Some(retention_hours).filter(|h| *h > 0),
        })
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// What happens to a run in which some page failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BatchPolicy {
    /// Discard the document and return [`ExtractError::BatchFailed`].
    #[default]
    FailFast,
    /// Emit the document with error markers in place of failed pages.
    Partial,
}

/// Shape of the page bodies in the assembled document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// Normalised model output and local text, as extracted.
    #[default]
    Markdown,
    /// Sections and fields rewritten into one fixed layout: `## n. Section`,
    /// `### n.m Field`, then a `value:` line or a typed option list.
    CanonicalMarkdown,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Markdown => "markdown",
            OutputFormat::CanonicalMarkdown => "canonical-markdown",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            "canonical-markdown" | "canonical" => Ok(OutputFormat::CanonicalMarkdown),
            other => Err(ExtractError::InvalidConfig(format!(
                "Unknown output format: '{other}'"
            ))),
        }
    }
}

/// Specifies which pages of the PDF to process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum PageSelection {
    /// All pages (default).
    #[default]
    All,
    /// A single page (1-indexed).
    Single(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand into a sorted, deduplicated list of 1-indexed page numbers.
    ///
    /// Fails when an explicitly requested page does not exist, or when the
    /// selection names no page at all.
    pub fn resolve(&self, total_pages: usize) -> Result<Vec<usize>, ExtractError> {
        let out_of_range = |page: usize| ExtractError::PageOutOfRange {
            page,
            total: total_pages,
        };
        let mut pages: Vec<usize> = match self {
            PageSelection::All => (1..=total_pages).collect(),
            PageSelection::Single(p) => vec![*p],
            PageSelection::Range(start, end) if end < start => {
                return Err(ExtractError::InvalidConfig(format!(
                    "Invalid page range: {start}-{end}"
                )));
            }
            PageSelection::Range(start, end) => ((*start).max(1)..=*end).collect(),
            PageSelection::Set(pages) if pages.is_empty() => {
                return Err(ExtractError::InvalidConfig("Empty page set".into()));
            }
            PageSelection::Set(pages) => pages.clone(),
        };
        if let Some(&bad) = pages.iter().find(|&&p| p == 0 || p > total_pages) {
            return Err(out_of_range(bad));
        }
        pages.sort_unstable();
        pages.dedup();
        Ok(pages)
    }

    /// Parse `"1,3-5,8"` style page lists.
    pub fn parse(spec: &str) -> Result<Self, ExtractError> {
        let mut pages = Vec::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let bad = || ExtractError::InvalidConfig(format!("Invalid page spec: '{part}'"));
            if let Some((a, b)) = part.split_once('-') {
                let start: usize = a.trim().parse().map_err(|_| bad())?;
                let end: usize = b.trim().parse().map_err(|_| bad())?;
                if start == 0 || end < start {
                    return Err(bad());
                }
                pages.extend(start..=end);
            } else {
                pages.push(part.parse().map_err(|_| bad())?);
            }
        }
        match pages.as_slice() {
            [] => Err(ExtractError::InvalidConfig("Empty page spec".into())),
            [single] => Ok(PageSelection::Single(*single)),
            _ => Ok(PageSelection::Set(pages)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ExtractionConfig::default();
        assert_eq!(c.max_retries, 2);
        assert_eq!(c.max_attempts(), 4);
        assert_eq!(c.batch_policy, BatchPolicy::FailFast);
        assert_eq!(c.temperature, 0.0);
        assert!(c.validation.enabled);
        assert!(!c.validation.fallback_to_text);
    }

    #[test]
    fn builder_rejects_zero_parallelism() {
        let provider = ProviderConfig {
            max_parallelism: 0,
            ..ProviderConfig::default()
        };
        let err = ExtractionConfig::builder().provider(provider).build();
        assert!(matches!(err, Err(ExtractError::InvalidConfig(_))));
    }

    #[test]
    fn builder_rejects_missing_endpoints() {
        let provider = ProviderConfig {
            endpoints: vec![],
            ..ProviderConfig::default()
        };
        assert!(ExtractionConfig::builder().provider(provider).build().is_err());
    }

    #[test]
    fn dpi_is_clamped() {
        let c = ExtractionConfig::builder().dpi(1000).build().unwrap();
        assert_eq!(c.dpi, 400);
    }

    #[test]
    fn selection_resolve() {
        assert_eq!(PageSelection::All.resolve(3).unwrap(), vec![1, 2, 3]);
        assert_eq!(PageSelection::Range(2, 4).resolve(5).unwrap(), vec![2, 3, 4]);
        assert_eq!(
            PageSelection::Set(vec![3, 1, 3]).resolve(3).unwrap(),
            vec![1, 3]
        );
        assert!(matches!(
            PageSelection::Single(9).resolve(3),
            Err(ExtractError::PageOutOfRange { page: 9, total: 3 })
        ));
    }

    #[test]
    fn output_format_names() {
        assert_eq!(
            "canonical".parse::<OutputFormat>().unwrap(),
            OutputFormat::CanonicalMarkdown
        );
        assert_eq!(OutputFormat::CanonicalMarkdown.to_string(), "canonical-markdown");
        assert_eq!(
            OutputFormat::default().as_str().parse::<OutputFormat>().unwrap(),
            OutputFormat::Markdown
        );
        assert!(matches!(
            "html".parse::<OutputFormat>(),
            Err(ExtractError::InvalidConfig(_))
        ));
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(matches!(
            PageSelection::Range(5, 2).resolve(10),
            Err(ExtractError::InvalidConfig(msg)) if msg.contains("5-2")
        ));
        assert!(matches!(
            PageSelection::Set(vec![]).resolve(10),
            Err(ExtractError::InvalidConfig(_))
        ));
        assert_eq!(PageSelection::Range(3, 3).resolve(10).unwrap(), vec![3]);
    }

    #[test]
    fn selection_parse() {
        match PageSelection::parse("1,3-5,8").unwrap() {
            PageSelection::Set(p) => assert_eq!(p, vec![1, 3, 4, 5, 8]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(PageSelection::parse("7").unwrap(), PageSelection::Single(7)));
        assert!(PageSelection::parse("5-2").is_err());
        assert!(PageSelection::parse("x").is_err());
        assert!(PageSelection::parse("").is_err());
    }

    #[test]
    fn pricing_cost() {
        let p = TokenPricing {
            input_per_million: 1.0,
            output_per_million: 2.0,
            image_tokens_estimate: 1000,
        };
        assert!((p.cost(1_000_000, 500_000) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn explicit_api_key_wins() {
        let provider = ProviderConfig {
            api_key: Some("sk-test".into()),
            api_key_env: "PDFX_TEST_UNSET_VARIABLE".into(),
            ..ProviderConfig::default()
        };
        assert_eq!(provider.resolve_api_key().unwrap(), "sk-test");
    }

    #[test]
    fn missing_api_key_is_provider_error() {
        let provider = ProviderConfig {
            api_key_env: "PDFX_TEST_DEFINITELY_UNSET".into(),
            ..ProviderConfig::default()
        };
        assert!(matches!(
            provider.resolve_api_key(),
            Err(ExtractError::ProviderNotConfigured { .. })
        ));
    }

    #[test]
    fn debug_redacts_key() {
        let provider = ProviderConfig {
            api_key: Some("sk-secret".into()),
            ..ProviderConfig::default()
        };
        assert!(!format!("{provider:?}").contains("sk-secret"));
    }
}
