//! Extraction client: local text for TEXT pages, a vision model for FORM pages.
//!
//! The remote side is an injected capability, [`PageExtractor`]. The
//! production implementation, [`VisionClient`], renders the page, encodes it
//! under the provider's payload ceiling, posts an OpenAI-compatible
//! chat-completions request through a [`ChatTransport`] and normalises the
//! answer.
//!
//! ## Retry Strategy
//!
//! Each page gets at most `max_retries + 2` attempts.
//!
//! | Failure | Behaviour |
//! |---------|-----------|
//! | 401 / 402 / 403 | fail immediately (PAYMENT) |
//! | quota exhaustion (200 body, or 429 naming a billing quota) | at most 2 retries, then PAYMENT |
//! | 413 | retry with the payload ceiling halved |
//! | 429 / 5xx / network / malformed body | retry until the budget is spent |
//!
//! The delay before retry `n` (0-based failed attempt) is the server's
//! `retry-after` capped at 60 s, else `min(2^(n+1), 30)` seconds.

use crate::config::{ExtractionConfig, ProviderConfig};
use crate::error::{classify_message, ErrorKind, ExtractError, PageError};
use crate::output::UsageAccumulator;
use crate::pipeline::document::{DocumentSource, RenderOptions};
use crate::pipeline::encode::{encode_page, EncodedImage};
use crate::pipeline::normalize::normalize_response;
use crate::prompts::{DEFAULT_SYSTEM_PROMPT, DEFAULT_VISION_PROMPT};
use async_trait::async_trait;
use image::DynamicImage;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

/// Quota exhaustion is retried at most this many times.
pub const MAX_QUOTA_RETRIES: u32 = 2;
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);
const MAX_BACKOFF_SECS: u64 = 30;
const MIN_PAYLOAD_CEILING: usize = 16 * 1024;
const ERROR_BODY_PREVIEW: usize = 300;

// ── Capability ───────────────────────────────────────────────────────────

/// Content and usage returned by a successful remote extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteExtraction {
    /// Normalised markdown.
    pub content: String,
    pub usage: UsageAccumulator,
    /// Requests made, including the successful one.
    pub attempts: u32,
}

/// A classified failure after the client gave up on a page.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error}")]
pub struct ExtractionFailure {
    pub error: PageError,
    pub attempts: u32,
}

impl From<PageError> for ExtractionFailure {
    fn from(error: PageError) -> Self {
        Self { error, attempts: 1 }
    }
}

/// Extracts one page through a remote model.
///
/// The orchestrator only ever calls this for FORM pages. Tests swap in fakes.
#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn extract(&self, page: usize) -> Result<RemoteExtraction, ExtractionFailure>;
}

// ── Local extraction ─────────────────────────────────────────────────────

/// Free, deterministic extraction of a page's own text layer.
pub async fn extract_text_locally(
    document: &Arc<dyn DocumentSource>,
    page: usize,
) -> Result<String, PageError> {
    let document = Arc::clone(document);
    let text = tokio::task::spawn_blocking(move || document.page_text(page))
        .await
        .map_err(|e| PageError::new(page, ErrorKind::Unknown, None, format!("text task panicked: {e}")))?
        .map_err(|e| PageError::new(page, ErrorKind::Unknown, None, e.to_string()))?;
    Ok(tidy_local_text(&text))
}

fn tidy_local_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

// ── Endpoint rotation ────────────────────────────────────────────────────

/// Round-robin over a provider's regional endpoints.
///
/// Owned by the client and shared by handle; every request takes the next
/// endpoint.
#[derive(Debug)]
pub struct EndpointRotation {
    endpoints: Vec<String>,
    cursor: AtomicUsize,
}

impl EndpointRotation {
    pub fn new(endpoints: Vec<String>) -> Result<Self, ExtractError> {
        Self::starting_at(endpoints, 0)
    }

    /// Rotation whose first request goes to `endpoints[offset % len]`.
    pub fn starting_at(endpoints: Vec<String>, offset: usize) -> Result<Self, ExtractError> {
        if endpoints.is_empty() {
            return Err(ExtractError::InvalidConfig(
                "endpoint rotation needs at least one endpoint".into(),
            ));
        }
        Ok(Self {
            endpoints,
            cursor: AtomicUsize::new(offset),
        })
    }

    pub fn next_endpoint(&self) -> &str {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[idx]
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

// ── Transport ────────────────────────────────────────────────────────────

/// Raw HTTP answer, before any interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

/// The request never produced an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub message: String,
    pub timed_out: bool,
}

/// Posts a JSON body to a chat-completions endpoint.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        api_key: &str,
        body: &Value,
    ) -> Result<TransportResponse, TransportError>;
}

/// [`ChatTransport`] over reqwest with a per-call timeout.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, ExtractError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ChatTransport for ReqwestTransport {
    async fn post(
        &self,
        url: &str,
        api_key: &str,
        body: &Value,
    ) -> Result<TransportResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError {
                message: e.to_string(),
                timed_out: e.is_timeout(),
            })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.map_err(|e| TransportError {
            message: e.to_string(),
            timed_out: e.is_timeout(),
        })?;

        Ok(TransportResponse {
            status,
            retry_after,
            body,
        })
    }
}

/// `retry-after` in delta-seconds. HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Delay before retrying after failed attempt `attempt` (0-based).
pub fn backoff_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    match retry_after {
        Some(d) => d.min(MAX_RETRY_AFTER),
        None => {
            let secs = 1u64
                .checked_shl(attempt + 1)
                .unwrap_or(u64::MAX)
                .min(MAX_BACKOFF_SECS);
            Duration::from_secs(secs)
        }
    }
}

// ── Response interpretation ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    cost: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: Option<String>,
    code: Option<Value>,
    status: Option<String>,
}

impl WireError {
    fn numeric_code(&self) -> Option<u16> {
        match &self.code {
            Some(Value::Number(n)) => n.as_u64().and_then(|c| u16::try_from(c).ok()),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(status) = &self.status {
            parts.push(status.clone());
        }
        if let Some(Value::String(code)) = &self.code {
            parts.push(code.clone());
        }
        if let Some(message) = &self.message {
            parts.push(message.clone());
        }
        if parts.is_empty() {
            "provider returned an error".to_string()
        } else {
            parts.join(": ")
        }
    }
}

/// One failed attempt, before the retry decision.
#[derive(Debug, Clone)]
struct AttemptFailure {
    kind: ErrorKind,
    code: Option<u16>,
    message: String,
    retry_after: Option<Duration>,
    /// Quota exhaustion, distinct from plain rate limiting.
    quota: bool,
}

impl AttemptFailure {
    fn into_page_error(self, page: usize) -> PageError {
        PageError::new(page, self.kind, self.code, self.message)
    }
}

struct Completion {
    content: String,
    prompt_tokens: u64,
    completion_tokens: u64,
    reported_cost: Option<f64>,
}

fn mentions_exhaustion(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("resource_exhausted")
        || lower.contains("resource exhausted")
        || lower.contains("quota")
}

/// Billing quota, as opposed to a per-minute or per-day rate quota.
const BILLING_QUOTA_PHRASES: [&str; 5] = [
    "insufficient_quota",
    "exceeded your current quota",
    "check your plan and billing",
    "billing",
    "out of credits",
];

fn names_billing_quota(body: &str) -> bool {
    let lower = body.to_lowercase();
    BILLING_QUOTA_PHRASES.iter().any(|p| lower.contains(p))
}

fn preview(body: &str) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(ERROR_BODY_PREVIEW) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Turn a transport response into content or a classified failure.
fn interpret(response: TransportResponse) -> Result<Completion, AttemptFailure> {
    let parsed = serde_json::from_str::<ChatCompletion>(&response.body);

    if response.status != 200 {
        let message = match &parsed {
            Ok(ChatCompletion { error: Some(e), .. }) => e.describe(),
            _ => preview(&response.body),
        };
        let message = format!("HTTP {}: {}", response.status, message);
        let quota = response.status == 429 && names_billing_quota(&response.body);
        let mut kind = ErrorKind::from_status(response.status);
        let mut code = Some(response.status);
        if kind == ErrorKind::Unknown {
            let (guessed, guessed_code) = classify_message(&message);
            if guessed != ErrorKind::Unknown {
                kind = guessed;
                code = guessed_code.or(code);
            }
        }
        return Err(AttemptFailure {
            kind: if quota { ErrorKind::Payment } else { kind },
            code,
            message,
            retry_after: response.retry_after,
            quota,
        });
    }

    let completion = parsed.map_err(|e| AttemptFailure {
        kind: ErrorKind::ModelResponse,
        code: None,
        message: format!("unparseable response: {e}"),
        retry_after: None,
        quota: false,
    })?;

    if let Some(error) = &completion.error {
        let message = error.describe();
        let quota = mentions_exhaustion(&message)
            || matches!(&error.code, Some(Value::String(c)) if mentions_exhaustion(c));
        let code = error.numeric_code();
        let kind = if quota {
            ErrorKind::Payment
        } else {
            code.map(ErrorKind::from_status)
                .filter(|k| *k != ErrorKind::Unknown)
                .unwrap_or(ErrorKind::ModelResponse)
        };
        return Err(AttemptFailure {
            kind,
            code,
            message,
            retry_after: response.retry_after,
            quota,
        });
    }

    let content = completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .and_then(|content| match content {
            Value::String(s) => Some(s),
            Value::Array(parts) => Some(
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join(""),
            ),
            _ => None,
        })
        .ok_or_else(|| AttemptFailure {
            kind: ErrorKind::ModelResponse,
            code: None,
            message: "response carries no message content".into(),
            retry_after: None,
            quota: false,
        })?;

    let usage = completion.usage.unwrap_or_default();
    Ok(Completion {
        content,
        prompt_tokens: usage.prompt_tokens.unwrap_or(0),
        completion_tokens: usage.completion_tokens.unwrap_or(0),
        reported_cost: usage.cost,
    })
}

// ── Vision client ────────────────────────────────────────────────────────

/// [`PageExtractor`] backed by an OpenAI-compatible vision endpoint.
pub struct VisionClient {
    provider: ProviderConfig,
    api_key: String,
    document: Arc<dyn DocumentSource>,
    transport: Arc<dyn ChatTransport>,
    rotation: Arc<EndpointRotation>,
    render: RenderOptions,
    max_attempts: u32,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    system_prompt: String,
    vision_prompt: String,
}

impl fmt::Debug for VisionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisionClient")
            .field("provider", &self.provider.id)
            .field("model", &self.provider.model)
            .field("endpoints", &self.rotation.endpoints())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl VisionClient {
    /// Build a client for `document` from the run configuration.
    ///
    /// Fails when no API key can be resolved.
    pub fn from_config(
        config: &ExtractionConfig,
        document: Arc<dyn DocumentSource>,
    ) -> Result<Self, ExtractError> {
        let api_key = config.provider.resolve_api_key()?;
        let transport = ReqwestTransport::new(Duration::from_secs(config.request_timeout_secs))?;
        let rotation = EndpointRotation::new(config.provider.endpoints.clone())?;
        Ok(Self {
            provider: config.provider.clone(),
            api_key,
            document,
            transport: Arc::new(transport),
            rotation: Arc::new(rotation),
            render: RenderOptions {
                dpi: config.dpi,
                grayscale: config.grayscale,
                ..RenderOptions::default()
            },
            max_attempts: config.max_attempts(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            vision_prompt: config
                .vision_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_VISION_PROMPT.to_string()),
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn ChatTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_rotation(mut self, rotation: Arc<EndpointRotation>) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn rotation(&self) -> &Arc<EndpointRotation> {
        &self.rotation
    }

    /// Chat-completions body: one system message, one user message with the
    /// instruction text and the inline page image.
    fn request_body(&self, image: &EncodedImage) -> Value {
        json!({
            "model": self.provider.model,
            "temperature": self.temperature,
            "top_p": self.top_p,
            "max_tokens": self.max_tokens,
            "messages": [
                { "role": "system", "content": self.system_prompt },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": self.vision_prompt },
                        { "type": "image_url", "image_url": { "url": image.data_url() } }
                    ]
                }
            ]
        })
    }

    async fn render(&self, page: usize) -> Result<Arc<DynamicImage>, PageError> {
        let document = Arc::clone(&self.document);
        let options = self.render;
        tokio::task::spawn_blocking(move || document.render_page(page, &options))
            .await
            .map_err(|e| PageError::new(page, ErrorKind::Unknown, None, format!("render task panicked: {e}")))?
            .map(Arc::new)
            .map_err(|e| PageError::new(page, ErrorKind::Unknown, None, e.to_string()))
    }

    async fn encode(
        &self,
        page: usize,
        image: &Arc<DynamicImage>,
        ceiling: usize,
    ) -> Result<EncodedImage, PageError> {
        let image = Arc::clone(image);
        tokio::task::spawn_blocking(move || encode_page(&image, ceiling))
            .await
            .map_err(|e| PageError::new(page, ErrorKind::Unknown, None, format!("encode task panicked: {e}")))?
            .map_err(|e| PageError::new(page, ErrorKind::Unknown, None, format!("image encoding failed: {e}")))
    }

    fn usage_of(&self, completion: &Completion) -> UsageAccumulator {
        let cost = completion
            .reported_cost
            .filter(|c| c.is_finite() && *c > 0.0)
            .unwrap_or_else(|| {
                self.provider
                    .pricing
                    .cost(completion.prompt_tokens, completion.completion_tokens)
            });
        UsageAccumulator::new(completion.prompt_tokens, completion.completion_tokens, cost)
    }
}

#[async_trait]
impl PageExtractor for VisionClient {
    async fn extract(&self, page: usize) -> Result<RemoteExtraction, ExtractionFailure> {
        let start = Instant::now();
        let not_sent = |error: PageError| ExtractionFailure { error, attempts: 0 };

        let image = self.render(page).await.map_err(not_sent)?;
        let mut ceiling = self.provider.max_payload_bytes;
        let mut encoded = self.encode(page, &image, ceiling).await.map_err(not_sent)?;

        let mut quota_hits = 0u32;
        let mut attempt = 0u32;
        loop {
            let url = self.rotation.next_endpoint();
            let body = self.request_body(&encoded);
            debug!(
                "Page {}: attempt {}/{} → {} ({} bytes image)",
                page,
                attempt + 1,
                self.max_attempts,
                url,
                encoded.payload_len()
            );

            let failure = match self.transport.post(url, &self.api_key, &body).await {
                Ok(response) => match interpret(response) {
                    Ok(completion) => {
                        let usage = self.usage_of(&completion);
                        debug!(
                            "Page {}: {} input tokens, {} output tokens, {:?}",
                            page,
                            usage.input_tokens,
                            usage.output_tokens,
                            start.elapsed()
                        );
                        return Ok(RemoteExtraction {
                            content: normalize_response(&completion.content),
                            usage,
                            attempts: attempt + 1,
                        });
                    }
                    Err(failure) => failure,
                },
                Err(e) => AttemptFailure {
                    kind: ErrorKind::Network,
                    code: None,
                    message: if e.timed_out {
                        format!("request timed out: {}", e.message)
                    } else {
                        e.message
                    },
                    retry_after: None,
                    quota: false,
                },
            };

            attempt += 1;
            warn!(
                "Page {}: attempt {}/{} failed ({}): {}",
                page, attempt, self.max_attempts, failure.kind, failure.message
            );

            if failure.quota {
                quota_hits += 1;
                if quota_hits > MAX_QUOTA_RETRIES {
                    return Err(ExtractionFailure {
                        error: PageError::new(
                            page,
                            ErrorKind::Payment,
                            failure.code,
                            format!("quota exhausted: {}", failure.message),
                        ),
                        attempts: attempt,
                    });
                }
            } else if !failure.kind.is_retryable() {
                return Err(ExtractionFailure {
                    error: failure.into_page_error(page),
                    attempts: attempt,
                });
            }

            if attempt >= self.max_attempts {
                return Err(ExtractionFailure {
                    error: failure.into_page_error(page),
                    attempts: attempt,
                });
            }

            if failure.kind == ErrorKind::PayloadTooLarge {
                ceiling = (ceiling / 2).max(MIN_PAYLOAD_CEILING);
                encoded = self
                    .encode(page, &image, ceiling)
                    .await
                    .map_err(|error| ExtractionFailure {
                        error,
                        attempts: attempt,
                    })?;
            }

            let delay = backoff_delay(attempt - 1, failure.retry_after);
            debug!("Page {}: retrying in {:?}", page, delay);
            sleep(delay).await;
        }
    }
}
