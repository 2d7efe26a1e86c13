//! Shared fakes for the integration tests: an in-memory document, a
//! scriptable page extractor and a scripted HTTP transport.

#![allow(dead_code)]

use async_trait::async_trait;
use edgequake_pdfx::pipeline::client::{TransportError, TransportResponse};
use edgequake_pdfx::pipeline::document::{ImageColorMode, PageInspection, RenderOptions};
use edgequake_pdfx::{
    ChatTransport, DocumentIdentity, DocumentSource, ErrorKind, ExtractError,
    ExtractionFailure, PageClass, PageError, PageExtractor, RemoteExtraction, UsageAccumulator,
};
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ── Document ─────────────────────────────────────────────────────────────

pub struct FakeDocument {
    identity: DocumentIdentity,
    classes: Vec<PageClass>,
    noisy_render: bool,
}

impl FakeDocument {
    pub fn new(classes: &[PageClass]) -> Self {
        Self {
            identity: DocumentIdentity::from_bytes("fake.pdf", format!("{classes:?}").as_bytes()),
            classes: classes.to_vec(),
            noisy_render: false,
        }
    }

    pub fn forms(n: usize) -> Self {
        Self::new(&vec![PageClass::Form; n])
    }

    /// Render incompressible noise instead of a blank page.
    pub fn with_noisy_render(mut self) -> Self {
        self.noisy_render = true;
        self
    }

    fn class(&self, page: usize) -> Result<PageClass, ExtractError> {
        page.checked_sub(1)
            .and_then(|i| self.classes.get(i))
            .copied()
            .ok_or(ExtractError::PageOutOfRange {
                page,
                total: self.classes.len(),
            })
    }
}

pub fn local_text(page: usize) -> String {
    format!("Local text layer of page {page}")
}

impl DocumentSource for FakeDocument {
    fn identity(&self) -> &DocumentIdentity {
        &self.identity
    }

    fn page_count(&self) -> usize {
        self.classes.len()
    }

    fn inspect_page(&self, page: usize) -> Result<PageInspection, ExtractError> {
        Ok(match self.class(page)? {
            PageClass::Empty => PageInspection::default(),
            PageClass::Text => PageInspection {
                has_text: true,
                widget_count: 0,
                images: vec![ImageColorMode::Grayscale],
            },
            PageClass::Form => PageInspection {
                has_text: true,
                widget_count: 3,
                images: vec![],
            },
        })
    }

    fn page_text(&self, page: usize) -> Result<String, ExtractError> {
        Ok(match self.class(page)? {
            PageClass::Empty => String::new(),
            _ => local_text(page),
        })
    }

    fn render_page(&self, page: usize, _options: &RenderOptions) -> Result<DynamicImage, ExtractError> {
        self.class(page)?;
        let img = if self.noisy_render {
            RgbImage::from_fn(128, 128, |x, y| {
                let mut h = x.wrapping_mul(0x9E37_79B9) ^ y.wrapping_mul(0x85EB_CA6B);
                h ^= h >> 15;
                h = h.wrapping_mul(0x2C1B_3C6D);
                h ^= h >> 12;
                let [r, g, b, _] = h.to_le_bytes();
                Rgb([r, g, b])
            })
        } else {
            RgbImage::from_pixel(32, 32, Rgb([255, 255, 255]))
        };
        Ok(DynamicImage::ImageRgb8(img))
    }
}

// ── Extractor ────────────────────────────────────────────────────────────

/// Content that passes validation and carries an identifier.
pub fn form_content(page: usize) -> String {
    format!(
        "## 1. Applicant details for page {page}\n\
### 1.1 Name\nJan Jansen\n\
### 1.2 Marital status\n- (x) married\n- ( ) single\n\
FORM 10{page:02}\n\
The applicant confirms that the information above is complete and correct.\n"
    )
}

#[derive(Default)]
pub struct FakeExtractor {
    delays: HashMap<usize, Duration>,
    failures: HashMap<usize, PageError>,
    contents: HashMap<usize, String>,
    calls: AtomicUsize,
    order: Mutex<Vec<usize>>,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, page: usize, ms: u64) -> Self {
        self.delays.insert(page, Duration::from_millis(ms));
        self
    }

    pub fn fail(mut self, page: usize, kind: ErrorKind, code: Option<u16>, message: &str) -> Self {
        self.failures
            .insert(page, PageError::new(page, kind, code, message));
        self
    }

    pub fn content(mut self, page: usize, content: &str) -> Self {
        self.contents.insert(page, content.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Pages in the order they finished.
    pub fn completion_order(&self) -> Vec<usize> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageExtractor for FakeExtractor {
    async fn extract(&self, page: usize) -> Result<RemoteExtraction, ExtractionFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delays.get(&page) {
            tokio::time::sleep(*delay).await;
        }
        self.order.lock().unwrap().push(page);
        if let Some(error) = self.failures.get(&page) {
            return Err(ExtractionFailure {
                error: error.clone(),
                attempts: 4,
            });
        }
        Ok(RemoteExtraction {
            content: self
                .contents
                .get(&page)
                .cloned()
                .unwrap_or_else(|| form_content(page)),
            usage: UsageAccumulator::new(1000, 100, 0.001),
            attempts: 1,
        })
    }
}

// ── Transport ────────────────────────────────────────────────────────────

/// One recorded request.
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub url: String,
    pub model: String,
    /// `image/png` or `image/jpeg`.
    pub image_mime: String,
    pub image_len: usize,
}

/// Replays scripted responses in order, then repeats the fallback forever.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    fallback: Result<TransportResponse, TransportError>,
    sent: Mutex<Vec<SentRequest>>,
}

impl ScriptedTransport {
    pub fn new(
        script: Vec<Result<TransportResponse, TransportError>>,
        fallback: Result<TransportResponse, TransportError>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn always(response: Result<TransportResponse, TransportError>) -> Self {
        Self::new(vec![], response)
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn post(
        &self,
        url: &str,
        _api_key: &str,
        body: &Value,
    ) -> Result<TransportResponse, TransportError> {
        let data_url = body["messages"][1]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap_or_default();
        let (prefix, data) = data_url.split_once(";base64,").unwrap_or(("", ""));
        self.sent.lock().unwrap().push(SentRequest {
            url: url.to_string(),
            model: body["model"].as_str().unwrap_or_default().to_string(),
            image_mime: prefix.trim_start_matches("data:").to_string(),
            image_len: data.len(),
        });
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

pub fn status(code: u16, body: &str) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status: code,
        retry_after: None,
        body: body.to_string(),
    })
}

pub fn status_with_retry_after(code: u16, secs: u64) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status: code,
        retry_after: Some(Duration::from_secs(secs)),
        body: r#"{"error":{"message":"Too many requests"}}"#.to_string(),
    })
}

pub fn completion(content: &str) -> Result<TransportResponse, TransportError> {
    let body = serde_json::json!({
        "choices": [{ "message": { "role": "assistant", "content": content } }],
        "usage": { "prompt_tokens": 1200, "completion_tokens": 300 }
    });
    status(200, &body.to_string())
}

pub fn network_error(message: &str) -> Result<TransportResponse, TransportError> {
    Err(TransportError {
        message: message.to_string(),
        timed_out: false,
    })
}
