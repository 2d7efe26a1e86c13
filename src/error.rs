//! Error types for the edgequake-pdfx library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`ExtractError`]: **Fatal**: the run cannot proceed or must not emit
//!   output (unreadable document, provider not configured, fail-fast batch
//!   failure). Returned as `Err(ExtractError)` from the top-level `extract*`
//!   functions.
//!
//! * [`PageError`]: **Non-fatal**: a single page failed after the client
//!   exhausted its retry budget. Stored inside [`crate::output::Page`] so
//!   callers can inspect which pages worked.
//!
//! Page failures are classified into a fixed [`ErrorKind`] taxonomy. The
//! structured HTTP status is always preferred; [`classify_message`] only
//! sniffs free text when the transport surfaced nothing better.

use crate::output::BatchResult;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdfx library.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── Document errors ───────────────────────────────────────────────────
    /// The document could not be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// Selected page numbers exceed the actual page count.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// The document opened but a page could not be inspected.
    #[error("Could not inspect page {page}: {detail}")]
    InspectionFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium, place the library next to the\n\
executable, or install it system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Provider errors ───────────────────────────────────────────────────
    /// The configured provider cannot be used (missing API key etc.).
    #[error("Provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Batch errors ──────────────────────────────────────────────────────
    /// At least one page failed while the batch policy was fail-fast.
    ///
    /// The carried [`BatchResult`] still holds the content of every page
    /// that succeeded and the classification of every failure.
    #[error("{}", .0.error_summary().unwrap_or_else(|| "batch failed".to_string()))]
    BatchFailed(Box<BatchResult>),

    /// The assembled document violated its structural invariants.
    #[error("Assembled output is malformed: {0}")]
    AssemblyDefect(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExtractError {
    /// The batch carried by a fail-fast failure, if this is one.
    pub fn batch(&self) -> Option<&BatchResult> {
        match self {
            ExtractError::BatchFailed(batch) => Some(batch),
            _ => None,
        }
    }
}

// ── Error taxonomy ───────────────────────────────────────────────────────

/// Classification of a page-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Billing, quota or authentication problem. Never retried.
    Payment,
    /// Request body above the provider's limit.
    PayloadTooLarge,
    /// HTTP 429 without a quota signal.
    RateLimit,
    /// Provider-side 5xx.
    Server,
    /// The provider answered but the body is unusable.
    ModelResponse,
    /// Connection failure or timeout.
    Network,
    Unknown,
}

impl ErrorKind {
    /// Stable name used in summaries, markers and the audit log.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Payment => "PaymentError",
            ErrorKind::PayloadTooLarge => "PayloadTooLargeError",
            ErrorKind::RateLimit => "RateLimitError",
            ErrorKind::Server => "ServerError",
            ErrorKind::ModelResponse => "ModelResponseError",
            ErrorKind::Network => "NetworkError",
            ErrorKind::Unknown => "UnknownError",
        }
    }

    /// Kinds that are expected to clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Server | ErrorKind::Network
        )
    }

    /// Whether the client may spend retry budget on this kind.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::Payment)
    }

    /// Map an HTTP status code onto the taxonomy.
    pub fn from_status(status: u16) -> ErrorKind {
        match status {
            401 | 402 | 403 => ErrorKind::Payment,
            413 => ErrorKind::PayloadTooLarge,
            429 => ErrorKind::RateLimit,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static STATUS_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([45]\d{2})\b").unwrap());

/// Best-effort classification of a free-text error message.
///
/// Looks for an embedded `4xx`/`5xx` code first, then for keywords. Returns
/// the kind together with the code it inferred, if any.
pub fn classify_message(message: &str) -> (ErrorKind, Option<u16>) {
    if let Some(code) = STATUS_IN_TEXT
        .captures(message)
        .and_then(|c| c[1].parse::<u16>().ok())
    {
        let kind = ErrorKind::from_status(code);
        if kind != ErrorKind::Unknown {
            return (kind, Some(code));
        }
    }

    let lower = message.to_lowercase();
    if ["payment", "quota", "billing", "insufficient credit"]
        .iter()
        .any(|k| lower.contains(k))
    {
        (ErrorKind::Payment, Some(402))
    } else if lower.contains("too large") || lower.contains("payload") {
        (ErrorKind::PayloadTooLarge, Some(413))
    } else if lower.contains("rate limit") || lower.contains("too many") {
        (ErrorKind::RateLimit, Some(429))
    } else if ["connection", "timeout", "timed out", "dns"]
        .iter()
        .any(|k| lower.contains(k))
    {
        (ErrorKind::Network, None)
    } else {
        (ErrorKind::Unknown, None)
    }
}

/// A non-fatal, classified failure of a single page.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("Page {page}: {kind}: {message}")]
pub struct PageError {
    /// 1-indexed page number.
    pub page: usize,
    pub kind: ErrorKind,
    /// HTTP status (or inferred code) when one was available.
    pub code: Option<u16>,
    pub message: String,
}

impl PageError {
    pub fn new(page: usize, kind: ErrorKind, code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            page,
            kind,
            code,
            message: message.into(),
        }
    }

    /// Build an error from a message alone, classifying it by content.
    pub fn from_message(page: usize, message: impl Into<String>) -> Self {
        let message = message.into();
        let (kind, code) = classify_message(&message);
        Self::new(page, kind, code, message)
    }
}
