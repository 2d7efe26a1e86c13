//! Progress-callback trait for per-page extraction events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to receive
//! events as pages are classified and extracted.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdfx::{ExtractionConfig, ExtractionProgressCallback, PageClass};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct FormCounter {
//!     forms: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for FormCounter {
//!     fn on_page_start(&self, _page: usize, _total: usize, class: PageClass) {
//!         if class == PageClass::Form {
//!             self.forms.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(FormCounter { forms: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::PageClass;
use std::sync::Arc;

/// Called by the orchestrator as it processes each page.
///
/// Pages are extracted concurrently, so `on_page_*` methods may be called
/// from different tasks at once. All methods default to no-ops.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called once after classification, before any page is dispatched.
    ///
    /// # Arguments
    /// * `total_pages`: number of pages in this run
    /// * `form_pages` : how many of them go to the remote model
    fn on_extraction_start(&self, total_pages: usize, form_pages: usize) {
        let _ = (total_pages, form_pages);
    }

    /// Called when a worker picks up a page.
    fn on_page_start(&self, page: usize, total_pages: usize, class: PageClass) {
        let _ = (page, total_pages, class);
    }

    /// Called when a page produced content.
    ///
    /// # Arguments
    /// * `content_len`: byte length of the page's final content
    fn on_page_complete(&self, page: usize, total_pages: usize, content_len: usize) {
        let _ = (page, total_pages, content_len);
    }

    /// Called when a page failed after the client gave up on it.
    fn on_page_error(&self, page: usize, total_pages: usize, error: &str) {
        let _ = (page, total_pages, error);
    }

    /// Called once after every page has been attempted.
    fn on_extraction_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
