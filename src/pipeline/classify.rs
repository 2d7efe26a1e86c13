//! Page classification and cost estimation.
//!
//! Every page lands in exactly one class:
//!
//! | Text | Widgets | Class |
//! |------|---------|-------|
//! | no   | none    | EMPTY |
//! | any  | ≥ 1     | FORM  |
//! | yes  | none    | TEXT  |
//!
//! Only FORM pages cost money. The summary carries an estimate of what the
//! run would cost with every page sent to the model versus the hybrid route.

use crate::config::TokenPricing;
use crate::error::ExtractError;
use crate::output::PageClass;
use crate::pipeline::document::{DocumentSource, ImageColorMode, PageInspection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Output tokens budgeted per page for estimates.
pub const ESTIMATED_OUTPUT_TOKENS_PER_PAGE: u64 = 500;

/// Apply the classification rule to one inspected page.
pub fn classify_page(inspection: &PageInspection) -> PageClass {
    if inspection.widget_count > 0 {
        PageClass::Form
    } else if inspection.has_text {
        PageClass::Text
    } else {
        PageClass::Empty
    }
}

/// `<!-- PAGE IMAGES: 2 | IMAGE 1: COLOR | IMAGE 2: GRAYSCALE -->`
pub fn image_descriptor(images: &[ImageColorMode]) -> String {
    let mut out = format!("<!-- PAGE IMAGES: {}", images.len());
    for (idx, mode) in images.iter().enumerate() {
        out.push_str(&format!(" | IMAGE {}: {}", idx + 1, mode.label()));
    }
    out.push_str(" -->");
    out
}

/// Up-front cost comparison between full-AI and hybrid processing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub per_page: f64,
    pub full_ai_cost: f64,
    pub hybrid_cost: f64,
    pub savings: f64,
    pub savings_percentage: f64,
}

impl CostEstimate {
    pub fn new(pricing: &TokenPricing, total_pages: usize, ai_pages: usize) -> Self {
        let per_page = pricing.cost(
            pricing.image_tokens_estimate,
            ESTIMATED_OUTPUT_TOKENS_PER_PAGE,
        );
        let full_ai_cost = per_page * total_pages as f64;
        let hybrid_cost = per_page * ai_pages as f64;
        let savings = full_ai_cost - hybrid_cost;
        let savings_percentage = if full_ai_cost > 0.0 {
            savings / full_ai_cost * 100.0
        } else {
            0.0
        };
        Self {
            per_page,
            full_ai_cost,
            hybrid_cost,
            savings,
            savings_percentage,
        }
    }
}

/// Classification of a whole document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationSummary {
    pub page_count: usize,
    /// Index `i` holds page `i + 1`.
    pub classes: Vec<PageClass>,
    /// Index `i` holds the image descriptor of page `i + 1`.
    pub image_descriptors: Vec<String>,
    pub estimate: CostEstimate,
    pricing: TokenPricing,
}

impl ClassificationSummary {
    pub fn from_inspections(inspections: &[PageInspection], pricing: TokenPricing) -> Self {
        let classes: Vec<PageClass> = inspections.iter().map(classify_page).collect();
        let image_descriptors = inspections
            .iter()
            .map(|i| image_descriptor(&i.images))
            .collect();
        Self::assemble(classes, image_descriptors, pricing)
    }

    fn assemble(classes: Vec<PageClass>, image_descriptors: Vec<String>, pricing: TokenPricing) -> Self {
        let ai_pages = classes.iter().filter(|c| **c == PageClass::Form).count();
        let estimate = CostEstimate::new(&pricing, classes.len(), ai_pages);
        Self {
            page_count: classes.len(),
            classes,
            image_descriptors,
            estimate,
            pricing,
        }
    }

    /// Class of a 1-indexed page.
    pub fn class_of(&self, page: usize) -> Option<PageClass> {
        page.checked_sub(1).and_then(|i| self.classes.get(i)).copied()
    }

    pub fn image_descriptor_of(&self, page: usize) -> String {
        page.checked_sub(1)
            .and_then(|i| self.image_descriptors.get(i))
            .cloned()
            .unwrap_or_else(|| image_descriptor(&[]))
    }

    fn pages_of(&self, class: PageClass) -> Vec<usize> {
        self.classes
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == class)
            .map(|(i, _)| i + 1)
            .collect()
    }

    pub fn text_pages(&self) -> Vec<usize> {
        self.pages_of(PageClass::Text)
    }

    pub fn form_pages(&self) -> Vec<usize> {
        self.pages_of(PageClass::Form)
    }

    pub fn empty_pages(&self) -> Vec<usize> {
        self.pages_of(PageClass::Empty)
    }

    /// A copy with every non-empty page routed to the model.
    pub fn forced_ai(&self) -> Self {
        let classes = self
            .classes
            .iter()
            .map(|c| match c {
                PageClass::Empty => PageClass::Empty,
                _ => PageClass::Form,
            })
            .collect();
        Self::assemble(classes, self.image_descriptors.clone(), self.pricing)
    }
}

/// Classifies one document, caching the result for its own lifetime.
pub struct PageClassifier {
    document: Arc<dyn DocumentSource>,
    pricing: TokenPricing,
    summary: OnceCell<ClassificationSummary>,
}

impl PageClassifier {
    pub fn new(document: Arc<dyn DocumentSource>, pricing: TokenPricing) -> Self {
        Self {
            document,
            pricing,
            summary: OnceCell::new(),
        }
    }

    /// Inspect and classify every page. The document is read only once.
    pub async fn classify(&self) -> Result<&ClassificationSummary, ExtractError> {
        self.summary
            .get_or_try_init(|| async {
                let document = Arc::clone(&self.document);
                let inspections = tokio::task::spawn_blocking(move || document.inspect_all())
                    .await
                    .map_err(|e| ExtractError::Internal(format!("Inspection task panicked: {e}")))??;

                for (idx, inspection) in inspections.iter().enumerate() {
                    debug!(
                        "Page {}: text={} widgets={} images={}",
                        idx + 1,
                        inspection.has_text,
                        inspection.widget_count,
                        inspection.images.len()
                    );
                }

                let summary = ClassificationSummary::from_inspections(&inspections, self.pricing);
                info!(
                    "Classified {} pages: {} text, {} form, {} empty (hybrid ${:.4} vs full AI ${:.4})",
                    summary.page_count,
                    summary.text_pages().len(),
                    summary.form_pages().len(),
                    summary.empty_pages().len(),
                    summary.estimate.hybrid_cost,
                    summary.estimate.full_ai_cost,
                );
                Ok::<_, ExtractError>(summary)
            })
            .await
    }
}
