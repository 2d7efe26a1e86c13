//! Document access: the boundary between the pipeline and pdfium.
//!
//! Everything the orchestrator needs from a PDF goes through the
//! [`DocumentSource`] trait: page count, per-page inspection (text presence,
//! interactive widgets, embedded images), local text and page rendering.
//! [`PdfiumDocument`] is the production implementation; tests substitute
//! in-memory fakes.
//!
//! ## Why load per call?
//!
//! pdfium keeps thread-local state and its document handles borrow the
//! library binding, so handles cannot be kept across `spawn_blocking` calls.
//! Each operation binds, loads, works and drops. Batch inspection loads the
//! document once for all pages.

use crate::error::ExtractError;
use image::{DynamicImage, GenericImageView};
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Stable identity of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentIdentity {
    /// File name (or caller-chosen label for in-memory documents).
    pub name: String,
    /// Hex SHA-256 of the document bytes.
    pub sha256: String,
}

impl DocumentIdentity {
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self {
            name: name.into(),
            sha256: digest.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }
}

/// Colour depth of an embedded image, as reported in page descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageColorMode {
    BlackWhite,
    Grayscale,
    Color,
    Unknown,
}

impl ImageColorMode {
    pub fn label(&self) -> &'static str {
        match self {
            ImageColorMode::BlackWhite => "BLACK_WHITE",
            ImageColorMode::Grayscale => "GRAYSCALE",
            ImageColorMode::Color => "COLOR",
            ImageColorMode::Unknown => "UNKNOWN",
        }
    }

    /// Classify a decoded image by its pixels.
    ///
    /// Large images are sampled on a grid rather than scanned fully.
    pub fn detect(img: &DynamicImage) -> Self {
        const MAX_SAMPLES: u64 = 4096;
        let (w, h) = img.dimensions();
        if w == 0 || h == 0 {
            return ImageColorMode::Unknown;
        }
        let step = (((w as u64 * h as u64) / MAX_SAMPLES) as f64).sqrt().max(1.0) as u32;

        let mut gray = true;
        let mut binary = true;
        for y in (0..h).step_by(step as usize) {
            for x in (0..w).step_by(step as usize) {
                let [r, g, b, _] = img.get_pixel(x, y).0;
                if r != g || g != b {
                    gray = false;
                }
                if !(r == 0 || r == 255) {
                    binary = false;
                }
            }
            if !gray {
                break;
            }
        }
        match (gray, binary) {
            (false, _) => ImageColorMode::Color,
            (true, true) => ImageColorMode::BlackWhite,
            (true, false) => ImageColorMode::Grayscale,
        }
    }
}

impl fmt::Display for ImageColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the classifier needs to know about one page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInspection {
    /// The page has non-whitespace selectable text.
    pub has_text: bool,
    /// Interactive form widgets on the page.
    pub widget_count: usize,
    /// Colour mode of each embedded image, in page order.
    pub images: Vec<ImageColorMode>,
}

/// Rasterisation parameters for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub dpi: u32,
    pub grayscale: bool,
    /// Cap on either edge, in pixels.
    pub max_pixels: u32,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            dpi: 150,
            grayscale: true,
            max_pixels: 4000,
        }
    }
}

/// Read access to a paginated document. Page numbers are 1-indexed.
///
/// Methods are blocking; callers run them inside `spawn_blocking`.
pub trait DocumentSource: Send + Sync {
    fn identity(&self) -> &DocumentIdentity;

    fn page_count(&self) -> usize;

    fn inspect_page(&self, page: usize) -> Result<PageInspection, ExtractError>;

    /// Inspect every page. Implementations may override this to share one
    /// document load across pages.
    fn inspect_all(&self) -> Result<Vec<PageInspection>, ExtractError> {
        (1..=self.page_count())
            .map(|page| self.inspect_page(page))
            .collect()
    }

    /// Selectable text of a page, in reading order as the backend reports it.
    fn page_text(&self, page: usize) -> Result<String, ExtractError>;

    fn render_page(&self, page: usize, options: &RenderOptions)
        -> Result<DynamicImage, ExtractError>;
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// A PDF on disk, read through pdfium.
pub struct PdfiumDocument {
    path: PathBuf,
    password: Option<String>,
    identity: DocumentIdentity,
    page_count: usize,
}

impl fmt::Debug for PdfiumDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdfiumDocument")
            .field("path", &self.path)
            .field("identity", &self.identity)
            .field("page_count", &self.page_count)
            .finish()
    }
}

impl PdfiumDocument {
    /// Validate, hash and open a PDF. Blocking.
    ///
    /// Every failure here is fatal for the run.
    pub fn open(path: impl AsRef<Path>, password: Option<&str>) -> Result<Self, ExtractError> {
        let path = path.as_ref().to_path_buf();
        let bytes = read_pdf_bytes(&path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let identity = DocumentIdentity::from_bytes(name, &bytes);

        let pdfium = bind_pdfium()?;
        let document = pdfium
            .load_pdf_from_byte_slice(&bytes, password)
            .map_err(|e| map_load_error(&path, password.is_some(), e))?;
        let page_count = document.pages().len() as usize;
        info!("PDF loaded: {} pages ({})", page_count, identity.name);

        Ok(Self {
            path,
            password: password.map(str::to_string),
            identity,
            page_count,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_page<T>(
        &self,
        page: usize,
        f: impl FnOnce(&PdfPage) -> Result<T, ExtractError>,
    ) -> Result<T, ExtractError> {
        if page == 0 || page > self.page_count {
            return Err(ExtractError::PageOutOfRange {
                page,
                total: self.page_count,
            });
        }
        let pdfium = bind_pdfium()?;
        let document = self.load(&pdfium)?;
        let pdf_page = document
            .pages()
            .get((page - 1) as u16)
            .map_err(|e| inspection_error(page, e))?;
        f(&pdf_page)
    }

    fn load<'a>(&'a self, pdfium: &'a Pdfium) -> Result<PdfDocument<'a>, ExtractError> {
        pdfium
            .load_pdf_from_file(&self.path, self.password.as_deref())
            .map_err(|e| map_load_error(&self.path, self.password.is_some(), e))
    }
}

impl DocumentSource for PdfiumDocument {
    fn identity(&self) -> &DocumentIdentity {
        &self.identity
    }

    fn page_count(&self) -> usize {
        self.page_count
    }

    fn inspect_page(&self, page: usize) -> Result<PageInspection, ExtractError> {
        self.with_page(page, |p| inspect(page, p))
    }

    fn inspect_all(&self) -> Result<Vec<PageInspection>, ExtractError> {
        let pdfium = bind_pdfium()?;
        let document = self.load(&pdfium)?;
        document
            .pages()
            .iter()
            .enumerate()
            .map(|(idx, p)| inspect(idx + 1, &p))
            .collect()
    }

    fn page_text(&self, page: usize) -> Result<String, ExtractError> {
        self.with_page(page, |p| {
            p.text()
                .map(|t| t.all())
                .map_err(|e| inspection_error(page, e))
        })
    }

    fn render_page(
        &self,
        page: usize,
        options: &RenderOptions,
    ) -> Result<DynamicImage, ExtractError> {
        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(options.dpi as f32 / 72.0)
            .set_maximum_width(options.max_pixels as i32)
            .set_maximum_height(options.max_pixels as i32)
            .use_grayscale_rendering(options.grayscale);

        self.with_page(page, |p| {
            let bitmap = p
                .render_with_config(&render_config)
                .map_err(|e| inspection_error(page, e))?;
            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                page,
                image.width(),
                image.height()
            );
            Ok(image)
        })
    }
}

fn inspect(page: usize, p: &PdfPage) -> Result<PageInspection, ExtractError> {
    let has_text = p
        .text()
        .map(|t| !t.all().trim().is_empty())
        .map_err(|e| inspection_error(page, e))?;

    let widget_count = p
        .annotations()
        .iter()
        .filter(|a| {
            matches!(
                a.annotation_type(),
                PdfPageAnnotationType::Widget | PdfPageAnnotationType::XfaWidget
            )
        })
        .count();

    let images = p
        .objects()
        .iter()
        .filter_map(|object| {
            object.as_image_object().map(|img| {
                img.get_raw_image()
                    .map(|raw| ImageColorMode::detect(&raw))
                    .unwrap_or(ImageColorMode::Unknown)
            })
        })
        .collect();

    Ok(PageInspection {
        has_text,
        widget_count,
        images,
    })
}

fn inspection_error(page: usize, e: PdfiumError) -> ExtractError {
    ExtractError::InspectionFailed {
        page,
        detail: format!("{e:?}"),
    }
}

/// Read the file, checking existence, permissions and the `%PDF` magic.
fn read_pdf_bytes(path: &Path) -> Result<Vec<u8>, ExtractError> {
    if !path.exists() {
        return Err(ExtractError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(ExtractError::PermissionDenied {
                path: path.to_path_buf(),
            })
        }
        Err(_) => {
            return Err(ExtractError::FileNotFound {
                path: path.to_path_buf(),
            })
        }
    };
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| ExtractError::CorruptPdf {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    check_magic(path, &bytes)?;
    Ok(bytes)
}

fn check_magic(path: &Path, bytes: &[u8]) -> Result<(), ExtractError> {
    let mut magic = [0u8; 4];
    let n = bytes.len().min(4);
    magic[..n].copy_from_slice(&bytes[..n]);
    if &magic != b"%PDF" {
        return Err(ExtractError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(())
}

fn map_load_error(path: &Path, had_password: bool, e: PdfiumError) -> ExtractError {
    let detail = format!("{e:?}");
    if detail.to_lowercase().contains("password") {
        if had_password {
            ExtractError::WrongPassword {
                path: path.to_path_buf(),
            }
        } else {
            ExtractError::PasswordRequired {
                path: path.to_path_buf(),
            }
        }
    } else {
        ExtractError::CorruptPdf {
            path: path.to_path_buf(),
            detail,
        }
    }
}

/// Bind the pdfium shared library.
///
/// Discovery order: `PDFIUM_LIB_PATH` (file or directory), the directory of
/// the running executable, then the system library search path.
pub fn bind_pdfium() -> Result<Pdfium, ExtractError> {
    if let Ok(configured) = std::env::var("PDFIUM_LIB_PATH") {
        let lib = if Path::new(&configured).is_dir() {
            Pdfium::pdfium_platform_library_name_at_path(configured.as_str())
                .to_string_lossy()
                .into_owned()
        } else {
            configured
        };
        debug!("Binding pdfium from {}", lib);
        let bindings = Pdfium::bind_to_library(&lib)
            .map_err(|e| ExtractError::PdfiumBindingFailed(format!("{lib}: {e:?}")))?;
        return Ok(Pdfium::new(bindings));
    }

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.to_string_lossy().into_owned()))
    {
        let lib = Pdfium::pdfium_platform_library_name_at_path(exe_dir.as_str());
        if let Ok(bindings) = Pdfium::bind_to_library(&lib) {
            debug!("Bound pdfium next to executable in {}", exe_dir);
            return Ok(Pdfium::new(bindings));
        }
    }

    let bindings = Pdfium::bind_to_system_library()
        .map_err(|e| ExtractError::PdfiumBindingFailed(format!("{e:?}")))?;
    Ok(Pdfium::new(bindings))
}
