//! PDF rasterisation: the document backend seam and its pdfium implementation.
//!
//! ## Why a visitor instead of returning pages?
//!
//! A `PdfPage` borrows its `PdfDocument`, which borrows the `Pdfium`
//! bindings, and none of it may cross an `.await`. Instead of fighting those
//! lifetimes, [`DocumentBackend::walk`] owns the whole document for the
//! duration of one call and hands each page to a [`DocumentVisitor`] by
//! reference. The visitor rasterises on demand, keeps what it needs, and
//! drops the pixel buffer before the next page is touched. Peak memory is
//! one page, not one document.
//!
//! ## Why report layout up front?
//!
//! Whether a document carries embedded image objects decides which
//! classifier in the chain gets to speak. [`DocumentLayout`] is collected in
//! a cheap object-only pre-pass so the decision is known before the first
//! page is rendered.

use crate::error::{IngestError, PageError};
use image::RgbaImage;
use pdfium_render::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One rendered page.
pub struct RasterizedPage {
    /// 1-based.
    pub page_num: usize,
    pub image: RgbaImage,
}

impl RasterizedPage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Pixel dimensions of an image object embedded in a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedImage {
    pub width: u32,
    pub height: u32,
}

/// Structural facts about a document, known before any page is rendered.
#[derive(Debug, Clone, Default)]
pub struct DocumentLayout {
    pub page_count: usize,
    /// Embedded image objects keyed by 1-based page number. Pages without
    /// image objects are absent.
    pub embedded_images: BTreeMap<usize, Vec<EmbeddedImage>>,
}

impl DocumentLayout {
    /// True when at least one page carries an embedded image object.
    pub fn has_structural_markers(&self) -> bool {
        !self.embedded_images.is_empty()
    }

    pub fn embedded_on(&self, page_num: usize) -> &[EmbeddedImage] {
        self.embedded_images
            .get(&page_num)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// A page lent to a [`DocumentVisitor`] for the duration of one call.
pub trait PageHandle {
    /// 1-based page number.
    fn page_num(&self) -> usize;

    /// Literal text runs of the page, in content-stream order.
    fn text(&self) -> Result<String, PageError>;

    /// Render the page at `scale` × 72 DPI into an RGBA buffer.
    fn rasterize(&self, scale: f32) -> Result<RasterizedPage, PageError>;
}

/// Receives a document's layout and then each of its pages, in order.
pub trait DocumentVisitor {
    fn begin(&mut self, layout: &DocumentLayout);

    fn visit_page(&mut self, page: &dyn PageHandle);

    /// Checked before each page; returning true ends the walk early.
    fn should_stop(&self) -> bool {
        false
    }
}

/// Something that can open a PDF and walk its pages.
///
/// Implementations are called from a blocking thread.
pub trait DocumentBackend: Send + Sync {
    fn walk(
        &self,
        filename: &str,
        bytes: &[u8],
        visitor: &mut dyn DocumentVisitor,
    ) -> Result<(), IngestError>;
}

// ── pdfium ───────────────────────────────────────────────────────────────

/// [`DocumentBackend`] over the pdfium library.
///
/// Bindings are created per walk; the library itself is loaded once by the
/// OS and shared.
#[derive(Debug, Clone, Default)]
pub struct PdfiumBackend {
    library_path: Option<PathBuf>,
}

impl PdfiumBackend {
    /// Bind via `PDFIUM_DYNAMIC_LIB_PATH`, falling back to the system library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to an explicit library file or a directory containing one.
    pub fn with_library_path(path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: Some(path.into()),
        }
    }
}

/// Load the pdfium dynamic library.
///
/// Discovery order:
/// 1. the explicit `path`, if given
/// 2. `PDFIUM_DYNAMIC_LIB_PATH`
/// 3. system library search paths
///
/// A directory is resolved to the platform library name inside it.
pub fn bind_pdfium(path: Option<&Path>) -> Result<Pdfium, IngestError> {
    let explicit = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("PDFIUM_DYNAMIC_LIB_PATH").map(PathBuf::from));

    let bindings = match explicit {
        Some(p) => {
            let lib = if p.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(p.to_string_lossy().as_ref())
            } else {
                p
            };
            debug!("Binding pdfium from {}", lib.display());
            Pdfium::bind_to_library(&lib).map_err(|e| {
                IngestError::PdfiumBindingFailed(format!("{}: {e:?}", lib.display()))
            })?
        }
        None => Pdfium::bind_to_system_library()
            .map_err(|e| IngestError::PdfiumBindingFailed(format!("{e:?}")))?,
    };
    Ok(Pdfium::new(bindings))
}

impl DocumentBackend for PdfiumBackend {
    fn walk(
        &self,
        filename: &str,
        bytes: &[u8],
        visitor: &mut dyn DocumentVisitor,
    ) -> Result<(), IngestError> {
        let pdfium = bind_pdfium(self.library_path.as_deref())?;

        let document = pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| IngestError::CorruptPdf {
                filename: filename.to_string(),
                detail: format!("{e:?}"),
            })?;

        let pages = document.pages();
        let page_count = pages.len() as usize;
        info!("PDF loaded: {} pages", page_count);

        let mut layout = DocumentLayout {
            page_count,
            embedded_images: BTreeMap::new(),
        };
        for (idx, page) in pages.iter().enumerate() {
            let images = embedded_images(&page);
            if !images.is_empty() {
                debug!("Page {}: {} embedded image object(s)", idx + 1, images.len());
                layout.embedded_images.insert(idx + 1, images);
            }
        }

        visitor.begin(&layout);

        for (idx, page) in pages.iter().enumerate() {
            if visitor.should_stop() {
                warn!("Page walk stopped before page {}", idx + 1);
                break;
            }
            let handle = PdfiumPage {
                page_num: idx + 1,
                page: &page,
            };
            visitor.visit_page(&handle);
        }

        Ok(())
    }
}

fn embedded_images(page: &PdfPage) -> Vec<EmbeddedImage> {
    page.objects()
        .iter()
        .filter_map(|object| {
            let image = object.as_image_object()?;
            let width = image.width().ok()?;
            let height = image.height().ok()?;
            (width > 0 && height > 0).then(|| EmbeddedImage {
                width: width as u32,
                height: height as u32,
            })
        })
        .collect()
}

struct PdfiumPage<'p, 'a> {
    page_num: usize,
    page: &'p PdfPage<'a>,
}

impl PageHandle for PdfiumPage<'_, '_> {
    fn page_num(&self) -> usize {
        self.page_num
    }

    fn text(&self) -> Result<String, PageError> {
        self.page
            .text()
            .map(|t| t.all())
            .map_err(|e| PageError::AnalysisFailed {
                page: self.page_num,
                detail: format!("{e:?}"),
            })
    }

    fn rasterize(&self, scale: f32) -> Result<RasterizedPage, PageError> {
        let render_config = PdfRenderConfig::new().scale_page_by_factor(scale);

        let bitmap = self
            .page
            .render_with_config(&render_config)
            .map_err(|e| PageError::RenderFailed {
                page: self.page_num,
                detail: format!("{e:?}"),
            })?;

        let image = bitmap.as_image().into_rgba8();
        debug!(
            "Rendered page {} → {}x{} px",
            self.page_num,
            image.width(),
            image.height()
        );

        Ok(RasterizedPage {
            page_num: self.page_num,
            image,
        })
    }
}
