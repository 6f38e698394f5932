//! One pass over a document: text, rasterisation, classification, encoding.
//!
//! ## Why one pass?
//!
//! Text extraction and image classification both need the open pdfium
//! document. Walking it once keeps a single blocking task per upload, and
//! rendering page-by-page means only the current page's pixel buffer is
//! alive at any moment. Accepted pages leave the walk as compact PNG data
//! URLs; rejected pages leave nothing.
//!
//! Page errors go to a shared [`PageErrorLog`] as they happen, so a walk
//! that fails, times out or is cancelled still reports the pages it could
//! not read.

use crate::error::{IngestError, PageError};
use crate::orchestrator::PipelineStage;
use crate::pipeline::classify::ClassifierChain;
use crate::pipeline::encode::encode_png_data_url;
use crate::pipeline::input::UploadedDocument;
use crate::pipeline::render::{DocumentBackend, DocumentLayout, DocumentVisitor, PageHandle};
use crate::pipeline::text::TextExtractor;
use crate::progress::{IngestProgressCallback, ProgressCallback};
use crate::report::MedicalImage;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Knobs for one walk.
#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    pub render_scale: f32,
    pub extract_images: bool,
}

/// Everything the walk produced.
#[derive(Debug, Default)]
pub struct DocumentAnalysis {
    pub page_count: usize,
    /// Page-marked document text.
    pub text: String,
    /// No page contributed any text (typical for scanned PDFs).
    pub text_is_blank: bool,
    /// Accepted clinical images, in page order.
    pub images: Vec<MedicalImage>,
    pub page_errors: Vec<PageError>,
}

/// Page errors recorded by a walk, readable after the walk is dropped.
#[derive(Debug, Clone, Default)]
pub struct PageErrorLog(Arc<Mutex<Vec<PageError>>>);

impl PageErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, error: PageError) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(error);
    }

    /// Drain everything recorded so far.
    pub fn take(&self) -> Vec<PageError> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct AnalysisVisitor<'a> {
    chain: &'a ClassifierChain,
    options: WalkOptions,
    cancel: &'a CancellationToken,
    progress: &'a dyn IngestProgressCallback,
    layout: DocumentLayout,
    text: TextExtractor,
    images: Vec<MedicalImage>,
    page_errors: &'a PageErrorLog,
    unreadable_pages: usize,
}

impl AnalysisVisitor<'_> {
    fn record(&mut self, error: PageError) {
        warn!("{}", error);
        self.progress.on_page_error(error.page(), &error.to_string());
        self.page_errors.push(error);
    }

    fn classify_page(&mut self, page: &dyn PageHandle) -> Result<(), PageError> {
        let page_num = page.page_num();
        let raster = page.rasterize(self.options.render_scale)?;
        let verdict = self
            .chain
            .classify_image(&raster.image, page_num, &self.layout);
        self.progress
            .on_page_classified(page_num, self.layout.page_count, verdict.relevant);

        if !verdict.relevant {
            debug!(
                "Page {}: not a clinical image ({} rejected by {})",
                page_num,
                verdict.decided_by,
                verdict
                    .rejected_by
                    .map(|g| g.to_string())
                    .unwrap_or_else(|| "no classifier".into())
            );
            return Ok(());
        }

        let raster_data =
            encode_png_data_url(&raster.image).map_err(|e| PageError::EncodeFailed {
                page: page_num,
                detail: e.to_string(),
            })?;
        info!(
            "Page {}: accepted as {} ({}x{} px, {})",
            page_num,
            verdict.category,
            raster.width(),
            raster.height(),
            verdict.decided_by
        );
        self.images.push(MedicalImage::new(
            page_num,
            verdict.category,
            raster.width(),
            raster.height(),
            raster_data,
        ));
        Ok(())
    }
}

impl DocumentVisitor for AnalysisVisitor<'_> {
    fn begin(&mut self, layout: &DocumentLayout) {
        self.layout = layout.clone();
        self.progress.on_document_opened(layout.page_count);
        if self.options.extract_images {
            self.progress.on_stage(PipelineStage::Classifying);
        }
    }

    fn visit_page(&mut self, page: &dyn PageHandle) {
        let page_num = page.page_num();
        match page.text() {
            Ok(text) => self.text.push_page(page_num, &text),
            Err(e) => {
                self.text.push_page(page_num, "");
                self.unreadable_pages += 1;
                self.record(e);
            }
        }

        if self.options.extract_images {
            if let Err(e) = self.classify_page(page) {
                self.record(e);
            }
        }
    }

    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Walk `bytes` on the current thread. Call from a blocking context.
///
/// On success the recorded page errors move into the returned analysis; on
/// failure they stay in `page_errors`.
#[allow(clippy::too_many_arguments)]
pub fn analyze_document(
    backend: &dyn DocumentBackend,
    filename: &str,
    bytes: &[u8],
    chain: &ClassifierChain,
    options: WalkOptions,
    cancel: &CancellationToken,
    progress: &dyn IngestProgressCallback,
    page_errors: &PageErrorLog,
) -> Result<DocumentAnalysis, IngestError> {
    let mut visitor = AnalysisVisitor {
        chain,
        options,
        cancel,
        progress,
        layout: DocumentLayout::default(),
        text: TextExtractor::new(),
        images: Vec::new(),
        page_errors,
        unreadable_pages: 0,
    };

    backend.walk(filename, bytes, &mut visitor)?;

    if cancel.is_cancelled() {
        return Err(IngestError::Cancelled {
            stage: "extracting".into(),
        });
    }

    let page_count = visitor.layout.page_count;
    let unreadable = page_count > 0
        && visitor.unreadable_pages == page_count
        && visitor.images.is_empty();
    if page_count == 0 || unreadable {
        return Err(IngestError::NoExtractableContent {
            filename: filename.to_string(),
        });
    }

    let text_is_blank = visitor.text.is_blank();
    if text_is_blank {
        warn!("'{}' has no text layer; synthesis will see empty pages", filename);
    }

    Ok(DocumentAnalysis {
        page_count,
        text: visitor.text.finish(),
        text_is_blank,
        images: visitor.images,
        page_errors: page_errors.take(),
    })
}

/// Run [`analyze_document`] on the blocking pool.
pub async fn extract(
    backend: Arc<dyn DocumentBackend>,
    doc: &UploadedDocument,
    chain: Arc<ClassifierChain>,
    options: WalkOptions,
    cancel: CancellationToken,
    progress: ProgressCallback,
    page_errors: PageErrorLog,
) -> Result<DocumentAnalysis, IngestError> {
    let filename = doc.filename.clone();
    let bytes = doc.bytes.clone();

    tokio::task::spawn_blocking(move || {
        analyze_document(
            backend.as_ref(),
            &filename,
            &bytes,
            &chain,
            options,
            &cancel,
            progress.as_ref(),
            &page_errors,
        )
    })
    .await
    .map_err(|e| IngestError::Internal(format!("Extraction task panicked: {}", e)))?
}
