//! Progress-callback trait for stage and per-page ingestion events.
//!
//! Inject an [`Arc<dyn IngestProgressCallback>`] via
//! [`crate::orchestrator::PipelineOrchestrator::with_progress`] to receive
//! events as a document moves through the pipeline. Page events fire from
//! the blocking thread that walks the PDF, so implementations must be
//! `Send + Sync`.
//!
//! # Example
//!
//! ```rust
//! use vetreport_ingest::{IngestProgressCallback, PipelineStage};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct ImageCounter {
//!     accepted: AtomicUsize,
//! }
//!
//! impl IngestProgressCallback for ImageCounter {
//!     fn on_page_classified(&self, page_num: usize, total_pages: usize, relevant: bool) {
//!         if relevant {
//!             self.accepted.fetch_add(1, Ordering::SeqCst);
//!             eprintln!("page {page_num}/{total_pages} holds a clinical image");
//!         }
//!     }
//!
//!     fn on_stage(&self, stage: PipelineStage) {
//!         eprintln!("→ {stage}");
//!     }
//! }
//! ```

use crate::orchestrator::PipelineStage;
use std::sync::Arc;

/// Called by the pipeline as it processes one document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait IngestProgressCallback: Send + Sync {
    /// Called on every state-machine transition, including `Failed`.
    fn on_stage(&self, stage: PipelineStage) {
        let _ = stage;
    }

    /// Called once the PDF is open and its page count is known.
    fn on_document_opened(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called after the classifier has ruled on a page.
    fn on_page_classified(&self, page_num: usize, total_pages: usize, relevant: bool) {
        let _ = (page_num, total_pages, relevant);
    }

    /// Called when a page fails to render or be analysed.
    fn on_page_error(&self, page_num: usize, error: &str) {
        let _ = (page_num, error);
    }

    /// Called when an optional stage degrades (upload or persistence
    /// failure, placeholder fallback).
    fn on_warning(&self, message: &str) {
        let _ = message;
    }

    /// Called exactly once, after the pipeline result is assembled.
    fn on_finished(&self, success: bool) {
        let _ = success;
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl IngestProgressCallback for NoopProgressCallback {}

/// Convenience alias for the type held by the orchestrator.
pub type ProgressCallback = Arc<dyn IngestProgressCallback>;
