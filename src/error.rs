//! Error types for the vetreport-ingest library.
//!
//! Four error types cover four distinct failure scopes:
//!
//! * [`IngestError`]: **fatal**. The document cannot become a report at all
//!   (rejected input, unreadable PDF, synthesis service down, malformed
//!   response). The orchestrator turns it into `success: false` on the
//!   pipeline result; the stage functions return it as `Err`.
//!
//! * [`PageError`]: **non-fatal**. One page failed to render or to be
//!   analysed. That page contributes zero images and the walk continues.
//!
//! * [`StoreError`]: returned by the persistence layer. Strict on the write
//!   path; the orchestrator downgrades it to a warning once a report exists.
//!
//! * [`UploadError`]: returned by an object store. The orchestrator logs it
//!   and records a warning; it never fails a run.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the ingestion pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Local input file was not found at the given path.
    #[error("Input file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// The upload declared a MIME type outside the accepted set.
    #[error("Unsupported MIME type '{mime}' for '{filename}' (expected application/pdf)")]
    UnsupportedMimeType { filename: String, mime: String },

    /// The upload exceeds the configured size cap.
    #[error("'{filename}' is {size} bytes, which exceeds the {limit}-byte upload limit")]
    FileTooLarge {
        filename: String,
        size: usize,
        limit: usize,
    },

    /// The upload carried no bytes.
    #[error("'{filename}' is empty")]
    EmptyInput { filename: String },

    /// The bytes do not start with the PDF magic header.
    #[error("'{filename}' is not a valid PDF\nFirst bytes: {magic:?}")]
    NotAPdf { filename: String, magic: Vec<u8> },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// pdfium could not parse the document.
    #[error("PDF '{filename}' is corrupt: {detail}")]
    CorruptPdf { filename: String, detail: String },

    /// The document has no pages, or no page yielded text or images.
    #[error("No text or pages could be read from '{filename}'")]
    NoExtractableContent { filename: String },

    // ── Synthesis errors ──────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("Synthesis provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The synthesis service returned an error after all retries.
    #[error("Synthesis failed after {attempts} attempt(s): {detail}")]
    SynthesisFailed { attempts: u32, detail: String },

    /// The synthesis service answered, but no JSON object could be parsed.
    #[error("Synthesis response is malformed: {detail}")]
    MalformedResponse { detail: String },

    // ── Execution control ─────────────────────────────────────────────────
    /// A stage exceeded its time budget.
    #[error("Stage '{stage}' timed out after {secs}s")]
    StageTimeout { stage: String, secs: u64 },

    /// The caller cancelled the run.
    #[error("Stage '{stage}' was cancelled")]
    Cancelled { stage: String },

    // ── Persistence ───────────────────────────────────────────────────────
    #[error("Persistence failed: {0}")]
    Persistence(#[from] StoreError),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_DYNAMIC_LIB_PATH to the directory (or file) holding libpdfium,\n\
or install pdfium system-wide.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Page rasterisation failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// Text or structure could not be read from the page.
    #[error("Page {page}: analysis failed: {detail}")]
    AnalysisFailed { page: usize, detail: String },

    /// An accepted page could not be encoded as PNG.
    #[error("Page {page}: image encoding failed: {detail}")]
    EncodeFailed { page: usize, detail: String },
}

impl PageError {
    /// 1-based page number the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::AnalysisFailed { page, .. }
            | PageError::EncodeFailed { page, .. } => *page,
        }
    }
}

/// Errors raised by a [`crate::persistence::ReportStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// A row with the same dedupe key already exists and could not be read back.
    #[error("Conflicting {entity} row for key '{key}'")]
    Conflict { entity: &'static str, key: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// The backend answered with a non-success status.
    #[error("Store backend returned {status}: {detail}")]
    Backend { status: u16, detail: String },

    #[error("Store transport error: {0}")]
    Transport(String),

    #[error("Could not decode store response: {0}")]
    Decode(String),
}

/// Errors raised by a [`crate::upload::ObjectStore`].
#[derive(Debug, Error)]
pub enum UploadError {
    /// Credentials or target container are missing.
    #[error("Object store is not configured: {0}")]
    NotConfigured(String),

    #[error("Object store rejected the upload with {status}: {detail}")]
    Rejected { status: u16, detail: String },

    #[error("Upload transport error: {0}")]
    Transport(String),

    #[error("Could not decode upload response: {0}")]
    Decode(String),

    #[error("Upload timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("Upload was cancelled")]
    Cancelled,
}
