//! # vetreport-ingest
//!
//! Turn clinical veterinary PDFs (radiograph, ultrasound and lab reports)
//! into a structured [`VeterinaryReport`] plus the diagnostic images it
//! embeds.
//!
//! ## Why this crate?
//!
//! Clinic reports arrive as PDFs that mix a cover page, a typed narrative
//! and one or more scanned images. A plain text dump loses the images and
//! the structure; OCR of the whole document is slow and noisy. Instead the
//! text layer is read literally, every page is rasterised and classified
//! so only genuine clinical images are kept, and a structured-synthesis
//! service maps the literal text onto a fixed report shape.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF upload
//!  │
//!  ├─ 1. Input      MIME gate, size cap, %PDF magic
//!  ├─ 2. Walk       per page: text layer + rasterise (pdfium, spawn_blocking)
//!  ├─ 3. Classify   structural classifier → pixel heuristics → position prior
//!  ├─ 4. Encode     accepted pages → PNG data URLs
//!  ├─ 5. Synthesize text → JSON report (edgequake-llm), lenient parse
//!  ├─ 6. Persist    find-or-create patient / veterinarians / report
//!  └─ 7. Upload     optional copy of the original to Google Drive
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use vetreport_ingest::{
//!     IngestConfig, LlmSynthesisService, MemoryStore, PdfiumBackend, PipelineOrchestrator,
//!     ProcessingOptions, ReportRepository, ReportSynthesizer, UploadedDocument,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = IngestConfig::default();
//!     let service = LlmSynthesisService::from_config(&config)?;
//!     let repository = ReportRepository::new(Arc::new(MemoryStore::new()), false);
//!
//!     let pipeline = PipelineOrchestrator::new(config, Arc::new(PdfiumBackend::new()))
//!         .with_synthesizer(ReportSynthesizer::new(Arc::new(service)))
//!         .with_repository(repository);
//!
//!     let doc = UploadedDocument::from_path("rx-luna.pdf").await?;
//!     let result = pipeline
//!         .ingest(&doc, &ProcessingOptions::default(), &CancellationToken::new())
//!         .await;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `vetingest` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! vetreport-ingest = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod persistence;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod report;
pub mod synthesis;
pub mod upload;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ClassifierThresholds, IngestConfig, IngestConfigBuilder, PageWindow, ProcessingOptions,
};
pub use error::{IngestError, PageError, StoreError, UploadError};
pub use orchestrator::{PipelineOrchestrator, PipelineResult, PipelineStage};
pub use persistence::{
    KeyedLocks, MemoryStore, PostgrestStore, ReportFilter, ReportRepository, ReportStore,
    SavedReport, StoredReport,
};
pub use pipeline::classify::{ClassifierChain, PageClassifier};
pub use pipeline::input::UploadedDocument;
pub use pipeline::render::{DocumentBackend, PdfiumBackend};
pub use progress::{IngestProgressCallback, NoopProgressCallback, ProgressCallback};
pub use report::{ImageCategory, MedicalImage, StudyType, VeterinaryReport};
pub use synthesis::{LlmSynthesisService, ReportSynthesizer, SynthesisService};
pub use upload::{DriveObjectStore, ObjectStore, UploadCoordinator, UploadedFile};
