//! The ingestion state machine.
//!
//! ```text
//! extracting ─► classifying ─► synthesizing ─► persisting ─► (uploading) ─► done
//!     │                             │
//!     └──────────► failed ◄─────────┘
//! ```
//!
//! Only extraction and synthesis can fail a run. Page errors are collected;
//! persistence and upload problems become warnings once a report exists.
//! [`PipelineOrchestrator::ingest`] never returns `Err`: every outcome is a
//! [`PipelineResult`].
//!
//! Every awaited stage runs under its own time budget from
//! [`IngestConfig`] and under the caller's [`CancellationToken`].

use crate::config::{IngestConfig, ProcessingOptions};
use crate::error::{IngestError, PageError};
use crate::persistence::{ReportRepository, SavedReport};
use crate::pipeline::classify::ClassifierChain;
use crate::pipeline::document::{extract, PageErrorLog, WalkOptions};
use crate::pipeline::input::{validate_upload, UploadedDocument};
use crate::pipeline::render::DocumentBackend;
use crate::pipeline::text::strip_page_markers;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::report::VeterinaryReport;
use crate::synthesis::ReportSynthesizer;
use crate::upload::{UploadCoordinator, UploadMetadata, UploadRequest, UploadedFile};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Extracting,
    Classifying,
    Synthesizing,
    Persisting,
    Uploading,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Extracting => "extracting",
            PipelineStage::Classifying => "classifying",
            PipelineStage::Synthesizing => "synthesizing",
            PipelineStage::Persisting => "persisting",
            PipelineStage::Uploading => "uploading",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unified outcome of one ingestion run.
///
/// `report` is set exactly when `success` is true; `error` exactly when it
/// is false.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<VeterinaryReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_file: Option<UploadedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stage the run failed in. `None` for validation failures, which
    /// happen before any stage runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<PipelineStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved: Option<SavedReport>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub page_errors: Vec<PageError>,
    pub duration_ms: u64,
}

impl PipelineResult {
    fn failure(
        error: &IngestError,
        failed_stage: Option<PipelineStage>,
        page_errors: Vec<PageError>,
        started: Instant,
    ) -> Self {
        Self {
            success: false,
            report: None,
            uploaded_file: None,
            error: Some(error.to_string()),
            failed_stage,
            saved: None,
            warnings: Vec::new(),
            page_errors,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Run `fut` under a time budget and a cancellation token.
async fn run_stage<T, F>(
    stage: PipelineStage,
    budget: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, IngestError>
where
    F: Future<Output = Result<T, IngestError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(IngestError::Cancelled { stage: stage.to_string() }),
        res = tokio::time::timeout(budget, fut) => match res {
            Ok(r) => r,
            Err(_) => Err(IngestError::StageTimeout {
                stage: stage.to_string(),
                secs: budget.as_secs(),
            }),
        },
    }
}

/// Wires the stages together. Collaborators are injected; only the
/// document backend is mandatory.
pub struct PipelineOrchestrator {
    config: IngestConfig,
    backend: Arc<dyn DocumentBackend>,
    chain: Arc<ClassifierChain>,
    synthesizer: Option<ReportSynthesizer>,
    repository: Option<ReportRepository>,
    uploader: Option<UploadCoordinator>,
    progress: ProgressCallback,
}

impl PipelineOrchestrator {
    pub fn new(config: IngestConfig, backend: Arc<dyn DocumentBackend>) -> Self {
        let chain = Arc::new(ClassifierChain::new(config.classifier.clone()));
        Self {
            config,
            backend,
            chain,
            synthesizer: None,
            repository: None,
            uploader: None,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_classifier_chain(mut self, chain: ClassifierChain) -> Self {
        self.chain = Arc::new(chain);
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: ReportSynthesizer) -> Self {
        self.synthesizer = Some(synthesizer);
        self
    }

    pub fn with_repository(mut self, repository: ReportRepository) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_uploader(mut self, uploader: UploadCoordinator) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn repository(&self) -> Option<&ReportRepository> {
        self.repository.as_ref()
    }

    fn fail(
        &self,
        err: IngestError,
        stage: Option<PipelineStage>,
        page_errors: Vec<PageError>,
        started: Instant,
    ) -> PipelineResult {
        match stage {
            Some(s) => error!("Ingestion failed while {}: {}", s, err),
            None => error!("Input rejected: {}", err),
        }
        self.progress.on_stage(PipelineStage::Failed);
        self.progress.on_finished(false);
        PipelineResult::failure(&err, stage, page_errors, started)
    }

    fn warn(&self, warnings: &mut Vec<String>, msg: String) {
        warn!("{}", msg);
        self.progress.on_warning(&msg);
        warnings.push(msg);
    }

    /// Ingest one uploaded document.
    pub async fn ingest(
        &self,
        doc: &UploadedDocument,
        options: &ProcessingOptions,
        cancel: &CancellationToken,
    ) -> PipelineResult {
        let started = Instant::now();
        info!("Ingesting '{}' ({} bytes)", doc.filename, doc.bytes.len());

        if let Err(e) = validate_upload(doc, &self.config) {
            return self.fail(e, None, Vec::new(), started);
        }

        // ── Extraction + classification ──────────────────────────────────
        self.progress.on_stage(PipelineStage::Extracting);
        let walk_cancel = cancel.child_token();
        let walk_errors = PageErrorLog::new();
        let walk = extract(
            Arc::clone(&self.backend),
            doc,
            Arc::clone(&self.chain),
            WalkOptions {
                render_scale: self.config.render_scale,
                extract_images: options.extract_images,
            },
            walk_cancel.clone(),
            Arc::clone(&self.progress),
            walk_errors.clone(),
        );
        let analysis = match run_stage(
            PipelineStage::Extracting,
            self.config.extraction_timeout(),
            cancel,
            walk,
        )
        .await
        {
            Ok(a) => a,
            Err(e) => {
                // Stops the blocking walk at its next page boundary.
                walk_cancel.cancel();
                let page_errors = walk_errors.take();
                return self.fail(e, Some(PipelineStage::Extracting), page_errors, started);
            }
        };
        info!(
            "Extracted {} page(s), {} clinical image(s), {} page error(s)",
            analysis.page_count,
            analysis.images.len(),
            analysis.page_errors.len()
        );
        let page_errors = analysis.page_errors;

        // ── Synthesis ────────────────────────────────────────────────────
        let mut report = if options.synthesize {
            self.progress.on_stage(PipelineStage::Synthesizing);
            let Some(synthesizer) = self.synthesizer.as_ref() else {
                let e = IngestError::ProviderNotConfigured {
                    provider: "none".into(),
                    hint: "No synthesis service was configured for this pipeline.".into(),
                };
                return self.fail(e, Some(PipelineStage::Synthesizing), page_errors, started);
            };
            let synth = synthesizer.synthesize(&doc.filename, &analysis.text, analysis.images);
            match run_stage(
                PipelineStage::Synthesizing,
                self.config.synthesis_timeout(),
                cancel,
                synth,
            )
            .await
            {
                Ok(r) => r,
                Err(e) => {
                    return self.fail(e, Some(PipelineStage::Synthesizing), page_errors, started)
                }
            }
        } else {
            info!("Synthesis skipped; building basic report");
            VeterinaryReport::basic(
                &doc.filename,
                strip_page_markers(&analysis.text),
                analysis.images,
            )
        };

        let mut warnings = Vec::new();
        if analysis.text_is_blank {
            self.warn(
                &mut warnings,
                format!("'{}' has no text layer; the report may be empty", doc.filename),
            );
        }

        // ── Persistence ──────────────────────────────────────────────────
        let mut saved = None;
        if options.persist {
            match self.repository.as_ref() {
                Some(repo) => {
                    self.progress.on_stage(PipelineStage::Persisting);
                    let save = async { repo.save_report(&report).await.map_err(IngestError::from) };
                    match run_stage(
                        PipelineStage::Persisting,
                        self.config.persistence_timeout(),
                        cancel,
                        save,
                    )
                    .await
                    {
                        Ok(s) => {
                            for w in &s.warnings {
                                self.progress.on_warning(w);
                            }
                            warnings.extend(s.warnings.iter().cloned());
                            if !s.created {
                                self.warn(
                                    &mut warnings,
                                    format!(
                                        "'{}' was already stored as report {}; existing row kept",
                                        doc.filename, s.report_id
                                    ),
                                );
                            }
                            report.id = s.report_id;
                            saved = Some(s);
                        }
                        Err(e) => self.warn(&mut warnings, format!("report not persisted: {e}")),
                    }
                }
                None => self.warn(
                    &mut warnings,
                    "persistence requested but no report store is configured".into(),
                ),
            }
        }

        // ── Upload ───────────────────────────────────────────────────────
        let mut uploaded_file = None;
        if options.upload_original {
            match self.uploader.as_ref() {
                Some(uploader) => {
                    self.progress.on_stage(PipelineStage::Uploading);
                    let request = UploadRequest {
                        filename: doc.filename.clone(),
                        mime_type: doc.mime_type.clone(),
                        bytes: doc.bytes.clone(),
                        metadata: UploadMetadata::from_report(&report),
                        created_at: report.created_at,
                    };
                    match uploader.upload(request, cancel).await {
                        Ok(file) => {
                            report.original_file = Some(file.clone());
                            if let (Some(repo), Some(s)) = (self.repository.as_ref(), saved.as_ref())
                            {
                                let link = async {
                                    repo.link_original(s.report_id, &file)
                                        .await
                                        .map_err(IngestError::from)
                                };
                                if let Err(e) = run_stage(
                                    PipelineStage::Persisting,
                                    self.config.persistence_timeout(),
                                    cancel,
                                    link,
                                )
                                .await
                                {
                                    self.warn(
                                        &mut warnings,
                                        format!("upload link not stored: {e}"),
                                    );
                                }
                            }
                            uploaded_file = Some(file);
                        }
                        Err(e) => self.warn(&mut warnings, format!("original not uploaded: {e}")),
                    }
                }
                None => self.warn(
                    &mut warnings,
                    "upload requested but no object store is configured".into(),
                ),
            }
        }

        self.progress.on_stage(PipelineStage::Done);
        self.progress.on_finished(true);
        info!(
            "Ingested '{}' as report {} in {:?}",
            doc.filename,
            report.id,
            started.elapsed()
        );

        PipelineResult {
            success: true,
            report: Some(report),
            uploaded_file,
            error: None,
            failed_stage: None,
            saved,
            warnings,
            page_errors,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}
