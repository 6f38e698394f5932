//! End-to-end pipeline tests over fake collaborators.
//!
//! The document backend, synthesis service and object store are in-process
//! fakes, so these tests need no pdfium library and no network. The one
//! pdfium-backed test at the bottom is opt-in:
//!
//! ```sh
//! PDFIUM_DYNAMIC_LIB_PATH=/opt/pdfium/lib VETINGEST_SAMPLE_PDF=./rx.pdf \
//!     cargo test --test pipeline -- pdfium
//! ```

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vetreport_ingest::pipeline::render::{
    DocumentBackend, DocumentLayout, DocumentVisitor, PageHandle, RasterizedPage,
};
use vetreport_ingest::report::{BASIC_CONFIDENCE, SYNTHESIS_CONFIDENCE};
use vetreport_ingest::upload::{ObjectStore, UploadRequest, UploadedFile};
use vetreport_ingest::{
    ImageCategory, IngestConfig, IngestError, IngestProgressCallback, MemoryStore, PageError,
    PdfiumBackend, PipelineOrchestrator, PipelineStage, ProcessingOptions, ReportRepository,
    ReportStore, ReportSynthesizer, StudyType, SynthesisService, UploadCoordinator, UploadError,
    UploadedDocument,
};

// ── Fake document backend ────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Raster {
    /// White page with black text lines.
    Text,
    /// High-contrast grayscale scan with block texture.
    Scan(u32, u32),
    /// Rasterisation fails.
    Broken,
}

#[derive(Clone)]
struct FakePageContent {
    text: &'static str,
    raster: Raster,
}

struct FakeBackend {
    pages: Vec<FakePageContent>,
    page_delay: Option<Duration>,
    walks: AtomicUsize,
}

impl FakeBackend {
    fn new(pages: Vec<FakePageContent>) -> Self {
        Self {
            pages,
            page_delay: None,
            walks: AtomicUsize::new(0),
        }
    }
}

struct FakePage {
    page_num: usize,
    content: FakePageContent,
}

fn block_tone(bx: u32, by: u32) -> u8 {
    let mut h = bx.wrapping_mul(0x9E37_79B1) ^ by.wrapping_mul(0x85EB_CA77);
    h ^= h >> 15;
    h = h.wrapping_mul(0x2C1B_3C6D);
    h ^= h >> 12;
    h = h.wrapping_mul(0x297A_2D39);
    h ^= h >> 15;
    ((h % 16) * 15) as u8
}

fn scan(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| {
        let l = block_tone(x / 8, y / 8);
        Rgba([l, l, l, 255])
    })
}

fn text_page() -> RgbaImage {
    let (width, height) = (1190, 1684);
    RgbaImage::from_fn(width, height, |x, y| {
        let ink = x >= 100 && x < width - 100 && (8..14).contains(&(y % 24)) && (x / 6) % 2 == 0;
        if ink {
            Rgba([0, 0, 0, 255])
        } else {
            Rgba([255, 255, 255, 255])
        }
    })
}

impl PageHandle for FakePage {
    fn page_num(&self) -> usize {
        self.page_num
    }

    fn text(&self) -> Result<String, PageError> {
        Ok(self.content.text.to_string())
    }

    fn rasterize(&self, _scale: f32) -> Result<RasterizedPage, PageError> {
        let image = match self.content.raster {
            Raster::Text => text_page(),
            Raster::Scan(w, h) => scan(w, h),
            Raster::Broken => {
                return Err(PageError::RenderFailed {
                    page: self.page_num,
                    detail: "bitmap allocation failed".into(),
                })
            }
        };
        Ok(RasterizedPage {
            page_num: self.page_num,
            image,
        })
    }
}

impl DocumentBackend for FakeBackend {
    fn walk(
        &self,
        _filename: &str,
        _bytes: &[u8],
        visitor: &mut dyn DocumentVisitor,
    ) -> Result<(), IngestError> {
        self.walks.fetch_add(1, Ordering::SeqCst);
        visitor.begin(&DocumentLayout {
            page_count: self.pages.len(),
            ..Default::default()
        });
        for (i, content) in self.pages.iter().enumerate() {
            if visitor.should_stop() {
                break;
            }
            if let Some(delay) = self.page_delay {
                std::thread::sleep(delay);
            }
            visitor.visit_page(&FakePage {
                page_num: i + 1,
                content: content.clone(),
            });
        }
        Ok(())
    }
}

/// Pages 1–2 text only, pages 3–4 1024×900 scans, pages 5–6 text only.
fn six_page_study() -> Vec<FakePageContent> {
    vec![
        FakePageContent {
            text: "Centro Veterinario Sur\nInforme radiológico",
            raster: Raster::Text,
        },
        FakePageContent {
            text: "Paciente: Luna  Especie: Canino\nTutor: Marta Ruiz",
            raster: Raster::Text,
        },
        FakePageContent {
            text: "",
            raster: Raster::Scan(1024, 900),
        },
        FakePageContent {
            text: "",
            raster: Raster::Scan(1024, 900),
        },
        FakePageContent {
            text: "Hallazgos: cardiomegalia leve",
            raster: Raster::Text,
        },
        FakePageContent {
            text: "Dra. Vega MP-1234",
            raster: Raster::Text,
        },
    ]
}

// ── Fake synthesis ───────────────────────────────────────────────────────

const LUNA_JSON: &str = r#"Here is the report:
```json
{
  "studyInfo": {"date": "12/03/2026", "studyType": "radiograph", "requestReason": "Tos"},
  "patient": {"name": "Luna", "species": "Canino", "breed": "Labrador", "age": "7", "sex": "female"},
  "guardian": {"name": "Marta Ruiz"},
  "veterinarians": [{"name": "Dra. Vega", "licenseNumber": "MP-1234", "clinic": "Centro Sur"}],
  "findings": {"summary": "", "items": ["Cardiomegalia leve"]},
  "conclusion": {"primaryDiagnoses": ["Cardiopatía"], "differentials": [], "additionalNotes": ""},
  "treatment": {"recommendations": ["Control en 30 días"]}
}
```"#;

enum Reply {
    Json(&'static str),
    Fail(&'static str),
    Hang,
}

struct FakeSynthesis {
    reply: Reply,
    calls: AtomicUsize,
}

impl FakeSynthesis {
    fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SynthesisService for FakeSynthesis {
    async fn complete(&self, _prompt: &str) -> Result<String, IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.reply {
            Reply::Json(s) => Ok(s.to_string()),
            Reply::Fail(detail) => Err(IngestError::SynthesisFailed {
                attempts: 3,
                detail: detail.into(),
            }),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("{}".into())
            }
        }
    }
}

// ── Fake object stores ───────────────────────────────────────────────────

struct RejectingStore;

#[async_trait]
impl ObjectStore for RejectingStore {
    async fn put(&self, _request: UploadRequest) -> Result<UploadedFile, UploadError> {
        Err(UploadError::Rejected {
            status: 403,
            detail: "insufficient permissions".into(),
        })
    }
}

#[derive(Default)]
struct RecordingStore {
    names: Mutex<Vec<String>>,
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn put(&self, request: UploadRequest) -> Result<UploadedFile, UploadError> {
        let name = request.remote_filename();
        self.names.lock().unwrap().push(name.clone());
        Ok(UploadedFile {
            id: "file-1".into(),
            url: "https://drive.google.com/file/d/file-1/view".into(),
            name,
            container_id: "folder-1".into(),
        })
    }
}

// ── Progress recorder ────────────────────────────────────────────────────

#[derive(Default)]
struct StageRecorder {
    stages: Mutex<Vec<PipelineStage>>,
    finished: Mutex<Option<bool>>,
}

impl IngestProgressCallback for StageRecorder {
    fn on_stage(&self, stage: PipelineStage) {
        self.stages.lock().unwrap().push(stage);
    }

    fn on_finished(&self, success: bool) {
        *self.finished.lock().unwrap() = Some(success);
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn pdf(filename: &str) -> UploadedDocument {
    UploadedDocument::new(filename, "application/pdf", b"%PDF-1.7\n%fake body".to_vec())
}

fn config() -> IngestConfig {
    IngestConfig::builder()
        .synthesis_timeout_secs(1)
        .build()
        .unwrap()
}

fn pipeline(
    backend: Arc<FakeBackend>,
    synthesis: Arc<FakeSynthesis>,
    store: Arc<MemoryStore>,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(config(), backend)
        .with_synthesizer(ReportSynthesizer::new(synthesis))
        .with_repository(ReportRepository::new(store, false))
}

// ── Scenario A ───────────────────────────────────────────────────────────

#[tokio::test]
async fn six_page_study_keeps_the_two_scans() {
    let store = Arc::new(MemoryStore::new());
    let synthesis = FakeSynthesis::new(Reply::Json(LUNA_JSON));
    let recorder = Arc::new(StageRecorder::default());
    let pipeline = pipeline(
        Arc::new(FakeBackend::new(six_page_study())),
        synthesis.clone(),
        store.clone(),
    )
    .with_progress(recorder.clone());

    let result = pipeline
        .ingest(&pdf("rx-luna.pdf"), &ProcessingOptions::default(), &CancellationToken::new())
        .await;

    assert!(result.success, "{:?}", result.error);
    assert!(result.error.is_none());
    let report = result.report.expect("report");
    assert_eq!(report.images.len(), 2);
    assert_eq!(
        report.images.iter().map(|i| i.source_page).collect::<Vec<_>>(),
        vec![3, 4]
    );
    assert!(report
        .images
        .iter()
        .all(|i| i.category == ImageCategory::Radiograph));
    assert!(report.images[0].raster_data.starts_with("data:image/png;base64,"));
    assert_eq!((report.images[0].width, report.images[0].height), (1024, 900));

    assert_eq!(report.extraction_confidence, SYNTHESIS_CONFIDENCE);
    assert_eq!(report.study_info.study_type, StudyType::Radiograph);
    assert_eq!(report.patient.name, "Luna");
    assert!(report.raw_extracted_text.contains("Paciente: Luna"));
    assert!(!report.raw_extracted_text.contains("--- PAGE"));
    assert_eq!(synthesis.calls.load(Ordering::SeqCst), 1);

    let saved = result.saved.expect("saved");
    assert!(saved.created);
    assert_eq!(saved.report_id, report.id);
    assert_eq!(store.report_count().await, 1);

    assert_eq!(
        *recorder.stages.lock().unwrap(),
        vec![
            PipelineStage::Extracting,
            PipelineStage::Classifying,
            PipelineStage::Synthesizing,
            PipelineStage::Persisting,
            PipelineStage::Done,
        ]
    );
    assert_eq!(*recorder.finished.lock().unwrap(), Some(true));
}

#[tokio::test]
async fn broken_page_is_reported_and_skipped() {
    let mut pages = six_page_study();
    pages[3].raster = Raster::Broken;
    let pipeline = pipeline(
        Arc::new(FakeBackend::new(pages)),
        FakeSynthesis::new(Reply::Json(LUNA_JSON)),
        Arc::new(MemoryStore::new()),
    );

    let result = pipeline
        .ingest(&pdf("rx.pdf"), &ProcessingOptions::default(), &CancellationToken::new())
        .await;

    assert!(result.success);
    assert_eq!(result.page_errors.len(), 1);
    assert_eq!(result.page_errors[0].page(), 4);
    assert_eq!(result.report.unwrap().images.len(), 1);
}

// ── Scenario B ───────────────────────────────────────────────────────────

#[tokio::test]
async fn synthesis_error_fails_without_persisting() {
    let store = Arc::new(MemoryStore::new());
    let recorder = Arc::new(StageRecorder::default());
    let pipeline = pipeline(
        Arc::new(FakeBackend::new(six_page_study())),
        FakeSynthesis::new(Reply::Fail("503 Service Unavailable")),
        store.clone(),
    )
    .with_progress(recorder.clone());

    let result = pipeline
        .ingest(&pdf("rx.pdf"), &ProcessingOptions::default(), &CancellationToken::new())
        .await;

    assert!(!result.success);
    assert!(result.report.is_none());
    let error = result.error.expect("error");
    assert!(!error.is_empty());
    assert!(error.contains("503"), "{error}");
    assert_eq!(result.failed_stage, Some(PipelineStage::Synthesizing));
    assert_eq!(store.report_count().await, 0);
    assert_eq!(store.patient_count().await, 0);
    assert_eq!(
        recorder.stages.lock().unwrap().last(),
        Some(&PipelineStage::Failed)
    );
    assert_eq!(*recorder.finished.lock().unwrap(), Some(false));
}

#[tokio::test]
async fn synthesis_timeout_fails_without_persisting() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(
        Arc::new(FakeBackend::new(six_page_study())),
        FakeSynthesis::new(Reply::Hang),
        store.clone(),
    );

    let result = pipeline
        .ingest(&pdf("rx.pdf"), &ProcessingOptions::default(), &CancellationToken::new())
        .await;

    assert!(!result.success);
    let error = result.error.expect("error");
    assert!(error.contains("timed out"), "{error}");
    assert_eq!(store.report_count().await, 0);
}

#[tokio::test]
async fn response_without_json_is_a_failure() {
    let pipeline = pipeline(
        Arc::new(FakeBackend::new(six_page_study())),
        FakeSynthesis::new(Reply::Json("Sorry, I cannot help with that document.")),
        Arc::new(MemoryStore::new()),
    );

    let result = pipeline
        .ingest(&pdf("rx.pdf"), &ProcessingOptions::default(), &CancellationToken::new())
        .await;

    assert!(!result.success);
    assert!(!result.error.unwrap_or_default().is_empty());
}

// ── Scenario C ───────────────────────────────────────────────────────────

#[tokio::test]
async fn upload_failure_keeps_the_report() {
    let pipeline = pipeline(
        Arc::new(FakeBackend::new(six_page_study())),
        FakeSynthesis::new(Reply::Json(LUNA_JSON)),
        Arc::new(MemoryStore::new()),
    )
    .with_uploader(UploadCoordinator::new(
        Arc::new(RejectingStore),
        Duration::from_secs(5),
    ));
    let options = ProcessingOptions {
        upload_original: true,
        ..Default::default()
    };

    let result = pipeline
        .ingest(&pdf("rx.pdf"), &options, &CancellationToken::new())
        .await;

    assert!(result.success);
    assert!(result.report.is_some());
    assert!(result.uploaded_file.is_none());
    assert!(result.error.is_none());
    assert!(result.warnings.iter().any(|w| w.contains("403")), "{:?}", result.warnings);
}

#[tokio::test]
async fn successful_upload_uses_report_metadata_in_the_name() {
    let objects = Arc::new(RecordingStore::default());
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(
        Arc::new(FakeBackend::new(six_page_study())),
        FakeSynthesis::new(Reply::Json(LUNA_JSON)),
        store.clone(),
    )
    .with_uploader(UploadCoordinator::new(objects.clone(), Duration::from_secs(5)));
    let options = ProcessingOptions {
        upload_original: true,
        ..Default::default()
    };

    let result = pipeline
        .ingest(&pdf("rx-luna.pdf"), &options, &CancellationToken::new())
        .await;

    let file = result.uploaded_file.expect("uploaded file");
    assert_eq!(file.name, "2026-03-12_Luna_radiograph_rx-luna.pdf");
    assert_eq!(file.container_id, "folder-1");
    assert_eq!(objects.names.lock().unwrap().len(), 1);
    assert!(
        !result.warnings.iter().any(|w| w.contains("upload link")),
        "{:?}",
        result.warnings
    );

    let report = result.report.unwrap();
    assert_eq!(report.original_file.as_ref(), Some(&file));
    let stored = store.get_report(report.id).await.unwrap().unwrap();
    assert_eq!(stored.report.original_file, Some(file));
    assert_eq!(stored.report.patient.name, "Luna");
}

// ── Basic mode, dedupe, validation, cancellation ─────────────────────────

#[tokio::test]
async fn basic_mode_skips_synthesis() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = PipelineOrchestrator::new(
        config(),
        Arc::new(FakeBackend::new(six_page_study())),
    )
    .with_repository(ReportRepository::new(store.clone(), false));
    let options = ProcessingOptions {
        synthesize: false,
        ..Default::default()
    };

    let result = pipeline
        .ingest(&pdf("eco-rex.pdf"), &options, &CancellationToken::new())
        .await;

    assert!(result.success, "{:?}", result.error);
    let report = result.report.unwrap();
    assert_eq!(report.extraction_confidence, BASIC_CONFIDENCE);
    assert_eq!(report.study_info.study_type, StudyType::Other);
    assert_eq!(report.images.len(), 2);
    assert!(report.raw_extracted_text.contains("cardiomegalia"));
    assert_eq!(store.report_count().await, 1);
}

#[tokio::test]
async fn resubmitting_a_document_returns_the_stored_report() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(
        Arc::new(FakeBackend::new(six_page_study())),
        FakeSynthesis::new(Reply::Json(LUNA_JSON)),
        store.clone(),
    );
    let cancel = CancellationToken::new();
    let options = ProcessingOptions::default();

    let first = pipeline.ingest(&pdf("rx-luna.pdf"), &options, &cancel).await;
    let second = pipeline.ingest(&pdf("rx-luna.pdf"), &options, &cancel).await;

    let first_id = first.report.unwrap().id;
    let second_id = second.report.unwrap().id;
    assert_eq!(first_id, second_id);
    assert!(!second.saved.unwrap().created);
    assert!(second.warnings.iter().any(|w| w.contains("already stored")));
    assert_eq!(store.report_count().await, 1);
    assert_eq!(store.patient_count().await, 1);
    assert_eq!(store.veterinarian_count().await, 1);

    let hits = store.search_reports("luna", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, first_id);
}

#[tokio::test]
async fn non_pdf_upload_is_rejected_before_any_stage() {
    let backend = Arc::new(FakeBackend::new(six_page_study()));
    let recorder = Arc::new(StageRecorder::default());
    let pipeline = pipeline(
        backend.clone(),
        FakeSynthesis::new(Reply::Json(LUNA_JSON)),
        Arc::new(MemoryStore::new()),
    )
    .with_progress(recorder.clone());
    let doc = UploadedDocument::new("photo.png", "image/png", vec![0x89, b'P', b'N', b'G']);

    let result = pipeline
        .ingest(&doc, &ProcessingOptions::default(), &CancellationToken::new())
        .await;

    assert!(!result.success);
    assert_eq!(result.failed_stage, None);
    assert!(result.error.unwrap().contains("image/png"));
    assert_eq!(backend.walks.load(Ordering::SeqCst), 0);
    assert_eq!(*recorder.stages.lock().unwrap(), vec![PipelineStage::Failed]);
}

#[tokio::test]
async fn cancellation_stops_the_walk() {
    let mut pages: Vec<_> = (0..40)
        .map(|_| FakePageContent {
            text: "page",
            raster: Raster::Text,
        })
        .collect();
    pages[0].raster = Raster::Broken;
    let backend = Arc::new(FakeBackend {
        pages,
        page_delay: Some(Duration::from_millis(25)),
        walks: AtomicUsize::new(0),
    });
    let synthesis = FakeSynthesis::new(Reply::Json(LUNA_JSON));
    let pipeline = pipeline(backend, synthesis.clone(), Arc::new(MemoryStore::new()));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
    }

    let result = pipeline
        .ingest(&pdf("long.pdf"), &ProcessingOptions::default(), &cancel)
        .await;

    assert!(!result.success);
    assert_eq!(result.failed_stage, Some(PipelineStage::Extracting));
    assert!(result.error.unwrap().contains("cancelled"));
    assert_eq!(synthesis.calls.load(Ordering::SeqCst), 0);
    // Pages read before the cancellation still report their errors.
    assert_eq!(result.page_errors.len(), 1);
    assert_eq!(result.page_errors[0].page(), 1);
}

// ── Real pdfium (opt-in) ─────────────────────────────────────────────────

#[tokio::test]
async fn pdfium_sample_document_extracts() {
    let (Ok(_lib), Ok(sample)) = (
        std::env::var("PDFIUM_DYNAMIC_LIB_PATH"),
        std::env::var("VETINGEST_SAMPLE_PDF"),
    ) else {
        eprintln!("skipping: set PDFIUM_DYNAMIC_LIB_PATH and VETINGEST_SAMPLE_PDF");
        return;
    };

    let doc = UploadedDocument::from_path(PathBuf::from(sample))
        .await
        .expect("sample pdf");
    let pipeline = PipelineOrchestrator::new(IngestConfig::default(), Arc::new(PdfiumBackend::new()));
    let options = ProcessingOptions {
        synthesize: false,
        persist: false,
        ..Default::default()
    };

    let result = pipeline
        .ingest(&doc, &options, &CancellationToken::new())
        .await;

    assert!(result.success, "{:?}", result.error);
    let report = result.report.unwrap();
    for image in &report.images {
        assert!(image.raster_data.starts_with("data:image/png;base64,"));
        assert!(image.width > 0 && image.height > 0);
    }
}
