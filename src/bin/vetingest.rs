//! CLI binary for vetreport-ingest.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `IngestConfig`, wires the storage and upload adapters, and prints one
//! `PipelineResult` JSON document per input.

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use vetreport_ingest::{
    DriveObjectStore, IngestConfig, IngestProgressCallback, LlmSynthesisService, MemoryStore,
    PdfiumBackend, PipelineOrchestrator, PipelineResult, PipelineStage, PostgrestStore,
    ProcessingOptions, ProgressCallback, ReportRepository, ReportStore, ReportSynthesizer,
    UploadCoordinator, UploadedDocument,
};

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner while the document opens, then a page bar during the walk, then
/// a spinner again for the network stages.
struct CliProgressCallback {
    bar: ProgressBar,
    filename: String,
    accepted: AtomicUsize,
}

impl CliProgressCallback {
    fn new(filename: &str) -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(Self::spinner_style());
        bar.set_prefix(filename.to_string());
        bar.set_message("opening…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            filename: filename.to_string(),
            accepted: AtomicUsize::new(0),
        })
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS)
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} pages  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS)
    }
}

impl IngestProgressCallback for CliProgressCallback {
    fn on_stage(&self, stage: PipelineStage) {
        match stage {
            PipelineStage::Synthesizing | PipelineStage::Persisting | PipelineStage::Uploading => {
                self.bar.set_style(Self::spinner_style());
                self.bar.set_message(format!("{stage}…"));
            }
            _ => self.bar.set_message(stage.to_string()),
        }
    }

    fn on_document_opened(&self, total_pages: usize) {
        self.bar.set_length(total_pages as u64);
        self.bar.set_style(Self::bar_style());
    }

    fn on_page_classified(&self, page_num: usize, total_pages: usize, relevant: bool) {
        if relevant {
            self.accepted.fetch_add(1, Ordering::SeqCst);
            self.bar.println(format!(
                "  {} Page {:>3}/{:<3}  {}",
                green("✓"),
                page_num,
                total_pages,
                dim("clinical image")
            ));
        }
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, error: &str) {
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} Page {:>3}  {}", red("✗"), page_num, red(&msg)));
    }

    fn on_warning(&self, message: &str) {
        self.bar.println(format!("  {} {}", cyan("⚠"), message));
    }

    fn on_finished(&self, success: bool) {
        self.bar.finish_and_clear();
        let images = self.accepted.load(Ordering::SeqCst);
        if success {
            eprintln!(
                "{} {}  {} clinical image(s)",
                green("✔"),
                bold(&self.filename),
                images
            );
        } else {
            eprintln!("{} {}", red("✘"), bold(&self.filename));
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Ingest one report, keep results in memory, print JSON
  vetingest rx-luna.pdf

  # Several reports, persisted to Supabase
  vetingest --supabase-url https://xyz.supabase.co --supabase-key ... *.pdf

  # No synthesis service: basic report from text and images only
  vetingest --no-synthesis eco-rex.pdf

  # Also copy the original into a Drive folder
  vetingest --upload --drive-folder 1AbC... rx-luna.pdf

  # Drop base64 image payloads from the printed JSON
  vetingest --strip-images rx-luna.pdf > luna.json

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY               OpenAI API key
  ANTHROPIC_API_KEY            Anthropic API key
  EDGEQUAKE_LLM_PROVIDER       Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL              Override model ID
  SUPABASE_URL                 PostgREST base URL (enables persistent storage)
  SUPABASE_SERVICE_ROLE_KEY    PostgREST service key
  GOOGLE_DRIVE_ACCESS_TOKEN    OAuth access token for Drive uploads
  GOOGLE_DRIVE_FOLDER_ID       Target Drive folder
  PDFIUM_DYNAMIC_LIB_PATH      Directory or file holding libpdfium

STORAGE SCHEMA:
  sql/schema.sql creates the patients, veterinarians and reports tables with
  the unique dedupe_key indexes the PostgREST store relies on.
"#;

/// Ingest veterinary PDF reports into structured JSON.
#[derive(Parser, Debug)]
#[command(
    name = "vetingest",
    version,
    about = "Ingest veterinary PDF reports into structured JSON",
    long_about = "Extract the text layer and clinical images from veterinary PDF reports, \
synthesize a structured report with an LLM, and store patients, veterinarians and reports \
without duplicates.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// One or more PDF files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Write the JSON results here instead of stdout.
    #[arg(short, long, env = "VETINGEST_OUTPUT")]
    output: Option<PathBuf>,

    /// LLM model ID (e.g. gpt-4.1-mini).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Page render scale relative to 72 DPI (0.5–4.0).
    #[arg(long, env = "VETINGEST_RENDER_SCALE", default_value_t = 2.0)]
    render_scale: f32,

    /// Upload size cap in MiB.
    #[arg(long, env = "VETINGEST_MAX_UPLOAD_MB", default_value_t = 10)]
    max_upload_mb: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "VETINGEST_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries on a failed synthesis call.
    #[arg(long, env = "VETINGEST_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Synthesis stage budget in seconds.
    #[arg(long, env = "VETINGEST_SYNTHESIS_TIMEOUT", default_value_t = 90)]
    synthesis_timeout: u64,

    /// Build a basic report without calling the synthesis service.
    #[arg(long)]
    no_synthesis: bool,

    /// Skip page rasterisation and image classification.
    #[arg(long)]
    no_images: bool,

    /// Do not write patients, veterinarians or reports.
    #[arg(long)]
    no_persist: bool,

    /// Link reports to placeholder entities when an entity upsert fails.
    #[arg(long, env = "VETINGEST_PLACEHOLDERS")]
    placeholders: bool,

    /// Upload the original PDF to Google Drive.
    #[arg(long)]
    upload: bool,

    #[arg(long, env = "SUPABASE_URL")]
    supabase_url: Option<String>,

    #[arg(long, env = "SUPABASE_SERVICE_ROLE_KEY", hide_env_values = true)]
    supabase_key: Option<String>,

    #[arg(long, env = "GOOGLE_DRIVE_ACCESS_TOKEN", hide_env_values = true)]
    drive_token: Option<String>,

    #[arg(long, env = "GOOGLE_DRIVE_FOLDER_ID")]
    drive_folder: Option<String>,

    /// Directory or file holding libpdfium.
    #[arg(long, env = "PDFIUM_DYNAMIC_LIB_PATH")]
    pdfium_path: Option<PathBuf>,

    /// Replace image `rasterData` payloads with an empty string in the output.
    #[arg(long)]
    strip_images: bool,

    /// Disable the progress display.
    #[arg(long, env = "VETINGEST_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "VETINGEST_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "VETINGEST_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;

    // ── Collaborators ────────────────────────────────────────────────────
    let backend = Arc::new(match cli.pdfium_path {
        Some(ref path) => PdfiumBackend::with_library_path(path),
        None => PdfiumBackend::new(),
    });

    let synthesizer = if cli.no_synthesis {
        None
    } else {
        let service = LlmSynthesisService::from_config(&config)
            .context("No synthesis provider available (use --no-synthesis to skip)")?;
        Some(ReportSynthesizer::new(Arc::new(service)))
    };

    let store: Arc<dyn ReportStore> = match (&cli.supabase_url, &cli.supabase_key) {
        (Some(url), Some(key)) => Arc::new(PostgrestStore::new(url.as_str(), key.as_str())),
        (Some(_), None) => bail!("--supabase-url requires --supabase-key"),
        _ => Arc::new(MemoryStore::new()),
    };
    let repository = ReportRepository::new(store, config.create_placeholder_on_failure);

    let uploader = UploadCoordinator::new(
        Arc::new(DriveObjectStore::new(
            cli.drive_token.clone(),
            cli.drive_folder.clone(),
        )),
        config.upload_timeout(),
    );

    let options = ProcessingOptions {
        extract_images: !cli.no_images,
        synthesize: !cli.no_synthesis,
        persist: !cli.no_persist,
        upload_original: cli.upload,
    };

    // ── Ctrl-C cancels the current document ─────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{}", cyan("Cancelling…"));
                cancel.cancel();
            }
        });
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let mut results: Vec<PipelineResult> = Vec::with_capacity(cli.inputs.len());
    for path in &cli.inputs {
        let doc = UploadedDocument::from_path(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let mut pipeline = PipelineOrchestrator::new(config.clone(), backend.clone())
            .with_repository(repository.clone())
            .with_uploader(uploader.clone());
        if let Some(ref s) = synthesizer {
            pipeline = pipeline.with_synthesizer(s.clone());
        }
        if show_progress {
            let cb: ProgressCallback = CliProgressCallback::new(&doc.filename);
            pipeline = pipeline.with_progress(cb);
        }

        let mut result = pipeline.ingest(&doc, &options, &cancel).await;
        if cli.strip_images {
            if let Some(ref mut report) = result.report {
                for image in &mut report.images {
                    image.raster_data.clear();
                }
            }
        }
        if !cli.quiet && !result.success {
            eprintln!(
                "  {} {}",
                red("error:"),
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
        results.push(result);

        if cancel.is_cancelled() {
            break;
        }
    }

    // ── Output ───────────────────────────────────────────────────────────
    let json = if results.len() == 1 {
        serde_json::to_string_pretty(&results[0])
    } else {
        serde_json::to_string_pretty(&results)
    }
    .context("Failed to serialise results")?;

    match cli.output {
        Some(ref path) => {
            tokio::fs::write(path, json.as_bytes())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            if !cli.quiet {
                eprintln!("{} {}", dim("results written to"), bold(&path.display().to_string()));
            }
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(json.as_bytes())
                .context("Failed to write to stdout")?;
            handle.write_all(b"\n").ok();
        }
    }

    let failed = results.iter().filter(|r| !r.success).count();
    if failed > 0 {
        bail!("{failed} of {} document(s) failed", results.len());
    }
    Ok(())
}

/// Map CLI args to `IngestConfig`.
fn build_config(cli: &Cli) -> Result<IngestConfig> {
    let mut builder = IngestConfig::builder()
        .render_scale(cli.render_scale)
        .max_upload_bytes(cli.max_upload_mb * 1024 * 1024)
        .temperature(cli.temperature)
        .max_retries(cli.max_retries)
        .synthesis_timeout_secs(cli.synthesis_timeout)
        .create_placeholder_on_failure(cli.placeholders);

    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }

    builder.build().context("Invalid configuration")
}
