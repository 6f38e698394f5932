//! Configuration types for document ingestion.
//!
//! All pipeline behaviour is controlled through [`IngestConfig`], built via
//! [`IngestConfigBuilder`]. Classifier thresholds live in their own
//! [`ClassifierThresholds`] struct so they can be tuned against real sample
//! documents without touching any other knob. Per-call switches (skip
//! synthesis, skip upload) are [`ProcessingOptions`].

use crate::error::IngestError;
use crate::report::ImageCategory;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default upload size cap: 10 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Configuration for the ingestion pipeline.
///
/// # Example
/// ```rust
/// use vetreport_ingest::IngestConfig;
///
/// let config = IngestConfig::builder()
///     .render_scale(2.5)
///     .model("gpt-4.1-mini")
///     .create_placeholder_on_failure(true)
///     .build()
///     .unwrap();
/// assert_eq!(config.render_scale, 2.5);
/// ```
#[derive(Clone)]
pub struct IngestConfig {
    /// Page render scale relative to 72 DPI. Range: 0.5–4.0. Default: 2.0.
    ///
    /// 2.0 renders an A4 page at roughly 1190 × 1684 px (about 144 DPI),
    /// which keeps an embedded scan well inside the classifier's size band.
    pub render_scale: f32,

    /// Maximum accepted upload size in bytes. Default: 10 MiB.
    pub max_upload_bytes: usize,

    /// MIME types accepted by the input gate. Default: `application/pdf`.
    pub accepted_mime_types: Vec<String>,

    /// LLM model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for synthesis. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the synthesis call may generate. Default: 4096.
    pub max_tokens: usize,

    /// Retry attempts on a failed synthesis call. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Budget for the blocking page walk (text + raster + classify). Default: 120.
    pub extraction_timeout_secs: u64,

    /// Budget for the whole synthesis stage, retries included. Default: 90.
    pub synthesis_timeout_secs: u64,

    /// Budget for the persistence stage. Default: 30.
    pub persistence_timeout_secs: u64,

    /// Budget for the upload side channel. Default: 60.
    pub upload_timeout_secs: u64,

    /// When a patient or veterinarian upsert fails, link the report to a
    /// shared placeholder entity instead of failing the write. Default: false.
    ///
    /// Every fallback is logged at `warn!` and surfaced as a pipeline warning.
    pub create_placeholder_on_failure: bool,

    /// Clinical image classifier thresholds.
    pub classifier: ClassifierThresholds,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            render_scale: 2.0,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            accepted_mime_types: vec!["application/pdf".to_string()],
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 4096,
            max_retries: 2,
            retry_backoff_ms: 500,
            extraction_timeout_secs: 120,
            synthesis_timeout_secs: 90,
            persistence_timeout_secs: 30,
            upload_timeout_secs: 60,
            create_placeholder_on_failure: false,
            classifier: ClassifierThresholds::default(),
        }
    }
}

impl fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestConfig")
            .field("render_scale", &self.render_scale)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("accepted_mime_types", &self.accepted_mime_types)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("extraction_timeout_secs", &self.extraction_timeout_secs)
            .field("synthesis_timeout_secs", &self.synthesis_timeout_secs)
            .field("persistence_timeout_secs", &self.persistence_timeout_secs)
            .field("upload_timeout_secs", &self.upload_timeout_secs)
            .field(
                "create_placeholder_on_failure",
                &self.create_placeholder_on_failure,
            )
            .field("classifier", &self.classifier)
            .finish()
    }
}

impl IngestConfig {
    /// Create a new builder for `IngestConfig`.
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }

    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_secs(self.persistence_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }
}

/// Builder for [`IngestConfig`].
#[derive(Debug)]
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl IngestConfigBuilder {
    pub fn render_scale(mut self, scale: f32) -> Self {
        self.config.render_scale = scale.clamp(0.5, 4.0);
        self
    }

    pub fn max_upload_bytes(mut self, bytes: usize) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    pub fn accept_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.config.accepted_mime_types.push(mime.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn extraction_timeout_secs(mut self, secs: u64) -> Self {
        self.config.extraction_timeout_secs = secs;
        self
    }

    pub fn synthesis_timeout_secs(mut self, secs: u64) -> Self {
        self.config.synthesis_timeout_secs = secs;
        self
    }

    pub fn persistence_timeout_secs(mut self, secs: u64) -> Self {
        self.config.persistence_timeout_secs = secs;
        self
    }

    pub fn upload_timeout_secs(mut self, secs: u64) -> Self {
        self.config.upload_timeout_secs = secs;
        self
    }

    pub fn create_placeholder_on_failure(mut self, v: bool) -> Self {
        self.config.create_placeholder_on_failure = v;
        self
    }

    pub fn classifier(mut self, thresholds: ClassifierThresholds) -> Self {
        self.config.classifier = thresholds;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<IngestConfig, IngestError> {
        let c = &self.config;
        if c.max_upload_bytes == 0 {
            return Err(IngestError::InvalidConfig(
                "max_upload_bytes must be > 0".into(),
            ));
        }
        if c.accepted_mime_types.is_empty() {
            return Err(IngestError::InvalidConfig(
                "at least one accepted MIME type is required".into(),
            ));
        }
        let stages = [
            ("extraction", c.extraction_timeout_secs),
            ("synthesis", c.synthesis_timeout_secs),
            ("persistence", c.persistence_timeout_secs),
            ("upload", c.upload_timeout_secs),
        ];
        if let Some((stage, _)) = stages.iter().find(|(_, secs)| *secs == 0) {
            return Err(IngestError::InvalidConfig(format!(
                "{stage} timeout must be ≥ 1s"
            )));
        }
        c.classifier.validate()?;
        Ok(self.config)
    }
}

// ── Classifier thresholds ────────────────────────────────────────────────

/// Every tunable number the clinical image classifier uses.
///
/// The defaults were tuned on a small set of radiology and ultrasound
/// reports; treat them as starting points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierThresholds {
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// width / height lower bound.
    pub min_aspect_ratio: f32,
    /// width / height upper bound.
    pub max_aspect_ratio: f32,
    /// Sample every Nth pixel along both axes.
    pub sample_stride: u32,
    /// Luminance strictly above this counts as near-white.
    pub white_luma: u8,
    pub max_white_fraction: f32,
    /// Luminance strictly below this counts as a mid or dark tone.
    pub tone_luma: u8,
    pub min_tone_fraction: f32,
    /// Shannon entropy of the 256-bin luminance histogram, in bits.
    pub min_entropy_bits: Option<f32>,
    /// Minimum luminance jump between neighbouring samples to count as an edge.
    pub edge_delta: u8,
    pub min_edge_transitions: Option<usize>,
    /// Edge transitions divided by sample count.
    pub min_edge_ratio: f32,
    /// Tonal profile read as a radiograph: mean luminance below this...
    pub radiograph_max_mean: f32,
    /// ...and luminance standard deviation below this.
    pub radiograph_max_std: f32,
    /// Tonal profile read as an ultrasound: mean luminance above this...
    pub ultrasound_min_mean: f32,
    /// ...and luminance standard deviation above this.
    pub ultrasound_min_std: f32,
    /// Jump between neighbouring row (or column) mean luminances that marks
    /// a line in the profile.
    pub profile_step_luma: u8,
    /// Row steps that read as stacked traces (echocardiogram).
    pub echo_min_row_steps: usize,
    /// Row steps a ruled lab table needs...
    pub lab_min_row_steps: usize,
    /// ...together with this many column steps.
    pub lab_min_column_steps: usize,
    /// Pages eligible under the position prior.
    pub admissible_pages: PageWindow,
    /// Position-to-category table used when nothing better is known.
    pub category_by_page: BTreeMap<usize, ImageCategory>,
    pub default_category: ImageCategory,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        let category_by_page = BTreeMap::from([
            (3, ImageCategory::Radiograph),
            (4, ImageCategory::Radiograph),
            (5, ImageCategory::Ultrasound),
            (6, ImageCategory::Radiograph),
        ]);
        Self {
            min_width: 512,
            min_height: 512,
            max_width: 2000,
            max_height: 2000,
            min_aspect_ratio: 0.5,
            max_aspect_ratio: 2.5,
            sample_stride: 4,
            white_luma: 240,
            max_white_fraction: 0.75,
            tone_luma: 200,
            min_tone_fraction: 0.05,
            min_entropy_bits: Some(3.5),
            edge_delta: 32,
            min_edge_transitions: Some(1500),
            min_edge_ratio: 0.01,
            radiograph_max_mean: 100.0,
            radiograph_max_std: 50.0,
            ultrasound_min_mean: 150.0,
            ultrasound_min_std: 80.0,
            profile_step_luma: 48,
            echo_min_row_steps: 12,
            lab_min_row_steps: 8,
            lab_min_column_steps: 8,
            admissible_pages: PageWindow::default(),
            category_by_page,
            default_category: ImageCategory::Radiograph,
        }
    }
}

impl ClassifierThresholds {
    fn validate(&self) -> Result<(), IngestError> {
        if self.min_width > self.max_width || self.min_height > self.max_height {
            return Err(IngestError::InvalidConfig(
                "classifier minimum size exceeds maximum size".into(),
            ));
        }
        if !(self.min_aspect_ratio > 0.0 && self.min_aspect_ratio <= self.max_aspect_ratio) {
            return Err(IngestError::InvalidConfig(format!(
                "aspect band {}–{} is empty",
                self.min_aspect_ratio, self.max_aspect_ratio
            )));
        }
        if self.sample_stride == 0 {
            return Err(IngestError::InvalidConfig(
                "sample_stride must be ≥ 1".into(),
            ));
        }
        for (name, v) in [
            ("max_white_fraction", self.max_white_fraction),
            ("min_tone_fraction", self.min_tone_fraction),
            ("min_edge_ratio", self.min_edge_ratio),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(IngestError::InvalidConfig(format!(
                    "{name} must be within 0–1, got {v}"
                )));
            }
        }
        Ok(())
    }

    /// Category for a page under the position prior.
    pub fn category_for_page(&self, page_num: usize) -> ImageCategory {
        self.category_by_page
            .get(&page_num)
            .copied()
            .unwrap_or(self.default_category)
    }
}

/// An inclusive, 1-based page window. `last: None` means open-ended;
/// `skip_trailing` additionally drops that many pages from the end of the
/// document, such as a closing signature page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageWindow {
    pub first: usize,
    pub last: Option<usize>,
    #[serde(default)]
    pub skip_trailing: usize,
}

impl Default for PageWindow {
    /// Skip the cover and history pages that open most clinical reports.
    fn default() -> Self {
        Self {
            first: 3,
            last: None,
            skip_trailing: 0,
        }
    }
}

impl PageWindow {
    pub fn all() -> Self {
        Self {
            first: 1,
            last: None,
            skip_trailing: 0,
        }
    }

    pub fn range(first: usize, last: usize) -> Self {
        Self {
            first,
            last: Some(last),
            skip_trailing: 0,
        }
    }

    pub fn skip_trailing(mut self, pages: usize) -> Self {
        self.skip_trailing = pages;
        self
    }

    /// Whether `page_num` of a `total_pages` document falls in the window.
    pub fn contains(&self, page_num: usize, total_pages: usize) -> bool {
        let within_tail = self.skip_trailing == 0 || page_num + self.skip_trailing <= total_pages;
        page_num >= self.first && self.last.map_or(true, |last| page_num <= last) && within_tail
    }
}

// ── Per-call options ─────────────────────────────────────────────────────

/// Switches for a single ingestion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    /// Rasterise and classify pages for clinical images. Default: true.
    pub extract_images: bool,
    /// Call the synthesis service. When false a basic report is built from
    /// the extracted text alone. Default: true.
    pub synthesize: bool,
    /// Write patient, veterinarian and report rows. Default: true.
    pub persist: bool,
    /// Upload the original file to the object store. Default: false.
    pub upload_original: bool,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            extract_images: true,
            synthesize: true,
            persist: true,
            upload_original: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps_render_scale() {
        let config = IngestConfig::builder().render_scale(9.0).build().unwrap();
        assert_eq!(config.render_scale, 4.0);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = IngestConfig::builder()
            .synthesis_timeout_secs(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("synthesis"), "got: {err}");
    }

    #[test]
    fn inverted_size_band_is_rejected() {
        let thresholds = ClassifierThresholds {
            min_width: 3000,
            ..Default::default()
        };
        assert!(IngestConfig::builder().classifier(thresholds).build().is_err());
    }

    #[test]
    fn page_window_bounds() {
        let w = PageWindow::default();
        assert!(!w.contains(2, 40));
        assert!(w.contains(3, 40));
        assert!(w.contains(40, 40));
        let r = PageWindow::range(3, 6);
        assert!(r.contains(6, 10));
        assert!(!r.contains(7, 10));
    }

    #[test]
    fn page_window_can_skip_trailing_pages() {
        let w = PageWindow::default().skip_trailing(1);
        assert!(w.contains(5, 6));
        assert!(!w.contains(6, 6));
        assert!(w.contains(6, 7));
        let all = PageWindow::all().skip_trailing(2);
        assert!(all.contains(1, 3));
        assert!(!all.contains(2, 3));
        assert!(!all.contains(1, 1));
    }

    #[test]
    fn category_for_unmapped_page_uses_default() {
        let t = ClassifierThresholds::default();
        assert_eq!(t.category_for_page(5), ImageCategory::Ultrasound);
        assert_eq!(t.category_for_page(11), ImageCategory::Radiograph);
    }

    #[test]
    fn debug_hides_provider() {
        let dbg = format!("{:?}", IngestConfig::default());
        assert!(dbg.contains("IngestConfig"));
        assert!(!dbg.contains("Arc"));
    }
}
