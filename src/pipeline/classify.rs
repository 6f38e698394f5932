//! Clinical image classification: decide whether a rendered page is a
//! diagnostic image (radiograph, ultrasound) or a text/cover page.
//!
//! ## Gates
//!
//! Each gate is an independent predicate over page geometry or
//! [`PixelStats`]:
//!
//! | Gate | Rejects |
//! |------|---------|
//! | [`passes_size_gate`] | thumbnails and logos below the minimum, full rendered text pages above the maximum |
//! | [`passes_aspect_gate`] | banners and narrow text columns |
//! | [`passes_whiteness_gate`] | pages dominated by white background |
//! | [`passes_tone_gate`] | pages without substantial gray/black content |
//! | [`passes_entropy_gate`] | flat fills and two-tone typography |
//! | [`passes_edge_gate`] | smooth gradients with no image structure |
//! | [`passes_position_gate`] | pages outside the admissible window |
//!
//! A page is accepted only if every gate its classifier applies passes.
//!
//! ## Category
//!
//! An accepted page is categorised from its pixels when they are decisive
//! ([`pixel_category`]): the tonal profile separates dark radiographs from
//! bright ultrasounds, full-width and full-height lines mark a ruled lab
//! table, and stacked full-width traces mark an echocardiogram. Otherwise
//! the position table in [`ClassifierThresholds`] decides.
//!
//! ## Chain
//!
//! [`ClassifierChain`] asks each [`PageClassifier`] in order and takes the
//! first verdict. The default chain puts [`StructuralClassifier`] first: when
//! the PDF carries embedded image objects, that structure decides and page
//! position is never consulted. Only when a document has no image objects at
//! all does [`PixelHeuristicClassifier`] speak, and it is the only
//! classifier that uses the position prior.

use crate::config::ClassifierThresholds;
use crate::pipeline::render::{DocumentLayout, EmbeddedImage};
use crate::report::ImageCategory;
use image::RgbaImage;
use std::fmt;

// ── Pixel statistics ─────────────────────────────────────────────────────

/// Luminance statistics over a sampled grid of pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelStats {
    pub samples: usize,
    pub white_fraction: f32,
    pub tone_fraction: f32,
    pub entropy_bits: f32,
    /// Neighbouring samples (horizontal and vertical) whose luminance
    /// differs by at least `edge_delta`.
    pub edge_transitions: usize,
    pub mean_luma: f32,
    pub std_luma: f32,
    /// Jumps of at least `profile_step_luma` between the mean luminance of
    /// neighbouring sampled rows. Each full-width horizontal line adds two.
    pub row_steps: usize,
    /// The same over sampled columns; full-height vertical lines.
    pub column_steps: usize,
}

impl PixelStats {
    pub fn edge_ratio(&self) -> f32 {
        if self.samples == 0 {
            0.0
        } else {
            self.edge_transitions as f32 / self.samples as f32
        }
    }

    /// Sample every `sample_stride`-th pixel along both axes.
    pub fn from_image(image: &RgbaImage, t: &ClassifierThresholds) -> Self {
        let stride = t.sample_stride.max(1) as usize;
        let (w, h) = image.dimensions();

        let mut histogram = [0usize; 256];
        let mut samples = 0usize;
        let mut white = 0usize;
        let mut tone = 0usize;
        let mut edges = 0usize;
        let mut sum = 0f64;
        let mut sum_sq = 0f64;
        let mut prev_row: Vec<u8> = Vec::new();
        let mut row: Vec<u8> = Vec::with_capacity(w as usize / stride + 1);
        let mut row_means: Vec<f64> = Vec::with_capacity(h as usize / stride + 1);
        let mut column_sums: Vec<u64> = vec![0; (w as usize).div_ceil(stride)];

        for y in (0..h).step_by(stride) {
            row.clear();
            let mut row_sum = 0u64;
            for x in (0..w).step_by(stride) {
                let l = luma(image.get_pixel(x, y).0);
                histogram[l as usize] += 1;
                samples += 1;
                sum += l as f64;
                sum_sq += (l as f64) * (l as f64);
                if l > t.white_luma {
                    white += 1;
                }
                if l < t.tone_luma {
                    tone += 1;
                }
                if let Some(&left) = row.last() {
                    if l.abs_diff(left) >= t.edge_delta {
                        edges += 1;
                    }
                }
                if let Some(&above) = prev_row.get(row.len()) {
                    if l.abs_diff(above) >= t.edge_delta {
                        edges += 1;
                    }
                }
                row_sum += l as u64;
                column_sums[row.len()] += l as u64;
                row.push(l);
            }
            if !row.is_empty() {
                row_means.push(row_sum as f64 / row.len() as f64);
            }
            std::mem::swap(&mut prev_row, &mut row);
        }

        if samples == 0 {
            return Self {
                samples: 0,
                white_fraction: 0.0,
                tone_fraction: 0.0,
                entropy_bits: 0.0,
                edge_transitions: 0,
                mean_luma: 0.0,
                std_luma: 0.0,
                row_steps: 0,
                column_steps: 0,
            };
        }

        let n = samples as f64;
        let entropy = histogram
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| {
                let p = c as f64 / n;
                -p * p.log2()
            })
            .sum::<f64>();
        let mean = sum / n;
        let variance = (sum_sq / n - mean * mean).max(0.0);
        let rows = row_means.len().max(1) as f64;
        let column_means: Vec<f64> = column_sums.iter().map(|&c| c as f64 / rows).collect();
        let step = t.profile_step_luma as f64;

        Self {
            samples,
            white_fraction: (white as f64 / n) as f32,
            tone_fraction: (tone as f64 / n) as f32,
            entropy_bits: entropy as f32,
            edge_transitions: edges,
            mean_luma: mean as f32,
            std_luma: variance.sqrt() as f32,
            row_steps: count_steps(&row_means, step),
            column_steps: count_steps(&column_means, step),
        }
    }
}

fn count_steps(profile: &[f64], step: f64) -> usize {
    profile
        .windows(2)
        .filter(|pair| (pair[1] - pair[0]).abs() >= step)
        .count()
}

/// BT.601 luminance, composited over a white background.
fn luma([r, g, b, a]: [u8; 4]) -> u8 {
    let y = (299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000;
    let a = a as u32;
    ((y * a + 255 * (255 - a)) / 255) as u8
}

// ── Gates ────────────────────────────────────────────────────────────────

pub fn passes_size_gate(width: u32, height: u32, t: &ClassifierThresholds) -> bool {
    width >= t.min_width && height >= t.min_height && width <= t.max_width && height <= t.max_height
}

/// Minimum-size check only, for embedded objects whose native resolution
/// may legitimately exceed the rendered-page maximum.
pub fn passes_min_size_gate(width: u32, height: u32, t: &ClassifierThresholds) -> bool {
    width >= t.min_width && height >= t.min_height
}

pub fn passes_aspect_gate(width: u32, height: u32, t: &ClassifierThresholds) -> bool {
    if height == 0 {
        return false;
    }
    let ratio = width as f32 / height as f32;
    ratio >= t.min_aspect_ratio && ratio <= t.max_aspect_ratio
}

pub fn passes_whiteness_gate(stats: &PixelStats, t: &ClassifierThresholds) -> bool {
    stats.samples > 0 && stats.white_fraction <= t.max_white_fraction
}

pub fn passes_tone_gate(stats: &PixelStats, t: &ClassifierThresholds) -> bool {
    stats.tone_fraction >= t.min_tone_fraction
}

/// Always passes when `min_entropy_bits` is unset.
pub fn passes_entropy_gate(stats: &PixelStats, t: &ClassifierThresholds) -> bool {
    t.min_entropy_bits.map_or(true, |min| stats.entropy_bits >= min)
}

/// Always passes when `min_edge_transitions` is unset.
pub fn passes_edge_gate(stats: &PixelStats, t: &ClassifierThresholds) -> bool {
    t.min_edge_transitions.map_or(true, |min| {
        stats.edge_transitions >= min && stats.edge_ratio() >= t.min_edge_ratio
    })
}

pub fn passes_position_gate(page_num: usize, total_pages: usize, t: &ClassifierThresholds) -> bool {
    t.admissible_pages.contains(page_num, total_pages)
}

/// Category read from the tonal profile alone, when it is decisive.
pub fn tonal_category(stats: &PixelStats, t: &ClassifierThresholds) -> Option<ImageCategory> {
    if stats.mean_luma < t.radiograph_max_mean && stats.std_luma < t.radiograph_max_std {
        Some(ImageCategory::Radiograph)
    } else if stats.mean_luma > t.ultrasound_min_mean && stats.std_luma > t.ultrasound_min_std {
        Some(ImageCategory::Ultrasound)
    } else {
        None
    }
}

/// Ruled table: full-width and full-height lines both present.
pub fn has_grid_structure(stats: &PixelStats, t: &ClassifierThresholds) -> bool {
    stats.row_steps >= t.lab_min_row_steps && stats.column_steps >= t.lab_min_column_steps
}

/// Stacked horizontal traces, as in M-mode and Doppler strips.
pub fn has_trace_structure(stats: &PixelStats, t: &ClassifierThresholds) -> bool {
    stats.row_steps >= t.echo_min_row_steps
}

/// Category from pixels: tonal profile first, then line structure. A grid
/// is checked before traces because a ruled table also has many rows.
pub fn pixel_category(stats: &PixelStats, t: &ClassifierThresholds) -> Option<ImageCategory> {
    tonal_category(stats, t).or_else(|| {
        if has_grid_structure(stats, t) {
            Some(ImageCategory::LabAnalysis)
        } else if has_trace_structure(stats, t) {
            Some(ImageCategory::Echocardiogram)
        } else {
            None
        }
    })
}

/// Names the gate that turned a page down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Size,
    Aspect,
    Whiteness,
    Tone,
    Entropy,
    Edges,
    Position,
    /// The document has image objects, but not on this page.
    Structure,
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Gate::Size => "size",
            Gate::Aspect => "aspect",
            Gate::Whiteness => "whiteness",
            Gate::Tone => "tone",
            Gate::Entropy => "entropy",
            Gate::Edges => "edges",
            Gate::Position => "position",
            Gate::Structure => "structure",
        };
        f.write_str(s)
    }
}

/// Pixel gates in a fixed order; returns the first that fails.
fn first_failing_pixel_gate(stats: &PixelStats, t: &ClassifierThresholds) -> Option<Gate> {
    if !passes_whiteness_gate(stats, t) {
        Some(Gate::Whiteness)
    } else if !passes_tone_gate(stats, t) {
        Some(Gate::Tone)
    } else if !passes_entropy_gate(stats, t) {
        Some(Gate::Entropy)
    } else if !passes_edge_gate(stats, t) {
        Some(Gate::Edges)
    } else {
        None
    }
}

// ── Classifiers ──────────────────────────────────────────────────────────

/// Everything a classifier may look at for one page.
pub struct PageContext<'a> {
    /// 1-based.
    pub page_num: usize,
    pub total_pages: usize,
    pub width: u32,
    pub height: u32,
    pub stats: &'a PixelStats,
    pub layout: &'a DocumentLayout,
}

impl PageContext<'_> {
    pub fn embedded(&self) -> &[EmbeddedImage] {
        self.layout.embedded_on(self.page_num)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub relevant: bool,
    pub category: ImageCategory,
    /// Name of the classifier that decided.
    pub decided_by: &'static str,
    pub rejected_by: Option<Gate>,
}

impl Classification {
    fn accept(category: ImageCategory, decided_by: &'static str) -> Self {
        Self {
            relevant: true,
            category,
            decided_by,
            rejected_by: None,
        }
    }

    fn reject(gate: Gate, decided_by: &'static str) -> Self {
        Self {
            relevant: false,
            category: ImageCategory::Other,
            decided_by,
            rejected_by: Some(gate),
        }
    }
}

/// One link of the classification chain.
pub trait PageClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` abstains and lets the next classifier decide.
    fn classify(&self, page: &PageContext<'_>, t: &ClassifierThresholds) -> Option<Classification>;
}

/// Decides from embedded image objects when the document has any.
#[derive(Debug, Default)]
pub struct StructuralClassifier;

impl PageClassifier for StructuralClassifier {
    fn name(&self) -> &'static str {
        "structural"
    }

    fn classify(&self, page: &PageContext<'_>, t: &ClassifierThresholds) -> Option<Classification> {
        if !page.layout.has_structural_markers() {
            return None;
        }

        let name = self.name();
        let Some(largest) = page
            .embedded()
            .iter()
            .max_by_key(|img| img.width as u64 * img.height as u64)
        else {
            return Some(Classification::reject(Gate::Structure, name));
        };

        if !passes_min_size_gate(largest.width, largest.height, t) {
            return Some(Classification::reject(Gate::Size, name));
        }
        if !passes_aspect_gate(largest.width, largest.height, t) {
            return Some(Classification::reject(Gate::Aspect, name));
        }
        if let Some(gate) = first_failing_pixel_gate(page.stats, t) {
            return Some(Classification::reject(gate, name));
        }

        let category =
            pixel_category(page.stats, t).unwrap_or_else(|| t.category_for_page(page.page_num));
        Some(Classification::accept(category, name))
    }
}

/// Pixel gates over the rendered page plus the position prior.
///
/// This is the fallback for documents without structural markers.
#[derive(Debug, Default)]
pub struct PixelHeuristicClassifier;

impl PageClassifier for PixelHeuristicClassifier {
    fn name(&self) -> &'static str {
        "pixel-heuristic"
    }

    fn classify(&self, page: &PageContext<'_>, t: &ClassifierThresholds) -> Option<Classification> {
        let name = self.name();
        if !passes_size_gate(page.width, page.height, t) {
            return Some(Classification::reject(Gate::Size, name));
        }
        if !passes_aspect_gate(page.width, page.height, t) {
            return Some(Classification::reject(Gate::Aspect, name));
        }
        if let Some(gate) = first_failing_pixel_gate(page.stats, t) {
            return Some(Classification::reject(gate, name));
        }
        if !passes_position_gate(page.page_num, page.total_pages, t) {
            return Some(Classification::reject(Gate::Position, name));
        }
        let category =
            pixel_category(page.stats, t).unwrap_or_else(|| t.category_for_page(page.page_num));
        Some(Classification::accept(category, name))
    }
}

/// An ordered list of classifiers; the first non-abstaining verdict wins.
pub struct ClassifierChain {
    thresholds: ClassifierThresholds,
    classifiers: Vec<Box<dyn PageClassifier>>,
}

impl fmt::Debug for ClassifierChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.classifiers.iter().map(|c| c.name()).collect();
        f.debug_struct("ClassifierChain")
            .field("classifiers", &names)
            .finish()
    }
}

impl ClassifierChain {
    /// Structural classifier first, pixel heuristic as fallback.
    pub fn new(thresholds: ClassifierThresholds) -> Self {
        Self {
            thresholds,
            classifiers: vec![
                Box::new(StructuralClassifier),
                Box::new(PixelHeuristicClassifier),
            ],
        }
    }

    pub fn with_classifiers(
        thresholds: ClassifierThresholds,
        classifiers: Vec<Box<dyn PageClassifier>>,
    ) -> Self {
        Self {
            thresholds,
            classifiers,
        }
    }

    pub fn thresholds(&self) -> &ClassifierThresholds {
        &self.thresholds
    }

    pub fn classify(&self, page: &PageContext<'_>) -> Classification {
        self.classifiers
            .iter()
            .find_map(|c| c.classify(page, &self.thresholds))
            .unwrap_or(Classification {
                relevant: false,
                category: ImageCategory::Other,
                decided_by: "none",
                rejected_by: None,
            })
    }

    /// Compute statistics for `image` and classify it.
    pub fn classify_image(
        &self,
        image: &RgbaImage,
        page_num: usize,
        layout: &DocumentLayout,
    ) -> Classification {
        let stats = PixelStats::from_image(image, &self.thresholds);
        let page = PageContext {
            page_num,
            total_pages: layout.page_count,
            width: image.width(),
            height: image.height(),
            stats: &stats,
            layout,
        };
        self.classify(&page)
    }
}
