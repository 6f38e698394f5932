//! Pipeline stages that run before synthesis.
//!
//! Each submodule implements exactly one step. Everything here except
//! [`input`] runs on a blocking thread inside a single [`document`] walk,
//! because pdfium documents cannot cross an `.await`.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ classify ──▶ encode
//!  (gate)   (pdfium)   (gates)      (PNG data URL)
//!              │
//!              └──▶ text (page-marked document string)
//! ```
//!
//! 1. [`input`]    reject non-PDF or oversized uploads before any work runs
//! 2. [`render`]   the `DocumentBackend` seam and its pdfium implementation
//! 3. [`classify`] size, aspect, pixel and position gates plus category inference
//! 4. [`encode`]   PNG-encode accepted pages as `data:` URLs
//! 5. [`text`]     literal text runs joined with page-boundary markers
//! 6. [`document`] one pass over the pages that drives 2–5 and drops each
//!    page buffer before the next is rendered

pub mod classify;
pub mod document;
pub mod encode;
pub mod input;
pub mod render;
pub mod text;
