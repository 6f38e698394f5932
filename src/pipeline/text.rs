//! Text extraction: join per-page text into one page-marked document string.
//!
//! Only the literal text layer is read. A scanned, image-only PDF yields
//! empty pages here; no OCR fallback is attempted.

use once_cell::sync::Lazy;
use regex::Regex;

/// Marker line placed before each page's text.
pub fn page_marker(page_num: usize) -> String {
    format!("--- PAGE {page_num} ---")
}

static PAGE_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*-{3} PAGE \d+ -{3}[ \t]*\r?\n?").unwrap());

/// Collects page texts in order and assembles the document string.
#[derive(Debug, Default)]
pub struct TextExtractor {
    pages: Vec<(usize, String)>,
}

impl TextExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the text of one page. Runs of whitespace inside the page are
    /// collapsed so text runs separated by layout gaps read as words.
    pub fn push_page(&mut self, page_num: usize, raw: &str) {
        let text = raw
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        self.pages.push((page_num, text));
    }

    /// True when no page contributed any non-blank text.
    pub fn is_blank(&self) -> bool {
        self.pages.iter().all(|(_, t)| t.is_empty())
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// The full document with a marker before every page, including blank ones.
    pub fn finish(self) -> String {
        let mut out = String::new();
        for (page_num, text) in self.pages {
            out.push('\n');
            out.push_str(&page_marker(page_num));
            out.push('\n');
            out.push_str(&text);
            out.push('\n');
        }
        out
    }
}

/// Remove page-boundary markers, for text that leaves the pipeline.
pub fn strip_page_markers(text: &str) -> String {
    PAGE_MARKER_RE.replace_all(text, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_marked_in_order() {
        let mut ex = TextExtractor::new();
        ex.push_page(1, "Patient:   Rex");
        ex.push_page(2, "Findings");
        let doc = ex.finish();
        let p1 = doc.find("--- PAGE 1 ---").unwrap();
        let p2 = doc.find("--- PAGE 2 ---").unwrap();
        assert!(p1 < p2);
        assert!(doc.contains("Patient: Rex"));
    }

    #[test]
    fn blank_pages_still_get_markers() {
        let mut ex = TextExtractor::new();
        ex.push_page(1, "  \n \t ");
        ex.push_page(2, "");
        assert!(ex.is_blank());
        let doc = ex.finish();
        assert!(doc.contains("--- PAGE 2 ---"));
    }

    #[test]
    fn strip_markers_leaves_content() {
        let mut ex = TextExtractor::new();
        ex.push_page(1, "Cardiomegaly");
        ex.push_page(2, "Rest");
        let stripped = strip_page_markers(&ex.finish());
        assert!(!stripped.contains("PAGE"));
        assert!(stripped.contains("Cardiomegaly"));
        assert!(stripped.contains("Rest"));
    }
}
