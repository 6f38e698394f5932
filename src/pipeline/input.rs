//! Input gate: accept only PDF uploads under the size cap.
//!
//! Every check here runs before any stage does. pdfium is far happier being
//! told "no" up front than being handed a 40 MB JPEG, and a rejected upload
//! should never show up as a half-processed report.

use crate::config::IngestConfig;
use crate::error::IngestError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// PDF files start with this header.
const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// A single uploaded file as received from the caller.
#[derive(Clone)]
pub struct UploadedDocument {
    /// Original filename as supplied by the uploader.
    pub filename: String,
    /// Declared MIME type.
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for UploadedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadedDocument")
            .field("filename", &self.filename)
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl UploadedDocument {
    pub fn new(
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Read a local file, deriving the MIME type from its extension.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => IngestError::FileNotFound {
                path: PathBuf::from(path),
            },
            _ => IngestError::Internal(format!("Failed to read '{}': {e}", path.display())),
        })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string());
        let mime_type = mime_from_extension(path);
        debug!("Read {} ({} bytes, {})", filename, bytes.len(), mime_type);
        Ok(Self::new(filename, mime_type, bytes))
    }

    /// Filename without its final extension.
    pub fn stem(&self) -> &str {
        match self.filename.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => &self.filename,
        }
    }

    /// Final extension without the dot, defaulting to `pdf`.
    pub fn extension(&self) -> &str {
        match self.filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext,
            _ => "pdf",
        }
    }
}

fn mime_from_extension(path: &Path) -> String {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("pdf") => "application/pdf".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}

/// Reject uploads that must never reach the pipeline.
///
/// Checks, in order: declared MIME type, empty body, size cap, PDF magic.
pub fn validate_upload(doc: &UploadedDocument, config: &IngestConfig) -> Result<(), IngestError> {
    // "application/pdf; charset=binary" still names a PDF
    let essence = doc
        .mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if !config
        .accepted_mime_types
        .iter()
        .any(|m| m.eq_ignore_ascii_case(&essence))
    {
        return Err(IngestError::UnsupportedMimeType {
            filename: doc.filename.clone(),
            mime: doc.mime_type.clone(),
        });
    }

    if doc.bytes.is_empty() {
        return Err(IngestError::EmptyInput {
            filename: doc.filename.clone(),
        });
    }

    if doc.bytes.len() > config.max_upload_bytes {
        return Err(IngestError::FileTooLarge {
            filename: doc.filename.clone(),
            size: doc.bytes.len(),
            limit: config.max_upload_bytes,
        });
    }

    if !doc.bytes.starts_with(PDF_MAGIC) {
        return Err(IngestError::NotAPdf {
            filename: doc.filename.clone(),
            magic: doc.bytes.iter().take(4).copied().collect(),
        });
    }

    Ok(())
}
