//! Optional upload of the original document to cloud object storage.
//!
//! The upload runs only when the caller asks for it and always after a
//! report exists. A failure here never fails the run: the orchestrator logs
//! it, records a warning and returns the report without a file reference.
//!
//! Remote files get a human-readable name built from the report:
//! `{YYYY-MM-DD}_{patient}_{studyType}_{basename}.{ext}`.

use crate::error::UploadError;
use crate::report::VeterinaryReport;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DRIVE_UPLOAD_URL: &str =
    "https://www.googleapis.com/upload/drive/v3/files?uploadType=multipart&fields=id,name";

/// Reference to an uploaded file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub id: String,
    pub name: String,
    pub url: String,
    /// Folder, bucket or equivalent the file landed in.
    pub container_id: String,
}

/// Clinic-facing metadata attached to the remote file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    pub patient_name: String,
    pub veterinarian_name: String,
    pub study_type: String,
    pub study_date: String,
}

impl UploadMetadata {
    pub fn from_report(report: &VeterinaryReport) -> Self {
        Self {
            patient_name: report.patient.name.clone(),
            veterinarian_name: report.primary_veterinarian_name().unwrap_or_default().to_string(),
            study_type: report.study_info.study_type.to_string(),
            study_date: report.study_info.date.clone(),
        }
    }

    /// `Patient: X | Veterinarian: Y | Type: Z | Date: D`
    pub fn describe(&self) -> String {
        format!(
            "Patient: {} | Veterinarian: {} | Type: {} | Date: {}",
            self.patient_name, self.veterinarian_name, self.study_type, self.study_date
        )
    }
}

/// One file to upload.
#[derive(Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub metadata: UploadMetadata,
    /// Fallback date for the remote name when the study date is unreadable.
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("filename", &self.filename)
            .field("mime_type", &self.mime_type)
            .field("bytes", &format_args!("<{} bytes>", self.bytes.len()))
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl UploadRequest {
    pub fn remote_filename(&self) -> String {
        remote_filename(&self.metadata, &self.filename, self.created_at)
    }
}

// ── Remote naming ────────────────────────────────────────────────────────

static DAY_FIRST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})[/.\-](\d{1,2})[/.\-](\d{4})$").unwrap());

static UNSAFE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9\-]+").unwrap());

/// Normalise a study date to `YYYY-MM-DD`. Accepts ISO dates and the
/// day-first `DD/MM/YYYY` form clinical reports use.
pub fn normalise_study_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    let caps = DAY_FIRST_RE.captures(raw)?;
    let day = caps[1].parse().ok()?;
    let month = caps[2].parse().ok()?;
    let year = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn sanitise(part: &str) -> String {
    let folded: String = part
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'Á' => 'a',
            'é' | 'è' | 'É' => 'e',
            'í' | 'ì' | 'Í' => 'i',
            'ó' | 'ò' | 'Ó' => 'o',
            'ú' | 'ù' | 'ü' | 'Ú' => 'u',
            'ñ' => 'n',
            'Ñ' => 'N',
            c => c,
        })
        .collect();
    let cleaned = UNSAFE_RE.replace_all(folded.trim(), "-");
    let cleaned = cleaned.trim_matches('-');
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `{YYYY-MM-DD}_{patient}_{studyType}_{basename}.{ext}`
pub fn remote_filename(
    metadata: &UploadMetadata,
    original_filename: &str,
    created_at: DateTime<Utc>,
) -> String {
    let date = normalise_study_date(&metadata.study_date).unwrap_or_else(|| created_at.date_naive());
    let (base, ext) = match original_filename.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() && !ext.is_empty() => (base, ext.to_lowercase()),
        _ => (original_filename, "pdf".to_string()),
    };
    format!(
        "{}_{}_{}_{}.{}",
        date.format("%Y-%m-%d"),
        sanitise(&metadata.patient_name),
        sanitise(&metadata.study_type),
        sanitise(base),
        ext
    )
}

// ── Object store seam ────────────────────────────────────────────────────

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, request: UploadRequest) -> Result<UploadedFile, UploadError>;
}

/// Google Drive v3 multipart upload.
pub struct DriveObjectStore {
    client: Client,
    access_token: Option<String>,
    folder_id: Option<String>,
}

impl DriveObjectStore {
    pub fn new(access_token: Option<String>, folder_id: Option<String>) -> Self {
        Self {
            client: Client::new(),
            access_token: access_token.filter(|t| !t.is_empty()),
            folder_id: folder_id.filter(|f| !f.is_empty()),
        }
    }

    /// Read `GOOGLE_DRIVE_ACCESS_TOKEN` and `GOOGLE_DRIVE_FOLDER_ID`.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("GOOGLE_DRIVE_ACCESS_TOKEN").ok(),
            std::env::var("GOOGLE_DRIVE_FOLDER_ID").ok(),
        )
    }
}

#[derive(Deserialize)]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[async_trait]
impl ObjectStore for DriveObjectStore {
    async fn put(&self, request: UploadRequest) -> Result<UploadedFile, UploadError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| UploadError::NotConfigured("GOOGLE_DRIVE_ACCESS_TOKEN not set".into()))?;
        let folder = self
            .folder_id
            .as_deref()
            .ok_or_else(|| UploadError::NotConfigured("GOOGLE_DRIVE_FOLDER_ID not set".into()))?;

        let name = request.remote_filename();
        let metadata = json!({
            "name": name,
            "parents": [folder],
            "description": request.metadata.describe(),
        });

        let meta_part = Part::text(metadata.to_string())
            .mime_str("application/json; charset=UTF-8")
            .map_err(|e| UploadError::Transport(e.to_string()))?;
        let file_part = Part::bytes(request.bytes)
            .file_name(name.clone())
            .mime_str(&request.mime_type)
            .map_err(|e| UploadError::Transport(e.to_string()))?;
        let form = Form::new().part("metadata", meta_part).part("file", file_part);

        debug!("Uploading '{}' to Drive folder {}", name, folder);

        let resp = self
            .client
            .post(DRIVE_UPLOAD_URL)
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let detail = resp.text().await.unwrap_or_default();
            return Err(UploadError::Rejected { status, detail });
        }

        let file: DriveFile = resp
            .json()
            .await
            .map_err(|e| UploadError::Decode(e.to_string()))?;

        Ok(UploadedFile {
            url: format!("https://drive.google.com/file/d/{}/view", file.id),
            name: file.name.unwrap_or(name),
            id: file.id,
            container_id: folder.to_string(),
        })
    }
}

// ── Coordinator ──────────────────────────────────────────────────────────

/// Runs an [`ObjectStore`] upload under a time budget and a cancellation
/// token.
#[derive(Clone)]
pub struct UploadCoordinator {
    store: Arc<dyn ObjectStore>,
    timeout: Duration,
}

impl UploadCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn upload(
        &self,
        request: UploadRequest,
        cancel: &CancellationToken,
    ) -> Result<UploadedFile, UploadError> {
        let filename = request.filename.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            res = tokio::time::timeout(self.timeout, self.store.put(request)) => match res {
                Ok(r) => r,
                Err(_) => Err(UploadError::TimedOut { secs: self.timeout.as_secs() }),
            },
        };
        if let Ok(ref file) = result {
            info!("Uploaded '{}' as '{}' ({})", filename, file.name, file.url);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metadata(date: &str) -> UploadMetadata {
        UploadMetadata {
            patient_name: "Luna Pérez".into(),
            veterinarian_name: "Dra. Vega".into(),
            study_type: "radiograph".into(),
            study_date: date.into(),
        }
    }

    fn fallback() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn remote_name_uses_day_first_study_date() {
        let name = remote_filename(&metadata("12/03/2026"), "RX tórax.PDF", fallback());
        assert_eq!(name, "2026-03-12_Luna-Perez_radiograph_RX-torax.pdf");
    }

    #[test]
    fn remote_name_accepts_iso_date() {
        let name = remote_filename(&metadata("2026-02-28"), "scan.pdf", fallback());
        assert!(name.starts_with("2026-02-28_"), "{name}");
    }

    #[test]
    fn unreadable_date_falls_back_to_creation_day() {
        let name = remote_filename(&metadata("marzo"), "scan", fallback());
        assert_eq!(name, "2026-10-01_Luna-Perez_radiograph_scan.pdf");
    }

    #[test]
    fn blank_parts_become_unknown() {
        let meta = UploadMetadata::default();
        let name = remote_filename(&meta, "a.pdf", fallback());
        assert_eq!(name, "2026-10-01_unknown_unknown_a.pdf");
    }

    #[test]
    fn impossible_day_first_date_is_rejected() {
        assert!(normalise_study_date("31/02/2026").is_none());
        assert_eq!(
            normalise_study_date("1.4.2025"),
            NaiveDate::from_ymd_opt(2025, 4, 1)
        );
    }

    #[test]
    fn description_lists_every_field() {
        assert_eq!(
            metadata("12/03/2026").describe(),
            "Patient: Luna Pérez | Veterinarian: Dra. Vega | Type: radiograph | Date: 12/03/2026"
        );
    }

    #[tokio::test]
    async fn drive_store_without_credentials_is_not_configured() {
        let store = DriveObjectStore::new(None, Some("folder".into()));
        let request = UploadRequest {
            filename: "a.pdf".into(),
            mime_type: "application/pdf".into(),
            bytes: b"%PDF-1.7".to_vec(),
            metadata: metadata(""),
            created_at: fallback(),
        };
        let err = store.put(request).await.unwrap_err();
        assert!(matches!(err, UploadError::NotConfigured(_)));
    }

    struct SlowStore;

    #[async_trait]
    impl ObjectStore for SlowStore {
        async fn put(&self, _request: UploadRequest) -> Result<UploadedFile, UploadError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(UploadError::Transport("unreachable".into()))
        }
    }

    fn request() -> UploadRequest {
        UploadRequest {
            filename: "a.pdf".into(),
            mime_type: "application/pdf".into(),
            bytes: Vec::new(),
            metadata: UploadMetadata::default(),
            created_at: fallback(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn coordinator_enforces_timeout() {
        let coordinator = UploadCoordinator::new(Arc::new(SlowStore), Duration::from_secs(5));
        let err = coordinator
            .upload(request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TimedOut { secs: 5 }));
    }

    #[tokio::test]
    async fn coordinator_honours_cancellation() {
        let coordinator = UploadCoordinator::new(Arc::new(SlowStore), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = coordinator.upload(request(), &cancel).await.unwrap_err();
        assert!(matches!(err, UploadError::Cancelled));
    }
}
