//! The canonical report artifact and its nested value types.
//!
//! [`VeterinaryReport`] is produced once per ingested document. Every list
//! field is a `Vec` carrying `#[serde(default)]`, so a partially populated
//! JSON document always deserialises into empty sequences rather than
//! failing. Enumerated fields deserialise through [`from_label`]-style
//! normalisers that fall back to `other` / `unknown` instead of rejecting
//! unfamiliar wording.
//!
//! [`from_label`]: StudyType::from_label

use crate::upload::UploadedFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Confidence assigned to every synthesized report.
///
/// The synthesis contract demands literal extraction, so this is a fixed
/// constant rather than a measured score.
pub const SYNTHESIS_CONFIDENCE: f32 = 0.95;

/// Confidence assigned to reports built without the synthesis service.
pub const BASIC_CONFIDENCE: f32 = 0.5;

/// Placeholder for scalar fields the document does not state.
pub const NOT_SPECIFIED: &str = "Not specified";

// ── Report ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VeterinaryReport {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub source_filename: String,
    pub status: ReportStatus,
    /// Always within `[0, 1]`.
    pub extraction_confidence: f32,
    #[serde(default)]
    pub study_info: StudyInfo,
    #[serde(default)]
    pub patient: Patient,
    #[serde(default)]
    pub guardian: Guardian,
    /// Ordered; a report may be co-signed.
    #[serde(default)]
    pub veterinarians: Vec<Veterinarian>,
    #[serde(default)]
    pub findings: Findings,
    #[serde(default)]
    pub conclusion: Conclusion,
    #[serde(default)]
    pub treatment: Treatment,
    #[serde(default)]
    pub additional: AdditionalContent,
    /// Owned by the report; images have no identity outside it.
    #[serde(default)]
    pub images: Vec<MedicalImage>,
    #[serde(default)]
    pub raw_extracted_text: String,
    /// Remote copy of the source document, once uploaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_file: Option<UploadedFile>,
}

impl VeterinaryReport {
    /// An empty, completed report shell for `source_filename`.
    pub fn new(source_filename: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            source_filename: source_filename.into(),
            status: ReportStatus::Completed,
            extraction_confidence: SYNTHESIS_CONFIDENCE,
            study_info: StudyInfo::default(),
            patient: Patient::default(),
            guardian: Guardian::default(),
            veterinarians: Vec::new(),
            findings: Findings::default(),
            conclusion: Conclusion::default(),
            treatment: Treatment::default(),
            additional: AdditionalContent::default(),
            images: Vec::new(),
            raw_extracted_text: String::new(),
            original_file: None,
        }
    }

    /// Build a report straight from extracted content, without synthesis.
    ///
    /// Scalars the document would normally provide are set to
    /// [`NOT_SPECIFIED`] and the study type is `other`.
    pub fn basic(
        source_filename: impl Into<String>,
        raw_extracted_text: String,
        images: Vec<MedicalImage>,
    ) -> Self {
        let mut report = Self::new(source_filename);
        report.extraction_confidence = BASIC_CONFIDENCE;
        report.study_info = StudyInfo {
            date: report.created_at.format("%Y-%m-%d").to_string(),
            study_type: StudyType::Other,
            request_reason: NOT_SPECIFIED.into(),
            referring_veterinarian: None,
        };
        report.patient = Patient {
            name: NOT_SPECIFIED.into(),
            species: NOT_SPECIFIED.into(),
            breed: NOT_SPECIFIED.into(),
            age: NOT_SPECIFIED.into(),
            sex: Sex::Unknown,
            weight: None,
            id_tag: None,
        };
        report.guardian.name = NOT_SPECIFIED.into();
        report.findings.summary = Some("Report generated without AI synthesis".into());
        report.images = images;
        report.raw_extracted_text = raw_extracted_text;
        report
    }

    /// Name of the first signing veterinarian, if any.
    pub fn primary_veterinarian_name(&self) -> Option<&str> {
        self.veterinarians
            .iter()
            .map(|v| v.name.as_str())
            .find(|n| !n.trim().is_empty())
    }

    /// First primary diagnosis, if any.
    pub fn primary_diagnosis(&self) -> Option<&str> {
        self.conclusion.primary_diagnoses.first().map(String::as_str)
    }
}

// ── Nested value types ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StudyInfo {
    pub date: String,
    pub study_type: StudyType,
    pub request_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referring_veterinarian: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Patient {
    pub name: String,
    pub species: String,
    pub breed: String,
    pub age: String,
    pub sex: Sex,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag: Option<String>,
}

/// The animal's owner or responsible party.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Guardian {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Veterinarian {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clinic: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Findings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Literal observations, in document order.
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Conclusion {
    pub primary_diagnoses: Vec<String>,
    pub differentials: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Treatment {
    pub recommendations: Vec<String>,
}

/// Content that does not fit the fixed sections: the narrative body and
/// loose lists of observations, medications and procedures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdditionalContent {
    pub narrative: String,
    pub observations: Vec<String>,
    pub recommendations: Vec<String>,
    pub medications: Vec<String>,
    pub procedures: Vec<String>,
}

/// A clinical image accepted by the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicalImage {
    pub id: Uuid,
    pub label: String,
    /// `data:image/png;base64,...`
    pub raster_data: String,
    pub description: String,
    pub category: ImageCategory,
    /// 1-based.
    pub source_page: usize,
    pub width: u32,
    pub height: u32,
}

impl MedicalImage {
    pub fn new(
        source_page: usize,
        category: ImageCategory,
        width: u32,
        height: u32,
        raster_data: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: format!("Clinical image - page {source_page}"),
            raster_data,
            description: format!("{category} ({width}x{height}px)"),
            category,
            source_page,
            width,
            height,
        }
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Lowercase, trim, and fold the accented vowels that appear in clinical
/// wording so `"Radiografía"` and `"radiografia"` compare equal.
fn normalise_label(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' => 'a',
            'é' | 'è' => 'e',
            'í' | 'ì' => 'i',
            'ó' | 'ò' => 'o',
            'ú' | 'ù' | 'ü' => 'u',
            '_' | ' ' => '-',
            other => other,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", from = "String")]
pub enum ReportStatus {
    Processing,
    #[default]
    Completed,
    Error,
}

impl From<String> for ReportStatus {
    fn from(raw: String) -> Self {
        match normalise_label(&raw).as_str() {
            "processing" | "pending" => ReportStatus::Processing,
            "error" | "failed" => ReportStatus::Error,
            _ => ReportStatus::Completed,
        }
    }
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Processing => "processing",
            ReportStatus::Completed => "completed",
            ReportStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", from = "String")]
pub enum StudyType {
    Radiograph,
    Ultrasound,
    LabAnalysis,
    Consultation,
    #[default]
    Other,
}

impl StudyType {
    /// Map free-form wording onto a study type, defaulting to `Other`.
    pub fn from_label(raw: &str) -> Self {
        let label = normalise_label(raw);
        match label.as_str() {
            "radiograph" | "radiography" | "x-ray" | "xray" | "rx" | "radiografia" => {
                StudyType::Radiograph
            }
            "ultrasound" | "ultrasonography" | "echography" | "ecografia" => StudyType::Ultrasound,
            "lab-analysis" | "laboratory" | "lab" | "analysis" | "analisis" => {
                StudyType::LabAnalysis
            }
            "consultation" | "consult" | "consulta" => StudyType::Consultation,
            _ if label.contains("radiogra") || label.contains("x-ray") => StudyType::Radiograph,
            _ if label.contains("ultrasound") || label.contains("ecogra") => StudyType::Ultrasound,
            _ => StudyType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StudyType::Radiograph => "radiograph",
            StudyType::Ultrasound => "ultrasound",
            StudyType::LabAnalysis => "lab-analysis",
            StudyType::Consultation => "consultation",
            StudyType::Other => "other",
        }
    }
}

impl From<String> for StudyType {
    fn from(raw: String) -> Self {
        StudyType::from_label(&raw)
    }
}

impl fmt::Display for StudyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", from = "String")]
pub enum Sex {
    Male,
    Female,
    Neutered,
    Spayed,
    #[default]
    Unknown,
}

impl Sex {
    pub fn from_label(raw: &str) -> Self {
        match normalise_label(raw).as_str() {
            "male" | "m" | "macho" => Sex::Male,
            "female" | "f" | "hembra" => Sex::Female,
            "neutered" | "castrated" | "castrado" | "male-neutered" => Sex::Neutered,
            "spayed" | "esterilizada" | "female-spayed" => Sex::Spayed,
            _ => Sex::Unknown,
        }
    }
}

impl From<String> for Sex {
    fn from(raw: String) -> Self {
        Sex::from_label(&raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", from = "String")]
pub enum ImageCategory {
    Radiograph,
    Ultrasound,
    Echocardiogram,
    LabAnalysis,
    #[default]
    Other,
}

impl ImageCategory {
    pub fn from_label(raw: &str) -> Self {
        match normalise_label(raw).as_str() {
            "radiograph" | "radiography" | "x-ray" | "radiografia" => ImageCategory::Radiograph,
            "ultrasound" | "echography" | "ecografia" => ImageCategory::Ultrasound,
            "echocardiogram" | "ecocardiograma" => ImageCategory::Echocardiogram,
            "lab-analysis" | "laboratory" | "analisis" => ImageCategory::LabAnalysis,
            _ => ImageCategory::Other,
        }
    }
}

impl From<String> for ImageCategory {
    fn from(raw: String) -> Self {
        ImageCategory::from_label(&raw)
    }
}

impl fmt::Display for ImageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageCategory::Radiograph => "Radiograph",
            ImageCategory::Ultrasound => "Ultrasound",
            ImageCategory::Echocardiogram => "Echocardiogram",
            ImageCategory::LabAnalysis => "Lab analysis",
            ImageCategory::Other => "Image",
        };
        f.write_str(s)
    }
}
