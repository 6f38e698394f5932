//! Storage records, dedupe keys and the [`ReportStore`] trait.

use crate::error::StoreError;
use crate::report::{
    Guardian, Patient, ReportStatus, Sex, StudyType, Veterinarian, VeterinaryReport, NOT_SPECIFIED,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default row cap for list and search queries.
pub const DEFAULT_QUERY_LIMIT: usize = 50;

// ── Dedupe keys ──────────────────────────────────────────────────────────

fn key_part(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `(name, species, guardian name)`, case- and whitespace-insensitive.
pub fn patient_key(name: &str, species: &str, guardian_name: &str) -> String {
    format!(
        "{}|{}|{}",
        key_part(name),
        key_part(species),
        key_part(guardian_name)
    )
}

/// License number when present, else name.
pub fn veterinarian_key(name: &str, license_number: Option<&str>) -> String {
    match license_number.map(str::trim).filter(|l| !l.is_empty()) {
        Some(license) => format!("license:{}", key_part(license)),
        None => format!("name:{}", key_part(name)),
    }
}

/// `(original filename, study type)`. Filenames are compared exactly.
pub fn report_key(source_filename: &str, study_type: StudyType) -> String {
    format!("{}|{}", source_filename.trim(), study_type.as_str())
}

fn or_not_specified(value: &str) -> String {
    if value.trim().is_empty() {
        NOT_SPECIFIED.to_string()
    } else {
        value.trim().to_string()
    }
}

// ── Records ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub id: Uuid,
    pub dedupe_key: String,
    pub name: String,
    pub species: String,
    pub breed: String,
    pub age: String,
    pub sex: Sex,
    pub guardian_name: String,
    #[serde(default)]
    pub guardian_phone: Option<String>,
    #[serde(default)]
    pub guardian_email: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PatientRecord {
    pub fn from_report(patient: &Patient, guardian: &Guardian) -> Self {
        let name = or_not_specified(&patient.name);
        let species = or_not_specified(&patient.species);
        let guardian_name = or_not_specified(&guardian.name);
        Self {
            id: Uuid::new_v4(),
            dedupe_key: patient_key(&name, &species, &guardian_name),
            name,
            species,
            breed: or_not_specified(&patient.breed),
            age: or_not_specified(&patient.age),
            sex: patient.sex,
            guardian_name,
            guardian_phone: guardian.phone.clone(),
            guardian_email: guardian.email.clone(),
            created_at: Utc::now(),
        }
    }

    /// Shared record linked when a patient upsert fails under the
    /// placeholder policy.
    pub fn placeholder() -> Self {
        let patient = Patient {
            name: "Unidentified patient".into(),
            ..Default::default()
        };
        Self::from_report(&patient, &Guardian::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VeterinarianRecord {
    pub id: Uuid,
    pub dedupe_key: String,
    pub name: String,
    #[serde(default)]
    pub license_number: Option<String>,
    pub clinic: String,
    pub phone: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl VeterinarianRecord {
    pub fn from_report(vet: &Veterinarian) -> Self {
        let license_number = vet
            .license_number
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string);
        Self {
            id: Uuid::new_v4(),
            dedupe_key: veterinarian_key(&vet.name, license_number.as_deref()),
            name: or_not_specified(&vet.name),
            license_number,
            clinic: or_not_specified(vet.clinic.as_deref().unwrap_or_default()),
            phone: NOT_SPECIFIED.to_string(),
            email: NOT_SPECIFIED.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn placeholder() -> Self {
        Self::from_report(&Veterinarian {
            name: "Unidentified veterinarian".into(),
            ..Default::default()
        })
    }
}

/// A persisted report and its entity links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReport {
    pub id: Uuid,
    /// Frozen at first insert; edits do not re-key the row.
    pub dedupe_key: String,
    pub patient_id: Uuid,
    pub veterinarian_ids: Vec<Uuid>,
    pub report: VeterinaryReport,
}

impl StoredReport {
    pub fn new(report: VeterinaryReport, patient_id: Uuid, veterinarian_ids: Vec<Uuid>) -> Self {
        Self {
            id: report.id,
            dedupe_key: report_key(&report.source_filename, report.study_info.study_type),
            patient_id,
            veterinarian_ids,
            report,
        }
    }

    /// Case-insensitive substring match over patient name, veterinarian
    /// names and primary diagnosis. `needle` must already be lowercase.
    pub fn matches_term(&self, needle: &str) -> bool {
        let r = &self.report;
        r.patient.name.to_lowercase().contains(needle)
            || r
                .veterinarians
                .iter()
                .any(|v| v.name.to_lowercase().contains(needle))
            || r
                .primary_diagnosis()
                .is_some_and(|d| d.to_lowercase().contains(needle))
    }
}

/// Result of an insert-or-get.
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted<T> {
    pub record: T,
    /// False when an existing row was returned.
    pub created: bool,
}

/// Filters for [`ReportStore::list_reports`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportFilter {
    pub study_type: Option<StudyType>,
    /// Exact match, case-insensitive.
    pub species: Option<String>,
    /// Substring of any signing veterinarian's name, case-insensitive.
    pub veterinarian: Option<String>,
    pub status: Option<ReportStatus>,
    pub limit: Option<usize>,
    /// Rows to skip after ordering, for paging.
    pub offset: Option<usize>,
}

impl ReportFilter {
    pub fn matches(&self, stored: &StoredReport) -> bool {
        let r = &stored.report;
        self.study_type.is_none_or(|t| r.study_info.study_type == t)
            && self.status.is_none_or(|s| r.status == s)
            && self
                .species
                .as_deref()
                .is_none_or(|s| r.patient.species.eq_ignore_ascii_case(s.trim()))
            && self.veterinarian.as_deref().is_none_or(|v| {
                let needle = v.trim().to_lowercase();
                r.veterinarians
                    .iter()
                    .any(|vet| vet.name.to_lowercase().contains(&needle))
            })
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT)
    }

    pub fn offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

// ── Store trait ──────────────────────────────────────────────────────────

/// Storage backend for patients, veterinarians and reports.
///
/// The `insert_*_or_get` methods are atomic per dedupe key: when a row with
/// the same key exists, it is returned and nothing is written.
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn find_patient(&self, dedupe_key: &str) -> Result<Option<PatientRecord>, StoreError>;

    async fn insert_patient_or_get(
        &self,
        record: PatientRecord,
    ) -> Result<Upserted<PatientRecord>, StoreError>;

    async fn find_veterinarian(
        &self,
        dedupe_key: &str,
    ) -> Result<Option<VeterinarianRecord>, StoreError>;

    async fn insert_veterinarian_or_get(
        &self,
        record: VeterinarianRecord,
    ) -> Result<Upserted<VeterinarianRecord>, StoreError>;

    async fn find_report(&self, dedupe_key: &str) -> Result<Option<StoredReport>, StoreError>;

    async fn insert_report_or_get(
        &self,
        stored: StoredReport,
    ) -> Result<Upserted<StoredReport>, StoreError>;

    async fn get_report(&self, id: Uuid) -> Result<Option<StoredReport>, StoreError>;

    /// Newest first.
    async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<StoredReport>, StoreError>;

    /// Newest first.
    async fn search_reports(&self, term: &str, limit: usize)
        -> Result<Vec<StoredReport>, StoreError>;

    /// Replace the report body of an existing row. Links and dedupe key are kept.
    async fn update_report(
        &self,
        id: Uuid,
        report: VeterinaryReport,
    ) -> Result<StoredReport, StoreError>;

    async fn delete_report(&self, id: Uuid) -> Result<(), StoreError>;
}
