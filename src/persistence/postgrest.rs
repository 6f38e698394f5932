//! [`ReportStore`] over a PostgREST endpoint (Supabase REST API).
//!
//! Tables and unique indexes are defined in `sql/schema.sql`. Inserts use
//! `on_conflict=dedupe_key` with `resolution=ignore-duplicates`, so a
//! conflicting insert writes nothing and returns an empty array; the
//! existing row is then read back by key.
//!
//! Search and list queries run against denormalised columns on `reports`
//! (`patient_name`, `species`, `veterinarian_names`, `primary_diagnosis`,
//! `study_type`, `status`). The full report lives in the `report` jsonb
//! column.

use super::store::{
    PatientRecord, ReportFilter, ReportStore, StoredReport, Upserted, VeterinarianRecord,
};
use crate::error::StoreError;
use crate::report::VeterinaryReport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

const PATIENTS: &str = "patients";
const VETERINARIANS: &str = "veterinarians";
const REPORTS: &str = "reports";

/// Supabase REST client.
#[derive(Clone)]
pub struct PostgrestStore {
    client: Client,
    base_url: String,
    service_role_key: String,
}

impl std::fmt::Debug for PostgrestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgrestStore")
            .field("base_url", &self.base_url)
            .field("service_role_key", &"<redacted>")
            .finish()
    }
}

/// Row shape of the `reports` table.
#[derive(Debug, Serialize, Deserialize)]
struct ReportRow {
    id: Uuid,
    dedupe_key: String,
    patient_id: Uuid,
    veterinarian_ids: Vec<Uuid>,
    source_filename: String,
    study_type: String,
    status: String,
    patient_name: String,
    species: String,
    veterinarian_names: String,
    primary_diagnosis: Option<String>,
    #[serde(default)]
    original_file_id: Option<String>,
    #[serde(default)]
    original_file_url: Option<String>,
    created_at: DateTime<Utc>,
    report: VeterinaryReport,
}

impl ReportRow {
    fn from_stored(stored: &StoredReport) -> Self {
        let r = &stored.report;
        Self {
            id: stored.id,
            dedupe_key: stored.dedupe_key.clone(),
            patient_id: stored.patient_id,
            veterinarian_ids: stored.veterinarian_ids.clone(),
            source_filename: r.source_filename.clone(),
            study_type: r.study_info.study_type.as_str().to_string(),
            status: r.status.as_str().to_string(),
            patient_name: r.patient.name.clone(),
            species: r.patient.species.clone(),
            veterinarian_names: r
                .veterinarians
                .iter()
                .map(|v| v.name.as_str())
                .collect::<Vec<_>>()
                .join("; "),
            primary_diagnosis: r.primary_diagnosis().map(str::to_string),
            original_file_id: r.original_file.as_ref().map(|f| f.id.clone()),
            original_file_url: r.original_file.as_ref().map(|f| f.url.clone()),
            created_at: r.created_at,
            report: r.clone(),
        }
    }

    fn into_stored(self) -> StoredReport {
        StoredReport {
            id: self.id,
            dedupe_key: self.dedupe_key,
            patient_id: self.patient_id,
            veterinarian_ids: self.veterinarian_ids,
            report: self.report,
        }
    }
}

/// Strip characters that carry meaning inside a PostgREST `or=(...)`
/// filter or an `ilike` pattern.
fn sanitise_term(term: &str) -> String {
    term.chars()
        .filter(|c| !matches!(c, ',' | '(' | ')' | '*' | '%' | '"' | '\\'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn search_filter(term: &str) -> String {
    let t = sanitise_term(term);
    format!(
        "(patient_name.ilike.*{t}*,veterinarian_names.ilike.*{t}*,primary_diagnosis.ilike.*{t}*)"
    )
}

/// Query string for a filtered, paged report listing.
fn list_params(filter: &ReportFilter) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("select", "*".to_string()),
        ("order", "created_at.desc".into()),
        ("limit", filter.limit().to_string()),
    ];
    if filter.offset() > 0 {
        params.push(("offset", filter.offset().to_string()));
    }
    if let Some(t) = filter.study_type {
        params.push(("study_type", format!("eq.{}", t.as_str())));
    }
    if let Some(s) = filter.status {
        params.push(("status", format!("eq.{}", s.as_str())));
    }
    if let Some(ref species) = filter.species {
        params.push(("species", format!("ilike.{}", sanitise_term(species))));
    }
    if let Some(ref vet) = filter.veterinarian {
        params.push((
            "veterinarian_names",
            format!("ilike.*{}*", sanitise_term(vet)),
        ));
    }
    params
}

impl PostgrestStore {
    pub fn new(base_url: impl Into<String>, service_role_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_role_key: service_role_key.into(),
        }
    }

    /// Read `SUPABASE_URL` and `SUPABASE_SERVICE_ROLE_KEY`.
    pub fn from_env() -> Result<Self, StoreError> {
        let base_url = std::env::var("SUPABASE_URL")
            .map_err(|_| StoreError::Transport("SUPABASE_URL not set".into()))?;
        let key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .map_err(|_| StoreError::Transport("SUPABASE_SERVICE_ROLE_KEY not set".into()))?;
        Ok(Self::new(base_url, key))
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorised(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, StoreError> {
        let resp = self
            .authorised(req)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let detail = resp.text().await.unwrap_or_default();
            return Err(StoreError::Backend { status, detail });
        }
        Ok(resp)
    }

    async fn rows<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<Vec<T>, StoreError> {
        self.send(req)
            .await?
            .json::<Vec<T>>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn find_by<T: DeserializeOwned>(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Option<T>, StoreError> {
        let req = self
            .client
            .get(self.table_url(table))
            .query(&[(column, format!("eq.{value}")), ("select", "*".into())])
            .query(&[("limit", "1")]);
        Ok(self.rows::<T>(req).await?.into_iter().next())
    }

    /// Insert `row` unless a row with the same `dedupe_key` exists; return
    /// whichever row is now stored.
    async fn insert_or_get<T>(
        &self,
        table: &'static str,
        dedupe_key: &str,
        row: &T,
    ) -> Result<Upserted<T>, StoreError>
    where
        T: Serialize + DeserializeOwned,
    {
        debug!("Upserting into {} (key '{}')", table, dedupe_key);
        let req = self
            .client
            .post(self.table_url(table))
            .query(&[("on_conflict", "dedupe_key")])
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(row);
        if let Some(inserted) = self.rows::<T>(req).await?.into_iter().next() {
            return Ok(Upserted {
                record: inserted,
                created: true,
            });
        }

        let existing = self
            .find_by::<T>(table, "dedupe_key", dedupe_key)
            .await?
            .ok_or_else(|| StoreError::Conflict {
                entity: table,
                key: dedupe_key.to_string(),
            })?;
        Ok(Upserted {
            record: existing,
            created: false,
        })
    }
}

#[async_trait]
impl ReportStore for PostgrestStore {
    async fn find_patient(&self, dedupe_key: &str) -> Result<Option<PatientRecord>, StoreError> {
        self.find_by(PATIENTS, "dedupe_key", dedupe_key).await
    }

    async fn insert_patient_or_get(
        &self,
        record: PatientRecord,
    ) -> Result<Upserted<PatientRecord>, StoreError> {
        self.insert_or_get(PATIENTS, &record.dedupe_key, &record).await
    }

    async fn find_veterinarian(
        &self,
        dedupe_key: &str,
    ) -> Result<Option<VeterinarianRecord>, StoreError> {
        self.find_by(VETERINARIANS, "dedupe_key", dedupe_key).await
    }

    async fn insert_veterinarian_or_get(
        &self,
        record: VeterinarianRecord,
    ) -> Result<Upserted<VeterinarianRecord>, StoreError> {
        self.insert_or_get(VETERINARIANS, &record.dedupe_key, &record)
            .await
    }

    async fn find_report(&self, dedupe_key: &str) -> Result<Option<StoredReport>, StoreError> {
        Ok(self
            .find_by::<ReportRow>(REPORTS, "dedupe_key", dedupe_key)
            .await?
            .map(ReportRow::into_stored))
    }

    async fn insert_report_or_get(
        &self,
        stored: StoredReport,
    ) -> Result<Upserted<StoredReport>, StoreError> {
        let row = ReportRow::from_stored(&stored);
        let up = self.insert_or_get(REPORTS, &row.dedupe_key, &row).await?;
        Ok(Upserted {
            record: up.record.into_stored(),
            created: up.created,
        })
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<StoredReport>, StoreError> {
        Ok(self
            .find_by::<ReportRow>(REPORTS, "id", &id.to_string())
            .await?
            .map(ReportRow::into_stored))
    }

    async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<StoredReport>, StoreError> {
        let req = self
            .client
            .get(self.table_url(REPORTS))
            .query(&list_params(filter));
        Ok(self
            .rows::<ReportRow>(req)
            .await?
            .into_iter()
            .map(ReportRow::into_stored)
            .collect())
    }

    async fn search_reports(
        &self,
        term: &str,
        limit: usize,
    ) -> Result<Vec<StoredReport>, StoreError> {
        let req = self.client.get(self.table_url(REPORTS)).query(&[
            ("select", "*".to_string()),
            ("or", search_filter(term)),
            ("order", "created_at.desc".into()),
            ("limit", limit.to_string()),
        ]);
        Ok(self
            .rows::<ReportRow>(req)
            .await?
            .into_iter()
            .map(ReportRow::into_stored)
            .collect())
    }

    async fn update_report(
        &self,
        id: Uuid,
        mut report: VeterinaryReport,
    ) -> Result<StoredReport, StoreError> {
        let current = self.get_report(id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "report",
            id: id.to_string(),
        })?;
        report.id = id;
        let updated = StoredReport { report, ..current };
        let row = ReportRow::from_stored(&updated);

        let req = self
            .client
            .patch(self.table_url(REPORTS))
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(&row);
        self.rows::<ReportRow>(req)
            .await?
            .into_iter()
            .next()
            .map(ReportRow::into_stored)
            .ok_or_else(|| StoreError::NotFound {
                entity: "report",
                id: id.to_string(),
            })
    }

    async fn delete_report(&self, id: Uuid) -> Result<(), StoreError> {
        let req = self
            .client
            .delete(self.table_url(REPORTS))
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation");
        let deleted = self.rows::<serde_json::Value>(req).await?;
        if deleted.is_empty() {
            return Err(StoreError::NotFound {
                entity: "report",
                id: id.to_string(),
            });
        }
        Ok(())
    }
}
