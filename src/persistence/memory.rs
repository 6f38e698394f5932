//! In-process [`ReportStore`] for tests and single-run CLI use.

use super::store::{
    PatientRecord, ReportFilter, ReportStore, StoredReport, Upserted, VeterinarianRecord,
};
use crate::error::StoreError;
use crate::report::VeterinaryReport;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    patients: HashMap<String, PatientRecord>,
    veterinarians: HashMap<String, VeterinarianRecord>,
    reports: HashMap<Uuid, StoredReport>,
    report_keys: HashMap<String, Uuid>,
}

/// Every table is keyed by its dedupe key, which gives the same uniqueness
/// guarantee as the unique indexes of the SQL schema.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn patient_count(&self) -> usize {
        self.tables.read().await.patients.len()
    }

    pub async fn veterinarian_count(&self) -> usize {
        self.tables.read().await.veterinarians.len()
    }

    pub async fn report_count(&self) -> usize {
        self.tables.read().await.reports.len()
    }
}

fn newest_first(mut rows: Vec<StoredReport>, offset: usize, limit: usize) -> Vec<StoredReport> {
    rows.sort_by(|a, b| b.report.created_at.cmp(&a.report.created_at));
    rows.into_iter().skip(offset).take(limit).collect()
}

#[async_trait]
impl ReportStore for MemoryStore {
    async fn find_patient(&self, dedupe_key: &str) -> Result<Option<PatientRecord>, StoreError> {
        Ok(self.tables.read().await.patients.get(dedupe_key).cloned())
    }

    async fn insert_patient_or_get(
        &self,
        record: PatientRecord,
    ) -> Result<Upserted<PatientRecord>, StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.patients.get(&record.dedupe_key) {
            return Ok(Upserted {
                record: existing.clone(),
                created: false,
            });
        }
        tables
            .patients
            .insert(record.dedupe_key.clone(), record.clone());
        Ok(Upserted {
            record,
            created: true,
        })
    }

    async fn find_veterinarian(
        &self,
        dedupe_key: &str,
    ) -> Result<Option<VeterinarianRecord>, StoreError> {
        Ok(self.tables.read().await.veterinarians.get(dedupe_key).cloned())
    }

    async fn insert_veterinarian_or_get(
        &self,
        record: VeterinarianRecord,
    ) -> Result<Upserted<VeterinarianRecord>, StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.veterinarians.get(&record.dedupe_key) {
            return Ok(Upserted {
                record: existing.clone(),
                created: false,
            });
        }
        tables
            .veterinarians
            .insert(record.dedupe_key.clone(), record.clone());
        Ok(Upserted {
            record,
            created: true,
        })
    }

    async fn find_report(&self, dedupe_key: &str) -> Result<Option<StoredReport>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .report_keys
            .get(dedupe_key)
            .and_then(|id| tables.reports.get(id))
            .cloned())
    }

    async fn insert_report_or_get(
        &self,
        stored: StoredReport,
    ) -> Result<Upserted<StoredReport>, StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .report_keys
            .get(&stored.dedupe_key)
            .and_then(|id| tables.reports.get(id))
        {
            return Ok(Upserted {
                record: existing.clone(),
                created: false,
            });
        }
        if tables.reports.contains_key(&stored.id) {
            return Err(StoreError::Conflict {
                entity: "report",
                key: stored.id.to_string(),
            });
        }
        tables
            .report_keys
            .insert(stored.dedupe_key.clone(), stored.id);
        tables.reports.insert(stored.id, stored.clone());
        Ok(Upserted {
            record: stored,
            created: true,
        })
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<StoredReport>, StoreError> {
        Ok(self.tables.read().await.reports.get(&id).cloned())
    }

    async fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<StoredReport>, StoreError> {
        let tables = self.tables.read().await;
        let rows = tables
            .reports
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        Ok(newest_first(rows, filter.offset(), filter.limit()))
    }

    async fn search_reports(
        &self,
        term: &str,
        limit: usize,
    ) -> Result<Vec<StoredReport>, StoreError> {
        let needle = term.trim().to_lowercase();
        let tables = self.tables.read().await;
        let rows = tables
            .reports
            .values()
            .filter(|r| r.matches_term(&needle))
            .cloned()
            .collect();
        Ok(newest_first(rows, 0, limit))
    }

    async fn update_report(
        &self,
        id: Uuid,
        mut report: VeterinaryReport,
    ) -> Result<StoredReport, StoreError> {
        let mut tables = self.tables.write().await;
        let stored = tables.reports.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "report",
            id: id.to_string(),
        })?;
        report.id = id;
        stored.report = report;
        Ok(stored.clone())
    }

    async fn delete_report(&self, id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let stored = tables.reports.remove(&id).ok_or_else(|| StoreError::NotFound {
            entity: "report",
            id: id.to_string(),
        })?;
        tables.report_keys.remove(&stored.dedupe_key);
        Ok(())
    }
}
