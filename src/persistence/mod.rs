//! Find-or-create persistence for patients, veterinarians and reports.
//!
//! ## Why two layers of deduplication?
//!
//! Both layers enforce the same matching keys (see [`store`]):
//!
//! - **Storage uniqueness.** Every table carries a unique `dedupe_key`, and
//!   [`ReportStore`] inserts are insert-or-return-existing. Two processes
//!   racing on the same document cannot create two rows.
//! - **Per-key serialisation.** [`KeyedLocks`] serialises the
//!   lookup-then-insert sequence for one key inside this process, so
//!   concurrent submissions of the same document do one write and one read
//!   instead of two conflicting writes.
//!
//! The three upserts are still not one transaction: a failure after the
//! patient upsert leaves that patient row in place. Retrying the same
//! document is safe because every step is idempotent.
//!
//! ## Placeholder policy
//!
//! When `create_placeholder_on_failure` is set, a failed patient or
//! veterinarian upsert links the report to a shared "Unidentified" entity
//! instead of failing. Each fallback is logged at `warn!` and returned in
//! [`SavedReport::warnings`].

mod memory;
mod postgrest;
pub mod store;

pub use memory::MemoryStore;
pub use postgrest::PostgrestStore;
pub use store::{
    patient_key, report_key, veterinarian_key, PatientRecord, ReportFilter, ReportStore,
    StoredReport, Upserted, VeterinarianRecord,
};

use crate::error::StoreError;
use crate::report::{Guardian, Patient, Veterinarian, VeterinaryReport};
use crate::upload::UploadedFile;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ── Keyed locks ──────────────────────────────────────────────────────────

/// Map of async mutexes, one per dedupe key.
///
/// Entries nobody holds are pruned whenever the map grows past
/// `prune_threshold`.
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    prune_threshold: usize,
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            prune_threshold: 1024,
        }
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() >= self.prune_threshold {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Repository ───────────────────────────────────────────────────────────

/// Outcome of [`ReportRepository::save_report`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedReport {
    pub report_id: Uuid,
    pub patient_id: Uuid,
    pub veterinarian_ids: Vec<Uuid>,
    /// False when the document had been stored before.
    pub created: bool,
    /// Placeholder fallbacks taken while saving.
    pub warnings: Vec<String>,
}

/// Find-or-create front end over a [`ReportStore`].
#[derive(Clone)]
pub struct ReportRepository {
    store: Arc<dyn ReportStore>,
    locks: Arc<KeyedLocks>,
    create_placeholder_on_failure: bool,
}

impl ReportRepository {
    pub fn new(store: Arc<dyn ReportStore>, create_placeholder_on_failure: bool) -> Self {
        Self {
            store,
            locks: Arc::new(KeyedLocks::new()),
            create_placeholder_on_failure,
        }
    }

    /// The underlying store, for the list/get/search/update/delete surface.
    pub fn store(&self) -> &Arc<dyn ReportStore> {
        &self.store
    }

    pub async fn upsert_patient(
        &self,
        patient: &Patient,
        guardian: &Guardian,
    ) -> Result<Upserted<PatientRecord>, StoreError> {
        self.upsert_patient_record(PatientRecord::from_report(patient, guardian))
            .await
    }

    async fn upsert_patient_record(
        &self,
        record: PatientRecord,
    ) -> Result<Upserted<PatientRecord>, StoreError> {
        let _guard = self.locks.lock(&format!("patient:{}", record.dedupe_key)).await;
        if let Some(existing) = self.store.find_patient(&record.dedupe_key).await? {
            debug!("Patient '{}' already stored as {}", existing.name, existing.id);
            return Ok(Upserted {
                record: existing,
                created: false,
            });
        }
        self.store.insert_patient_or_get(record).await
    }

    pub async fn upsert_veterinarian(
        &self,
        vet: &Veterinarian,
    ) -> Result<Upserted<VeterinarianRecord>, StoreError> {
        self.upsert_veterinarian_record(VeterinarianRecord::from_report(vet))
            .await
    }

    async fn upsert_veterinarian_record(
        &self,
        record: VeterinarianRecord,
    ) -> Result<Upserted<VeterinarianRecord>, StoreError> {
        let _guard = self.locks.lock(&format!("vet:{}", record.dedupe_key)).await;
        if let Some(existing) = self.store.find_veterinarian(&record.dedupe_key).await? {
            debug!("Veterinarian '{}' already stored as {}", existing.name, existing.id);
            return Ok(Upserted {
                record: existing,
                created: false,
            });
        }
        self.store.insert_veterinarian_or_get(record).await
    }

    async fn patient_or_placeholder(
        &self,
        report: &VeterinaryReport,
        warnings: &mut Vec<String>,
    ) -> Result<Uuid, StoreError> {
        match self.upsert_patient(&report.patient, &report.guardian).await {
            Ok(up) => Ok(up.record.id),
            Err(e) if self.create_placeholder_on_failure => {
                let msg = format!("patient upsert failed ({e}); linked to placeholder patient");
                warn!("{}", msg);
                warnings.push(msg);
                let up = self.upsert_patient_record(PatientRecord::placeholder()).await?;
                Ok(up.record.id)
            }
            Err(e) => Err(e),
        }
    }

    async fn veterinarians_or_placeholder(
        &self,
        report: &VeterinaryReport,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut ids = Vec::with_capacity(report.veterinarians.len());
        for vet in report
            .veterinarians
            .iter()
            .filter(|v| !v.name.trim().is_empty() || v.license_number.is_some())
        {
            let id = match self.upsert_veterinarian(vet).await {
                Ok(up) => up.record.id,
                Err(e) if self.create_placeholder_on_failure => {
                    let msg = format!(
                        "veterinarian '{}' upsert failed ({e}); linked to placeholder veterinarian",
                        vet.name
                    );
                    warn!("{}", msg);
                    warnings.push(msg);
                    self.upsert_veterinarian_record(VeterinarianRecord::placeholder())
                        .await?
                        .record
                        .id
                }
                Err(e) => return Err(e),
            };
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Upsert the patient and every signing veterinarian, then the report.
    ///
    /// A document already stored under the same (filename, study type) is
    /// returned as-is with `created: false`; no entity is touched.
    pub async fn save_report(&self, report: &VeterinaryReport) -> Result<SavedReport, StoreError> {
        let key = report_key(&report.source_filename, report.study_info.study_type);
        let _guard = self.locks.lock(&format!("report:{key}")).await;

        if let Some(existing) = self.store.find_report(&key).await? {
            info!(
                "'{}' was already ingested as report {}",
                report.source_filename, existing.id
            );
            return Ok(SavedReport {
                report_id: existing.id,
                patient_id: existing.patient_id,
                veterinarian_ids: existing.veterinarian_ids,
                created: false,
                warnings: Vec::new(),
            });
        }

        let mut warnings = Vec::new();
        let patient_id = self.patient_or_placeholder(report, &mut warnings).await?;
        let veterinarian_ids = self.veterinarians_or_placeholder(report, &mut warnings).await?;

        let stored = StoredReport::new(report.clone(), patient_id, veterinarian_ids);
        let up = self.store.insert_report_or_get(stored).await?;
        if up.created {
            info!(
                "Stored report {} (patient {}, {} veterinarian(s))",
                up.record.id,
                up.record.patient_id,
                up.record.veterinarian_ids.len()
            );
        }

        Ok(SavedReport {
            report_id: up.record.id,
            patient_id: up.record.patient_id,
            veterinarian_ids: up.record.veterinarian_ids,
            created: up.created,
            warnings,
        })
    }

    /// Record where the original document was uploaded on a stored report.
    ///
    /// Only the link changes; the stored body is otherwise kept as is.
    pub async fn link_original(
        &self,
        report_id: Uuid,
        file: &UploadedFile,
    ) -> Result<StoredReport, StoreError> {
        let _guard = self.locks.lock(&format!("link:{report_id}")).await;
        let Some(mut stored) = self.store.get_report(report_id).await? else {
            return Err(StoreError::NotFound {
                entity: "report",
                id: report_id.to_string(),
            });
        };
        stored.report.original_file = Some(file.clone());
        let updated = self.store.update_report(report_id, stored.report).await?;
        debug!("Report {} linked to uploaded file {}", report_id, file.id);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::StudyType;
    use async_trait::async_trait;
    use std::time::Duration;

    fn sample(filename: &str) -> VeterinaryReport {
        let mut r = VeterinaryReport::new(filename);
        r.study_info.study_type = StudyType::Radiograph;
        r.patient.name = "Luna".into();
        r.patient.species = "Canino".into();
        r.guardian.name = "Marta Ruiz".into();
        r.veterinarians = vec![
            Veterinarian {
                name: "Dra. Vega".into(),
                license_number: Some("MP-1234".into()),
                clinic: None,
            },
            Veterinarian {
                name: "Dr. Ortiz".into(),
                ..Default::default()
            },
        ];
        r
    }

    #[tokio::test]
    async fn resubmission_returns_the_same_report() {
        let store = Arc::new(MemoryStore::new());
        let repo = ReportRepository::new(store.clone(), false);

        let first = repo.save_report(&sample("rx.pdf")).await.unwrap();
        let second = repo.save_report(&sample("rx.pdf")).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.report_id, second.report_id);
        assert_eq!(store.report_count().await, 1);
        assert_eq!(store.patient_count().await, 1);
        assert_eq!(store.veterinarian_count().await, 2);
    }

    #[tokio::test]
    async fn concurrent_submissions_create_one_row_each() {
        let store = Arc::new(MemoryStore::new());
        let repo = ReportRepository::new(store.clone(), false);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.save_report(&sample("rx.pdf")).await })
            })
            .collect();
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().unwrap().report_id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.report_count().await, 1);
        assert_eq!(store.patient_count().await, 1);
    }

    #[tokio::test]
    async fn same_patient_different_study_shares_patient_row() {
        let store = Arc::new(MemoryStore::new());
        let repo = ReportRepository::new(store.clone(), false);
        let a = repo.save_report(&sample("rx.pdf")).await.unwrap();
        let mut eco = sample("rx.pdf");
        eco.study_info.study_type = StudyType::Ultrasound;
        let b = repo.save_report(&eco).await.unwrap();
        assert_ne!(a.report_id, b.report_id);
        assert_eq!(a.patient_id, b.patient_id);
    }

    /// Fails lookups for the chosen entity, except for its placeholder row.
    struct FailingUpserts {
        inner: MemoryStore,
        patients: bool,
        veterinarians: bool,
    }

    impl FailingUpserts {
        fn patients() -> Self {
            Self {
                inner: MemoryStore::new(),
                patients: true,
                veterinarians: false,
            }
        }

        fn veterinarians() -> Self {
            Self {
                inner: MemoryStore::new(),
                patients: false,
                veterinarians: true,
            }
        }
    }

    #[async_trait]
    impl ReportStore for FailingUpserts {
        async fn find_patient(&self, key: &str) -> Result<Option<PatientRecord>, StoreError> {
            if !self.patients || key.starts_with("unidentified patient") {
                return self.inner.find_patient(key).await;
            }
            Err(StoreError::Transport("connection reset".into()))
        }
        async fn insert_patient_or_get(
            &self,
            record: PatientRecord,
        ) -> Result<Upserted<PatientRecord>, StoreError> {
            self.inner.insert_patient_or_get(record).await
        }
        async fn find_veterinarian(
            &self,
            key: &str,
        ) -> Result<Option<VeterinarianRecord>, StoreError> {
            if !self.veterinarians || key == "name:unidentified veterinarian" {
                return self.inner.find_veterinarian(key).await;
            }
            Err(StoreError::Transport("connection reset".into()))
        }
        async fn insert_veterinarian_or_get(
            &self,
            record: VeterinarianRecord,
        ) -> Result<Upserted<VeterinarianRecord>, StoreError> {
            self.inner.insert_veterinarian_or_get(record).await
        }
        async fn find_report(&self, key: &str) -> Result<Option<StoredReport>, StoreError> {
            self.inner.find_report(key).await
        }
        async fn insert_report_or_get(
            &self,
            stored: StoredReport,
        ) -> Result<Upserted<StoredReport>, StoreError> {
            self.inner.insert_report_or_get(stored).await
        }
        async fn get_report(&self, id: Uuid) -> Result<Option<StoredReport>, StoreError> {
            self.inner.get_report(id).await
        }
        async fn list_reports(&self, f: &ReportFilter) -> Result<Vec<StoredReport>, StoreError> {
            self.inner.list_reports(f).await
        }
        async fn search_reports(
            &self,
            term: &str,
            limit: usize,
        ) -> Result<Vec<StoredReport>, StoreError> {
            self.inner.search_reports(term, limit).await
        }
        async fn update_report(
            &self,
            id: Uuid,
            report: VeterinaryReport,
        ) -> Result<StoredReport, StoreError> {
            self.inner.update_report(id, report).await
        }
        async fn delete_report(&self, id: Uuid) -> Result<(), StoreError> {
            self.inner.delete_report(id).await
        }
    }

    #[tokio::test]
    async fn patient_failure_is_fatal_without_placeholder_policy() {
        let repo = ReportRepository::new(
            Arc::new(FailingUpserts::patients()),
            false,
        );
        let err = repo.save_report(&sample("rx.pdf")).await.unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
    }

    #[tokio::test]
    async fn placeholder_policy_links_unidentified_patient() {
        let repo = ReportRepository::new(
            Arc::new(FailingUpserts::patients()),
            true,
        );
        let saved = repo.save_report(&sample("rx.pdf")).await.unwrap();
        assert!(saved.created);
        assert_eq!(saved.warnings.len(), 1);
        assert!(saved.warnings[0].contains("placeholder patient"));

        let stored = repo.store().get_report(saved.report_id).await.unwrap().unwrap();
        assert_eq!(stored.patient_id, saved.patient_id);
    }

    #[tokio::test]
    async fn veterinarian_failure_is_fatal_without_placeholder_policy() {
        let repo = ReportRepository::new(Arc::new(FailingUpserts::veterinarians()), false);
        let err = repo.save_report(&sample("rx.pdf")).await.unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
    }

    #[tokio::test]
    async fn placeholder_policy_links_unidentified_veterinarian() {
        let store = Arc::new(FailingUpserts::veterinarians());
        let repo = ReportRepository::new(store.clone(), true);
        let saved = repo.save_report(&sample("rx.pdf")).await.unwrap();

        assert!(saved.created);
        // One warning per signer; both collapse onto the shared placeholder.
        assert_eq!(saved.warnings.len(), 2);
        assert!(saved
            .warnings
            .iter()
            .all(|w| w.contains("placeholder veterinarian")));
        assert!(saved.warnings[0].contains("Dra. Vega"));
        assert_eq!(saved.veterinarian_ids.len(), 1);

        let placeholder = store
            .inner
            .find_veterinarian("name:unidentified veterinarian")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(placeholder.name, "Unidentified veterinarian");
        assert_eq!(saved.veterinarian_ids, vec![placeholder.id]);
        assert_eq!(store.inner.veterinarian_count().await, 1);
    }

    #[tokio::test]
    async fn link_original_keeps_the_stored_body() {
        let store = Arc::new(MemoryStore::new());
        let repo = ReportRepository::new(store.clone(), false);
        let saved = repo.save_report(&sample("rx.pdf")).await.unwrap();

        let file = UploadedFile {
            id: "file-9".into(),
            name: "rx.pdf".into(),
            url: "https://drive.google.com/file/d/file-9/view".into(),
            container_id: "folder-1".into(),
        };
        let linked = repo.link_original(saved.report_id, &file).await.unwrap();
        assert_eq!(linked.report.original_file.as_ref(), Some(&file));
        assert_eq!(linked.report.patient.name, "Luna");
        assert_eq!(linked.patient_id, saved.patient_id);

        let err = repo.link_original(Uuid::new_v4(), &file).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn keyed_locks_serialise_same_key() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("a").await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock("a").await;
            })
        };
        // A different key is not blocked.
        let _other = locks.lock("b").await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn keyed_locks_prune_released_entries() {
        let locks = KeyedLocks {
            locks: Mutex::new(HashMap::new()),
            prune_threshold: 4,
        };
        tokio_test::block_on(async {
            for i in 0..4 {
                drop(locks.lock(&format!("k{i}")).await);
            }
            let _held = locks.lock("k-new").await;
        });
        assert_eq!(locks.len(), 1);
    }
}
