//! Signature catalog service
//!
//! The only writer of [`SignatureRecord`]. Every path that changes an
//! encoded field signs the new canonical bytes before the store sees the
//! record, so an ACTIVE record on disk always carries a signature over its
//! current contents. A signing failure aborts the write.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::audit::{AuditTrail, ChangeKind};
use crate::errors::{AvError, AvResult};
use crate::model::{RecordDraft, RecordStatus, SignatureRecord};
use crate::signer::RecordSigner;
use crate::store::RecordStore;

/// Attempts per record before `resign_all` gives up on a busy record.
const RESIGN_ATTEMPTS: usize = 3;

/// One element of a bootstrap import file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportItem {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(flatten)]
    pub draft: RecordDraft,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported(usize),
    /// The store already held records; nothing was written.
    Skipped { existing: usize },
}

#[derive(Clone)]
pub struct SignatureService {
    store: Arc<dyn RecordStore>,
    signer: RecordSigner,
    audit: AuditTrail,
}

impl SignatureService {
    pub fn new(store: Arc<dyn RecordStore>, signer: RecordSigner, audit: AuditTrail) -> Self {
        Self {
            store,
            signer,
            audit,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn signer(&self) -> &RecordSigner {
        &self.signer
    }

    pub fn create(&self, draft: RecordDraft, actor: &str) -> AvResult<SignatureRecord> {
        draft.validate()?;

        let mut record = SignatureRecord::from_draft(Uuid::new_v4(), draft, Utc::now());
        record.record_signature = self.signer.sign_record(&record)?;
        let saved = self.store.insert(&record)?;

        self.audit
            .record(saved.id, ChangeKind::Create, actor, None, Some(saved.snapshot()?))?;
        tracing::info!(id = %saved.id, name = %saved.name, actor, "Signature created");
        Ok(saved)
    }

    /// Replace the editable fields of `id`, re-sign, and bump the version.
    ///
    /// `expected_version` is the version the caller last read. If the stored
    /// record has moved on, nothing is written and `Conflict` is returned.
    pub fn update(
        &self,
        id: Uuid,
        draft: RecordDraft,
        expected_version: u64,
        actor: &str,
    ) -> AvResult<SignatureRecord> {
        draft.validate()?;

        let current = self.get(id)?;
        if current.version != expected_version {
            tracing::warn!(
                %id,
                expected_version,
                actual = current.version,
                "Stale update rejected"
            );
            return Err(AvError::conflict("signature", id.to_string(), expected_version));
        }
        let old_snapshot = current.snapshot()?;

        let mut record = current;
        record.apply(draft);
        record.status = RecordStatus::Active;
        record.updated_at = Utc::now();
        record.record_signature = self.signer.sign_record(&record)?;

        let saved = self
            .store
            .compare_and_swap(&record, expected_version)
            .inspect_err(|e| {
                if e.is_conflict() {
                    tracing::warn!(%id, expected_version, "Concurrent update lost the race");
                }
            })?;

        self.audit.record(
            saved.id,
            ChangeKind::Update,
            actor,
            Some(old_snapshot),
            Some(saved.snapshot()?),
        )?;
        tracing::info!(%id, version = saved.version, actor, "Signature updated");
        Ok(saved)
    }

    /// Mark `id` DELETED. The row and its signature stay for history.
    pub fn soft_delete(&self, id: Uuid, actor: &str) -> AvResult<SignatureRecord> {
        let current = self.get(id)?;
        let old_snapshot = current.snapshot()?;
        let expected_version = current.version;

        let mut record = current;
        record.status = RecordStatus::Deleted;
        record.updated_at = Utc::now();
        let saved = self.store.compare_and_swap(&record, expected_version)?;

        self.audit.record(
            saved.id,
            ChangeKind::Delete,
            actor,
            Some(old_snapshot),
            Some(saved.snapshot()?),
        )?;
        tracing::info!(%id, actor, "Signature soft-deleted");
        Ok(saved)
    }

    pub fn get(&self, id: Uuid) -> AvResult<SignatureRecord> {
        self.store
            .find_by_id(id)?
            .ok_or_else(|| AvError::not_found("signature", id.to_string()))
    }

    /// ACTIVE records in ascending id order; the manifest snapshot.
    pub fn list_active(&self) -> AvResult<Vec<SignatureRecord>> {
        self.store.find_by_status(RecordStatus::Active)
    }

    pub fn list_all(&self) -> AvResult<Vec<SignatureRecord>> {
        self.store.list_all()
    }

    /// Non-deleted records updated within `[from, to]`.
    pub fn find_updated_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AvResult<Vec<SignatureRecord>> {
        if from > to {
            return Err(AvError::validation("from", "range start is after range end"));
        }
        Ok(self
            .store
            .find_by_updated_range(from, to)?
            .into_iter()
            .filter(|r| r.status != RecordStatus::Deleted)
            .collect())
    }

    /// Latest `updated_at` among ACTIVE records, or now when there are none.
    pub fn release_date(&self) -> AvResult<DateTime<Utc>> {
        Ok(release_date_of(&self.list_active()?))
    }

    /// Re-sign every stored record, DELETED included. Returns how many were signed.
    ///
    /// Used after a key rotation. Field values and timestamps are untouched.
    pub fn resign_all(&self) -> AvResult<usize> {
        let mut signed = 0;
        for record in self.store.list_all()? {
            self.resign_one(record)?;
            signed += 1;
        }
        tracing::info!(count = signed, "Re-signed all signatures");
        Ok(signed)
    }

    fn resign_one(&self, mut record: SignatureRecord) -> AvResult<()> {
        for _ in 0..RESIGN_ATTEMPTS {
            let expected_version = record.version;
            record.record_signature = self.signer.sign_record(&record)?;
            match self.store.compare_and_swap(&record, expected_version) {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    record = self.get(record.id)?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(AvError::conflict("signature", record.id.to_string(), record.version))
    }

    /// Seed an empty catalog from a JSON array of records.
    ///
    /// Skipped entirely when the store already holds anything. Every item is
    /// validated before the first insert, then stored ACTIVE and signed.
    pub fn import_bootstrap(&self, json: &str, actor: &str) -> AvResult<ImportOutcome> {
        let existing = self.store.count()?;
        if existing > 0 {
            tracing::info!(existing, "Signatures already present, skipping bootstrap");
            return Ok(ImportOutcome::Skipped { existing });
        }

        let items: Vec<ImportItem> = serde_json::from_str(json)
            .map_err(|e| AvError::serialization("bootstrap import", e))?;
        let mut ids = HashSet::with_capacity(items.len());
        for item in &items {
            item.draft.validate()?;
            if let Some(id) = item.id {
                if !ids.insert(id) {
                    return Err(AvError::validation("id", format!("duplicate id {id}")));
                }
                if self.store.find_by_id(id)?.is_some() {
                    return Err(AvError::validation("id", format!("id {id} already stored")));
                }
            }
        }

        let now = Utc::now();
        for item in &items {
            let id = item.id.unwrap_or_else(|| fresh_id(&ids));
            let mut record = SignatureRecord::from_draft(id, item.draft.clone(), now);
            record.record_signature = self.signer.sign_record(&record)?;
            let saved = self.store.insert(&record)?;
            self.audit
                .record(saved.id, ChangeKind::Create, actor, None, Some(saved.snapshot()?))?;
        }

        tracing::info!(count = items.len(), actor, "Bootstrap import complete");
        Ok(ImportOutcome::Imported(items.len()))
    }

    /// Pretty JSON array of the ACTIVE records.
    pub fn export_json(&self) -> AvResult<String> {
        serde_json::to_string_pretty(&self.list_active()?)
            .map_err(|e| AvError::serialization("export signatures", e))
    }
}

impl std::fmt::Debug for SignatureService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureService").finish_non_exhaustive()
    }
}

/// Random id not among the explicit ids of an import file.
fn fresh_id(taken: &HashSet<Uuid>) -> Uuid {
    loop {
        let id = Uuid::new_v4();
        if !taken.contains(&id) {
            return id;
        }
    }
}

/// Release date of a snapshot: its latest `updated_at`, or now if empty.
pub fn release_date_of(records: &[SignatureRecord]) -> DateTime<Utc> {
    records
        .iter()
        .map(|r| r.updated_at)
        .max()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::keys::{KeyError, KeyProvider, PublicCertificate, StaticKeyProvider};
    use crate::model::ObjectType;
    use crate::store::MemoryRecordStore;
    use ed25519_dalek::SigningKey;

    struct Fixture {
        service: SignatureService,
        store: Arc<MemoryRecordStore>,
        sink: Arc<MemoryAuditSink>,
    }

    fn fixture_with(keys: Arc<dyn KeyProvider>) -> Fixture {
        let store = Arc::new(MemoryRecordStore::new());
        let sink = Arc::new(MemoryAuditSink::new());
        let service = SignatureService::new(
            store.clone(),
            RecordSigner::new(keys),
            AuditTrail::new(sink.clone()),
        );
        Fixture {
            service,
            store,
            sink,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(StaticKeyProvider::generate()))
    }

    fn draft(name: &str) -> RecordDraft {
        RecordDraft {
            name: name.to_string(),
            object_type: Some(ObjectType::Pe),
            signature_prefix: Some("4D5A".to_string()),
            signature_body: Some("CAFEBABE".to_string()),
            offset_begin: Some(0),
            offset_end: Some(64),
            ..Default::default()
        }
    }

    struct NoKeys;

    impl KeyProvider for NoKeys {
        fn load_private_key(&self) -> Result<SigningKey, KeyError> {
            Err(KeyError::Unavailable("hsm offline".into()))
        }

        fn load_public_certificate(&self) -> Result<PublicCertificate, KeyError> {
            Err(KeyError::Unavailable("hsm offline".into()))
        }
    }

    #[test]
    fn create_signs_and_audits() {
        let f = fixture();
        let r = f.service.create(draft("Trojan.A"), "admin").unwrap();

        assert!(r.is_active());
        assert_eq!(r.version, 0);
        f.service.signer().check_record(&r).unwrap();

        let entries = f.sink.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].change_kind, ChangeKind::Create);
        assert!(entries[0].old_snapshot.is_none());
        assert!(entries[0].new_snapshot.as_deref().unwrap().contains("Trojan.A"));
    }

    #[test]
    fn invalid_draft_writes_nothing() {
        let f = fixture();
        let mut d = draft("Bad");
        d.signature_body = Some("XYZ".to_string());

        assert!(matches!(
            f.service.create(d, "admin"),
            Err(AvError::Validation { .. })
        ));
        assert_eq!(f.store.count().unwrap(), 0);
        assert!(f.sink.entries().unwrap().is_empty());
    }

    #[test]
    fn signing_failure_persists_nothing() {
        let f = fixture_with(Arc::new(NoKeys));
        assert!(matches!(
            f.service.create(draft("A"), "admin"),
            Err(AvError::Crypto { .. })
        ));
        assert_eq!(f.store.count().unwrap(), 0);
    }

    #[test]
    fn update_resigns_and_bumps_version() {
        let f = fixture();
        let r = f.service.create(draft("A"), "admin").unwrap();

        let mut d = draft("A");
        d.signature_body = Some("00FF".to_string());
        let updated = f.service.update(r.id, d, 0, "admin").unwrap();

        assert_eq!(updated.version, 1);
        assert_ne!(updated.record_signature, r.record_signature);
        f.service.signer().check_record(&updated).unwrap();

        let entries = f.sink.entries().unwrap();
        assert_eq!(entries[1].change_kind, ChangeKind::Update);
        assert!(entries[1].old_snapshot.as_deref().unwrap().contains("CAFEBABE"));
    }

    #[test]
    fn stale_update_conflicts() {
        let f = fixture();
        let r = f.service.create(draft("A"), "admin").unwrap();
        f.service.update(r.id, draft("B"), 0, "admin").unwrap();

        let err = f.service.update(r.id, draft("C"), 0, "admin").unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(f.service.get(r.id).unwrap().name, "B");
    }

    #[test]
    fn update_unknown_id_is_not_found() {
        let f = fixture();
        let err = f.service.update(Uuid::new_v4(), draft("A"), 0, "admin").unwrap_err();
        assert!(matches!(err, AvError::NotFound { .. }));
    }

    #[test]
    fn update_reactivates_deleted_record() {
        let f = fixture();
        let r = f.service.create(draft("A"), "admin").unwrap();
        let deleted = f.service.soft_delete(r.id, "admin").unwrap();
        assert_eq!(deleted.status, RecordStatus::Deleted);
        assert!(f.service.list_active().unwrap().is_empty());

        let back = f.service.update(r.id, draft("A"), deleted.version, "admin").unwrap();
        assert!(back.is_active());
    }

    #[test]
    fn soft_delete_keeps_row_and_audits() {
        let f = fixture();
        let r = f.service.create(draft("A"), "admin").unwrap();
        f.service.soft_delete(r.id, "admin").unwrap();

        assert_eq!(f.service.list_all().unwrap().len(), 1);
        let kinds: Vec<ChangeKind> = f
            .sink
            .entries()
            .unwrap()
            .iter()
            .map(|e| e.change_kind)
            .collect();
        assert_eq!(kinds, vec![ChangeKind::Create, ChangeKind::Delete]);
    }

    #[test]
    fn updated_range_excludes_deleted() {
        let f = fixture();
        let start = Utc::now() - chrono::Duration::seconds(1);
        let a = f.service.create(draft("A"), "admin").unwrap();
        let b = f.service.create(draft("B"), "admin").unwrap();
        f.service.soft_delete(b.id, "admin").unwrap();
        let end = Utc::now() + chrono::Duration::seconds(1);

        let hits = f.service.find_updated_between(start, end).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, a.id);

        assert!(f.service.find_updated_between(end, start).is_err());
    }

    #[test]
    fn release_date_is_latest_active_update() {
        let f = fixture();
        let a = f.service.create(draft("A"), "admin").unwrap();
        let b = f.service.create(draft("B"), "admin").unwrap();
        assert_eq!(f.service.release_date().unwrap(), a.updated_at.max(b.updated_at));
    }

    #[test]
    fn resign_all_covers_deleted_records() {
        let f = fixture();
        let a = f.service.create(draft("A"), "admin").unwrap();
        f.service.create(draft("B"), "admin").unwrap();
        f.service.soft_delete(a.id, "admin").unwrap();

        assert_eq!(f.service.resign_all().unwrap(), 2);
        for r in f.service.list_all().unwrap() {
            f.service.signer().check_record(&r).unwrap();
        }
    }

    #[test]
    fn bootstrap_import_then_skip() {
        let f = fixture();
        let id = Uuid::new_v4();
        let json = format!(
            r#"[{{"id":"{id}","name":"Boot.A","objectType":"JAVA","signatureBody":"AABB"}},
                {{"name":"Boot.B"}}]"#
        );

        assert_eq!(
            f.service.import_bootstrap(&json, "bootstrap").unwrap(),
            ImportOutcome::Imported(2)
        );
        let a = f.service.get(id).unwrap();
        assert_eq!(a.object_type, Some(ObjectType::Java));
        f.service.signer().check_record(&a).unwrap();

        assert_eq!(
            f.service.import_bootstrap(&json, "bootstrap").unwrap(),
            ImportOutcome::Skipped { existing: 2 }
        );
    }

    #[test]
    fn bootstrap_with_repeated_id_writes_nothing() {
        let f = fixture();
        let id = Uuid::new_v4();
        let json = format!(r#"[{{"id":"{id}","name":"A"}},{{"id":"{id}","name":"B"}}]"#);

        let err = f.service.import_bootstrap(&json, "bootstrap").unwrap_err();
        assert!(matches!(err, AvError::Validation { ref field, .. } if field == "id"));
        assert_eq!(f.store.count().unwrap(), 0);
        assert!(f.sink.entries().unwrap().is_empty());

        // A corrected file still imports.
        let fixed = format!(r#"[{{"id":"{id}","name":"A"}},{{"name":"B"}}]"#);
        assert_eq!(
            f.service.import_bootstrap(&fixed, "bootstrap").unwrap(),
            ImportOutcome::Imported(2)
        );
    }

    #[test]
    fn export_lists_only_active() {
        let f = fixture();
        f.service.create(draft("Keep"), "admin").unwrap();
        let gone = f.service.create(draft("Gone"), "admin").unwrap();
        f.service.soft_delete(gone.id, "admin").unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&f.service.export_json().unwrap()).unwrap();
        let items = json.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["name"], "Keep");
    }
}
