//! End-to-end catalog flows: create, sign, distribute, sweep.

use std::sync::Arc;

use avsig::app_state::AppState;
use avsig::audit::{read_entries, verify_chain, AuditTrail, ChangeKind, MemoryAuditSink};
use avsig::catalog::SignatureService;
use avsig::config::AvsigConfig;
use avsig::keys::{
    generate_signing_key, save_key_file, KeyProvider, PublicCertificate, StaticKeyProvider,
};
use avsig::manifest::{verify_header, verify_manifest_text, ManifestBuilder};
use avsig::model::{ObjectType, RecordDraft};
use avsig::record_encoder::{encode_all, encode_record};
use avsig::signer::RecordSigner;
use avsig::store::{MemoryRecordStore, RecordStore};
use avsig::sweep::VerificationSweep;
use figment::providers::{Format, Toml};
use tempfile::TempDir;

struct Harness {
    catalog: SignatureService,
    manifest: ManifestBuilder,
    sweep: VerificationSweep,
    store: Arc<MemoryRecordStore>,
    sink: Arc<MemoryAuditSink>,
    cert: PublicCertificate,
}

fn harness() -> Harness {
    let keys = StaticKeyProvider::generate();
    let cert = keys.load_public_certificate().unwrap();
    let signer = RecordSigner::new(Arc::new(keys));
    let store = Arc::new(MemoryRecordStore::new());
    let sink = Arc::new(MemoryAuditSink::new());
    let audit = AuditTrail::new(sink.clone());

    Harness {
        catalog: SignatureService::new(store.clone(), signer.clone(), audit.clone()),
        manifest: ManifestBuilder::new(signer.clone(), "AVSIG001"),
        sweep: VerificationSweep::new(store.clone(), signer, audit),
        store,
        sink,
        cert,
    }
}

fn draft(name: &str, body: &str) -> RecordDraft {
    RecordDraft {
        name: name.to_string(),
        object_type: Some(ObjectType::Pe),
        signature_prefix: Some("4D5A".to_string()),
        signature_body: Some(body.to_string()),
        offset_begin: Some(0),
        offset_end: Some(1024),
        description: None,
        ..Default::default()
    }
}

#[test]
fn scenario_a_record_signs_over_forty_bytes() {
    let h = harness();
    let record = h
        .catalog
        .create(
            RecordDraft {
                name: "Test.A".to_string(),
                object_type: Some(ObjectType::Pe),
                signature_prefix: Some("DEADBEEF".to_string()),
                signature_body: Some("AA".to_string()),
                offset_begin: Some(10),
                offset_end: Some(20),
                ..Default::default()
            },
            "admin",
        )
        .unwrap();

    let bytes = encode_record(&record);
    assert_eq!(bytes.len(), 40);
    assert_eq!(bytes[39], 0x00);
    assert!(h.catalog.signer().verify(&bytes, &record.record_signature));
}

#[test]
fn scenario_c_sweep_flags_only_the_corrupted_record() {
    let h = harness();
    for (name, body) in [("One", "01"), ("Two", "0202"), ("Three", "030303")] {
        h.catalog.create(draft(name, body), "admin").unwrap();
    }

    // Corrupt one byte of the second record in id order.
    let mut records = h.store.list_all().unwrap();
    let mut victim = records.remove(1);
    victim.record_signature[0] ^= 0xFF;
    h.store.compare_and_swap(&victim, victim.version).unwrap();

    let before_records = h.store.list_all().unwrap();
    let before_audit = h.sink.entries().unwrap().len();

    let report = h.sweep.run_sweep_once().unwrap().unwrap();
    assert_eq!((report.checked, report.ok, report.failed), (3, 2, 1));

    let entries = h.sink.entries().unwrap();
    let new: Vec<_> = entries[before_audit..].iter().collect();
    assert_eq!(new.len(), 3);
    let kinds: Vec<ChangeKind> = new.iter().map(|e| e.change_kind).collect();
    assert_eq!(
        kinds,
        vec![ChangeKind::VerifyOk, ChangeKind::VerifyFail, ChangeKind::VerifyOk]
    );
    assert_eq!(new[1].signature_id, victim.id);
    assert!(new.iter().all(|e| e.actor == "verifier" && e.new_snapshot.is_none()));

    assert_eq!(h.store.list_all().unwrap(), before_records);
}

#[test]
fn deleted_records_are_swept_but_not_distributed() {
    let h = harness();
    let keep = h.catalog.create(draft("Keep", "AA"), "admin").unwrap();
    let gone = h.catalog.create(draft("Gone", "BB"), "admin").unwrap();
    h.catalog.soft_delete(gone.id, "admin").unwrap();

    let doc = h.manifest.build_document(&h.catalog).unwrap();
    assert_eq!(doc.header.count, 1);
    assert_eq!(doc.records[0].id, keep.id);

    let report = h.sweep.run_sweep_once().unwrap().unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.ok, 2);
}

#[test]
fn bundle_parts_describe_the_same_snapshot() {
    let h = harness();
    for i in 0..5 {
        h.catalog
            .create(draft(&format!("Family.{i}"), &"AB".repeat(i + 1)), "admin")
            .unwrap();
    }

    let bundle = h.manifest.build_bundle(&h.catalog).unwrap();
    let lines = verify_manifest_text(&bundle.manifest_txt, &h.cert).unwrap();
    let active = h.catalog.list_active().unwrap();

    assert_eq!(lines.len(), 5);
    for (line, record) in lines.iter().zip(&active) {
        assert_eq!(line.id, record.id);
        assert_eq!(line.record_signature, record.record_signature);
    }
    assert_eq!(bundle.data_bin, encode_all(&active));

    // Each record's slice of data.bin verifies against its manifest line.
    let mut offset = 0;
    for (line, record) in lines.iter().zip(&active) {
        let len = encode_record(record).len();
        let slice = &bundle.data_bin[offset..offset + len];
        assert!(h.catalog.signer().verify(slice, &line.record_signature));
        offset += len;
    }
    assert_eq!(offset, bundle.data_bin.len());
}

#[test]
fn header_matches_catalog_and_resists_tampering() {
    let h = harness();
    h.catalog.create(draft("A", "AA"), "admin").unwrap();
    let b = h.catalog.create(draft("B", "BB"), "admin").unwrap();

    let doc = h.manifest.build_document(&h.catalog).unwrap();
    assert_eq!(doc.header.count, 2);
    assert_eq!(doc.header.release_date, h.catalog.release_date().unwrap());
    assert!(doc.header.release_date >= b.created_at);
    assert!(verify_header(&doc.header, &h.cert));

    let mut forged = doc.header.clone();
    forged.count = 3;
    assert!(!verify_header(&forged, &h.cert));
}

#[test]
fn concurrent_updates_on_one_version_yield_one_winner() {
    let h = harness();
    let record = h.catalog.create(draft("Race", "AA"), "admin").unwrap();
    let catalog = Arc::new(h.catalog);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let catalog = Arc::clone(&catalog);
            std::thread::spawn(move || {
                catalog.update(
                    record.id,
                    draft(&format!("Race.{i}"), "BB"),
                    0,
                    &format!("admin{i}"),
                )
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| r.as_ref().err().is_some_and(|e| e.is_conflict()))
        .count();

    assert_eq!(winners, 1);
    assert_eq!(conflicts, 7);

    let stored = catalog.get(record.id).unwrap();
    assert_eq!(stored.version, 1);
    catalog.signer().check_record(&stored).unwrap();
}

fn write_config(dir: &TempDir) -> AvsigConfig {
    let key_path = dir.path().join("keys").join("signing.json");
    save_key_file(&generate_signing_key(), &key_path, "test").unwrap();

    let toml = format!(
        concat!(
            "data_dir = {:?}\n",
            "audit_log_path = {:?}\n",
            "[keys]\n",
            "signing_key_path = {:?}\n",
            "[auth]\n",
            "jwt_secret = \"{}\"\n",
        ),
        dir.path().join("db"),
        dir.path().join("audit.jsonl"),
        key_path,
        "s".repeat(40),
    );
    let figment = AvsigConfig::figment(&dir.path().join("absent.toml")).merge(Toml::string(&toml));
    AvsigConfig::from_figment(figment).unwrap()
}

#[test]
fn sled_backed_state_persists_and_chains_audit() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let audit_path = config.audit_log_path.clone();

    let id = {
        let state = AppState::open(config.clone()).unwrap();
        let json = r#"[
            {"name":"Boot.A","signatureBody":"AABB"},
            {"name":"Boot.B","objectType":"JAVA"}
        ]"#;
        state.catalog.import_bootstrap(json, "bootstrap").unwrap();
        let created = state.catalog.create(draft("Live", "CC"), "admin").unwrap();
        state.sweep.run_sweep_once().unwrap();
        created.id
    };

    let state = AppState::open(config).unwrap();
    assert_eq!(state.catalog.list_all().unwrap().len(), 3);
    state.catalog.signer().check_record(&state.catalog.get(id).unwrap()).unwrap();

    let report = verify_chain(&audit_path).unwrap();
    assert!(report.is_intact());
    // 3 creates + 3 verification outcomes
    assert_eq!(report.entries, 6);
    let kinds: Vec<ChangeKind> = read_entries(&audit_path)
        .unwrap()
        .iter()
        .map(|e| e.change_kind)
        .collect();
    assert_eq!(kinds.iter().filter(|k| **k == ChangeKind::VerifyOk).count(), 3);

    let bundle = state.manifest.build_bundle(&state.catalog).unwrap();
    let cert = PublicCertificate::from_pem(&state.manifest.certificate_pem().unwrap()).unwrap();
    assert_eq!(verify_manifest_text(&bundle.manifest_txt, &cert).unwrap().len(), 3);
}
