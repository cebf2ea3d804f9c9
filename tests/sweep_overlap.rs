//! A sweep started while another is in flight must return immediately.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use avsig::audit::{AuditEntry, AuditSink, AuditTrail};
use avsig::errors::AvResult;
use avsig::keys::StaticKeyProvider;
use avsig::model::{RecordDraft, SignatureRecord};
use avsig::signer::RecordSigner;
use avsig::store::{MemoryRecordStore, RecordStore};
use avsig::sweep::VerificationSweep;
use chrono::Utc;
use uuid::Uuid;

/// Blocks on the first append until released.
struct GateSink {
    entered: Mutex<Option<Sender<()>>>,
    release: Mutex<Receiver<()>>,
}

impl AuditSink for GateSink {
    fn append(&self, _entry: &AuditEntry) -> AvResult<()> {
        if let Some(tx) = self.entered.lock().unwrap().take() {
            tx.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        Ok(())
    }
}

#[test]
fn overlapping_sweep_is_skipped() {
    let signer = RecordSigner::new(Arc::new(StaticKeyProvider::generate()));
    let store = Arc::new(MemoryRecordStore::new());
    let mut record = SignatureRecord::from_draft(
        Uuid::new_v4(),
        RecordDraft {
            name: "Slow.A".to_string(),
            ..Default::default()
        },
        Utc::now(),
    );
    record.record_signature = signer.sign_record(&record).unwrap();
    store.insert(&record).unwrap();

    let (entered_tx, entered_rx) = channel();
    let (release_tx, release_rx) = channel();
    let sink = GateSink {
        entered: Mutex::new(Some(entered_tx)),
        release: Mutex::new(release_rx),
    };
    let sweep = Arc::new(VerificationSweep::new(
        store,
        signer,
        AuditTrail::new(Arc::new(sink)),
    ));

    let first = {
        let sweep = Arc::clone(&sweep);
        std::thread::spawn(move || sweep.run_sweep_once())
    };
    entered_rx.recv().unwrap();

    assert_eq!(sweep.run_sweep_once().unwrap(), None);

    release_tx.send(()).unwrap();
    let report = first.join().unwrap().unwrap().unwrap();
    assert_eq!(report.ok, 1);

    // Once the first pass is done the next one runs normally.
    assert!(sweep.run_sweep_once().unwrap().is_some());
}
