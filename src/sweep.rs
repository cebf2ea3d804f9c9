//! Periodic re-verification of stored record signatures
//!
//! A sweep walks every record (DELETED included), recomputes its canonical
//! bytes and checks the stored signature. Outcomes go to the audit trail as
//! VERIFY_OK or VERIFY_FAIL. Records are never modified here.

use std::future::Future;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use serde::Serialize;

use crate::audit::{AuditTrail, ChangeKind, VERIFIER_ACTOR};
use crate::errors::AvResult;
use crate::signer::RecordSigner;
use crate::store::RecordStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub ok: usize,
    pub failed: usize,
    /// Records without a stored signature.
    pub skipped: usize,
    /// Outcomes that could not be written to the audit trail.
    pub audit_errors: usize,
}

pub struct VerificationSweep {
    store: Arc<dyn RecordStore>,
    signer: RecordSigner,
    audit: AuditTrail,
    running: Mutex<()>,
}

impl VerificationSweep {
    pub fn new(store: Arc<dyn RecordStore>, signer: RecordSigner, audit: AuditTrail) -> Self {
        Self {
            store,
            signer,
            audit,
            running: Mutex::new(()),
        }
    }

    /// Run one pass. Returns `None` without doing anything if a pass is
    /// already in progress.
    pub fn run_sweep_once(&self) -> AvResult<Option<SweepReport>> {
        let _guard = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                tracing::debug!("Sweep already running, skipping");
                return Ok(None);
            }
            // A previous pass panicked; the guard protects no data.
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let mut report = SweepReport::default();
        for (id, decoded) in self.store.list_entries()? {
            let kind = match decoded {
                Ok(record) if !record.has_signature() => {
                    report.skipped += 1;
                    continue;
                }
                Ok(record) => {
                    report.checked += 1;
                    match self.signer.check_record(&record) {
                        Ok(()) => {
                            report.ok += 1;
                            ChangeKind::VerifyOk
                        }
                        Err(e) => {
                            report.failed += 1;
                            tracing::warn!(
                                %id,
                                name = %record.name,
                                error = %e,
                                "Signature verification failed"
                            );
                            ChangeKind::VerifyFail
                        }
                    }
                }
                Err(e) => {
                    report.checked += 1;
                    report.failed += 1;
                    tracing::warn!(%id, error = %e, "Stored record could not be decoded");
                    ChangeKind::VerifyFail
                }
            };

            if let Err(e) = self.audit.record(id, kind, VERIFIER_ACTOR, None, None) {
                report.audit_errors += 1;
                tracing::warn!(%id, error = %e, "Could not record verification outcome");
            }
        }

        tracing::info!(
            checked = report.checked,
            ok = report.ok,
            failed = report.failed,
            skipped = report.skipped,
            audit_errors = report.audit_errors,
            "Verification sweep complete"
        );
        Ok(Some(report))
    }

    /// Run a pass every `period` until `shutdown` resolves.
    ///
    /// The first pass starts immediately. Each pass runs on the blocking pool.
    pub async fn run_every<F>(self: Arc<Self>, period: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Sweep loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let sweep = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || sweep.run_sweep_once()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::error!(error = %e, "Verification sweep aborted"),
                        Err(e) => tracing::error!(error = %e, "Verification sweep task panicked"),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for VerificationSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationSweep").finish_non_exhaustive()
    }
}
