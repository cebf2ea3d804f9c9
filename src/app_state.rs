use std::sync::Arc;

use crate::audit::{AuditTrail, JsonlAuditSink};
use crate::catalog::SignatureService;
use crate::config::AvsigConfig;
use crate::errors::AvResult;
use crate::keys::FileKeyProvider;
use crate::manifest::ManifestBuilder;
use crate::signer::RecordSigner;
use crate::store::UserDirectory;
use crate::store_sled::{open_db, SledRecordStore, SledTokenStore};
use crate::sweep::VerificationSweep;
use crate::tokens::{JwtService, RefreshTokenService};

/// Process-wide wiring of stores, keys and services.
///
/// The signing key is read once here and shared by every service.
pub struct AppState {
    pub config: AvsigConfig,
    pub catalog: SignatureService,
    pub manifest: ManifestBuilder,
    pub sweep: Arc<VerificationSweep>,
    db: sled::Db,
}

impl AppState {
    pub fn open(config: AvsigConfig) -> AvResult<Self> {
        let keys = Arc::new(FileKeyProvider::open(&config.keys.signing_key_path)?);
        let signer = RecordSigner::new(keys);

        let db = open_db(&config.data_dir)?;
        let records = Arc::new(SledRecordStore::new(&db)?);
        let audit = AuditTrail::new(Arc::new(JsonlAuditSink::open(&config.audit_log_path)?));

        let catalog = SignatureService::new(records.clone(), signer.clone(), audit.clone());
        let manifest = ManifestBuilder::new(signer.clone(), config.manifest.magic.clone());
        let sweep = Arc::new(VerificationSweep::new(records, signer, audit));

        tracing::info!(
            data_dir = %config.data_dir.display(),
            audit_log = %config.audit_log_path.display(),
            "Application state ready"
        );
        Ok(Self {
            config,
            catalog,
            manifest,
            sweep,
            db,
        })
    }

    /// Refresh-token service over the sled token tree.
    ///
    /// User accounts live outside this crate, so the caller supplies them.
    pub fn token_service(&self, users: Arc<dyn UserDirectory>) -> AvResult<RefreshTokenService> {
        let store = Arc::new(SledTokenStore::new(&self.db)?);
        let jwt = JwtService::from_config(&self.config.auth)?;
        Ok(RefreshTokenService::new(store, users, jwt))
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
