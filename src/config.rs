//! Runtime configuration
//!
//! Layered with figment: built-in defaults, then `avsig.toml` (or the file
//! named by `AVSIG_CONFIG`), then `AVSIG_*` environment variables. Nested
//! keys use a double underscore, e.g. `AVSIG_AUTH__JWT_SECRET`.

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::errors::{AvError, AvResult};
use crate::tokens::{MAX_TOKEN_TTL_SECS, MIN_SECRET_LEN};

pub const DEFAULT_CONFIG_FILE: &str = "avsig.toml";
pub const CONFIG_PATH_ENV: &str = "AVSIG_CONFIG";
pub const ENV_PREFIX: &str = "AVSIG_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvsigConfig {
    pub data_dir: PathBuf,
    pub audit_log_path: PathBuf,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub keys: KeyConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    #[serde(default = "default_magic")]
    pub magic: String,
}

fn default_magic() -> String {
    "AVSIG001".to_string()
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            magic: default_magic(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(default = "default_signing_key_path")]
    pub signing_key_path: PathBuf,
}

fn default_signing_key_path() -> PathBuf {
    PathBuf::from("keys/manifest_signing_key.json")
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            signing_key_path: default_signing_key_path(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: u64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_secs: u64,
}

fn default_access_ttl() -> u64 {
    15 * 60
}

fn default_refresh_ttl() -> u64 {
    14 * 24 * 60 * 60
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    300
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

/// Defaults for everything except the secret, which has none.
#[derive(Serialize)]
struct AvsigConfigDefaults {
    data_dir: PathBuf,
    audit_log_path: PathBuf,
    manifest: ManifestConfig,
    keys: KeyConfig,
    sweep: SweepConfig,
}

impl AvsigConfig {
    /// Provider stack: defaults, then the TOML file at `path`, then env.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AvsigConfigDefaults {
            data_dir: PathBuf::from("data/avsig"),
            audit_log_path: PathBuf::from("data/audit.jsonl"),
            manifest: ManifestConfig::default(),
            keys: KeyConfig::default(),
            sweep: SweepConfig::default(),
        }))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).ignore(&["CONFIG"]).split("__"))
    }

    pub fn from_figment(figment: Figment) -> AvResult<Self> {
        let config: AvsigConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or from `AVSIG_CONFIG`, or from `avsig.toml`.
    pub fn load(path: Option<&Path>) -> AvResult<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => std::env::var_os(CONFIG_PATH_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE)),
        };
        Self::from_figment(Self::figment(&path))
    }

    pub fn validate(&self) -> AvResult<()> {
        if self.auth.jwt_secret.trim().len() < MIN_SECRET_LEN {
            return Err(AvError::config(format!(
                "auth.jwt_secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if self.auth.access_ttl_secs == 0 || self.auth.refresh_ttl_secs == 0 {
            return Err(AvError::config("auth token lifetimes must be positive"));
        }
        if self.auth.access_ttl_secs > MAX_TOKEN_TTL_SECS
            || self.auth.refresh_ttl_secs > MAX_TOKEN_TTL_SECS
        {
            return Err(AvError::config(format!(
                "auth token lifetimes must not exceed {MAX_TOKEN_TTL_SECS} seconds"
            )));
        }
        if self.manifest.magic.is_empty() || !self.manifest.magic.is_ascii() {
            return Err(AvError::config("manifest.magic must be non-empty ASCII"));
        }
        if self.manifest.magic.contains('|') {
            return Err(AvError::config("manifest.magic must not contain '|'"));
        }
        if self.sweep.interval_secs == 0 {
            return Err(AvError::config("sweep.interval_secs must be positive"));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(AvError::config("data_dir cannot be empty"));
        }
        Ok(())
    }

    /// Effective configuration as TOML, with the secret masked.
    pub fn to_redacted_toml(&self) -> AvResult<String> {
        let mut shown = self.clone();
        shown.auth.jwt_secret = "<redacted>".to_string();
        toml::to_string_pretty(&shown)
            .map_err(|e| AvError::config(format!("cannot render config: {e}")))
    }
}
