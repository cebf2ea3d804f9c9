//! Manifest signing keys
//!
//! The core never creates or stores key material on its own. It asks a
//! [`KeyProvider`] for the private key when signing and for the public
//! certificate when verifying. [`FileKeyProvider`] reads its key file once
//! at construction and serves the parsed key for the rest of the process,
//! so a disk hiccup after startup cannot turn into a signing failure.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// DER prefix of an Ed25519 SubjectPublicKeyInfo (RFC 8410).
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// Errors that can occur while loading or parsing keys
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Key signature error: {0}")]
    Signature(#[from] ed25519_dalek::SignatureError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Public key does not match private key in {0}")]
    PublicKeyMismatch(String),

    #[error("Key unavailable: {0}")]
    Unavailable(String),
}

/// Source of the process-wide signing identity.
pub trait KeyProvider: Send + Sync {
    fn load_private_key(&self) -> Result<SigningKey, KeyError>;

    fn load_public_certificate(&self) -> Result<PublicCertificate, KeyError>;
}

/// The public half handed to clients for pinning and used by the verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicCertificate {
    key: VerifyingKey,
}

impl PublicCertificate {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.key
    }

    pub fn public_key_b64(&self) -> String {
        B64.encode(self.key.to_bytes())
    }

    /// Hex SHA-256 over the raw public key bytes.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.key.to_bytes()))
    }

    /// `PUBLIC KEY` PEM block (SubjectPublicKeyInfo), wrapped at 64 columns.
    pub fn to_pem(&self) -> String {
        let mut der = Vec::with_capacity(ED25519_SPKI_PREFIX.len() + PUBLIC_KEY_LENGTH);
        der.extend_from_slice(&ED25519_SPKI_PREFIX);
        der.extend_from_slice(&self.key.to_bytes());

        let b64 = B64.encode(der);
        let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
        for chunk in b64.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(chunk));
            pem.push('\n');
        }
        pem.push_str("-----END PUBLIC KEY-----\n");
        pem
    }

    /// Parse a PEM block produced by [`PublicCertificate::to_pem`].
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let body: String = pem
            .lines()
            .filter(|line| !line.starts_with("-----"))
            .map(str::trim)
            .collect();
        let der = B64.decode(body)?;
        if der.len() != ED25519_SPKI_PREFIX.len() + PUBLIC_KEY_LENGTH
            || der[..ED25519_SPKI_PREFIX.len()] != ED25519_SPKI_PREFIX
        {
            return Err(KeyError::InvalidKeyLength(der.len()));
        }
        let mut raw = [0u8; PUBLIC_KEY_LENGTH];
        raw.copy_from_slice(&der[ED25519_SPKI_PREFIX.len()..]);
        Ok(Self::new(VerifyingKey::from_bytes(&raw)?))
    }
}

/// On-disk key file format
#[derive(Serialize, Deserialize)]
struct KeyData {
    /// Base64-encoded private key (32 bytes)
    private_key_b64: String,
    /// Base64-encoded public key (32 bytes)
    public_key_b64: String,
    /// Key generation timestamp
    created_at: String,
    /// Key purpose/description
    purpose: String,
}

/// Key provider backed by a JSON key file, read once.
#[derive(Debug)]
pub struct FileKeyProvider {
    path: PathBuf,
    signing_key: SigningKey,
}

impl FileKeyProvider {
    /// Load and validate the key file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, KeyError> {
        let path = path.as_ref().to_path_buf();
        let content = fs::read_to_string(&path)?;
        let key_data: KeyData = serde_json::from_str(&content)?;

        let signing_key = signing_key_from_b64(&key_data.private_key_b64)?;
        let expected_pk = B64.encode(signing_key.verifying_key().to_bytes());
        if expected_pk != key_data.public_key_b64 {
            return Err(KeyError::PublicKeyMismatch(path.display().to_string()));
        }

        tracing::info!(
            path = %path.display(),
            purpose = %key_data.purpose,
            "Loaded manifest signing key"
        );
        Ok(Self { path, signing_key })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyProvider for FileKeyProvider {
    fn load_private_key(&self) -> Result<SigningKey, KeyError> {
        Ok(self.signing_key.clone())
    }

    fn load_public_certificate(&self) -> Result<PublicCertificate, KeyError> {
        Ok(PublicCertificate::new(self.signing_key.verifying_key()))
    }
}

/// Key provider holding an in-memory key.
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    signing_key: SigningKey,
}

impl StaticKeyProvider {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Fresh random key; for tests and local tooling.
    pub fn generate() -> Self {
        Self::new(generate_signing_key())
    }
}

impl KeyProvider for StaticKeyProvider {
    fn load_private_key(&self) -> Result<SigningKey, KeyError> {
        Ok(self.signing_key.clone())
    }

    fn load_public_certificate(&self) -> Result<PublicCertificate, KeyError> {
        Ok(PublicCertificate::new(self.signing_key.verifying_key()))
    }
}

/// New random Ed25519 signing key.
pub fn generate_signing_key() -> SigningKey {
    let seed: [u8; SECRET_KEY_LENGTH] = rand::random();
    SigningKey::from_bytes(&seed)
}

/// Write `key` to `path` in the key file format, creating parent directories.
pub fn save_key_file<P: AsRef<Path>>(
    key: &SigningKey,
    path: P,
    purpose: &str,
) -> Result<(), KeyError> {
    let key_data = KeyData {
        private_key_b64: B64.encode(key.to_bytes()),
        public_key_b64: B64.encode(key.verifying_key().to_bytes()),
        created_at: chrono::Utc::now().to_rfc3339(),
        purpose: purpose.to_string(),
    };

    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(&key_data)?;
    fs::write(path, json)?;
    Ok(())
}

fn signing_key_from_b64(b64: &str) -> Result<SigningKey, KeyError> {
    let sk_bytes = B64.decode(b64)?;
    let sk_array: [u8; SECRET_KEY_LENGTH] = sk_bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::InvalidKeyLength(sk_bytes.len()))?;
    Ok(SigningKey::from_bytes(&sk_array))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn key_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join("signing.json");

        let key = generate_signing_key();
        save_key_file(&key, &path, "test").unwrap();

        let provider = FileKeyProvider::open(&path).unwrap();
        assert_eq!(provider.load_private_key().unwrap().to_bytes(), key.to_bytes());
        assert_eq!(
            provider.load_public_certificate().unwrap().verifying_key(),
            &key.verifying_key()
        );
    }

    #[test]
    fn provider_survives_key_file_removal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("signing.json");
        save_key_file(&generate_signing_key(), &path, "test").unwrap();

        let provider = FileKeyProvider::open(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert!(provider.load_private_key().is_ok());
    }

    #[test]
    fn tampered_public_key_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("signing.json");
        save_key_file(&generate_signing_key(), &path, "test").unwrap();

        let mut json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        json["public_key_b64"] = B64
            .encode(generate_signing_key().verifying_key().to_bytes())
            .into();
        fs::write(&path, json.to_string()).unwrap();

        assert!(matches!(
            FileKeyProvider::open(&path),
            Err(KeyError::PublicKeyMismatch(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let result = FileKeyProvider::open(dir.path().join("nope.json"));
        assert!(matches!(result, Err(KeyError::Io(_))));
    }

    #[test]
    fn pem_roundtrip() {
        let provider = StaticKeyProvider::generate();
        let cert = provider.load_public_certificate().unwrap();

        let pem = cert.to_pem();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----\n"));
        assert!(pem.ends_with("-----END PUBLIC KEY-----\n"));

        let parsed = PublicCertificate::from_pem(&pem).unwrap();
        assert_eq!(parsed, cert);
        assert_eq!(cert.fingerprint().len(), 64);
    }
}
