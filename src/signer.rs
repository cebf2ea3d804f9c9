//! Record and manifest signing
//!
//! `RecordSigner` pairs the key provider with the Ed25519 primitive. Verification
//! never fails loudly: [`RecordSigner::verify`] is a plain bool, and
//! [`RecordSigner::check`] exists for callers that want the reason in logs.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ed25519_dalek::{Signature, Signer, Verifier};

use crate::errors::{AvError, AvResult};
use crate::keys::{KeyProvider, PublicCertificate};
use crate::model::SignatureRecord;
use crate::record_encoder::encode_record;

#[derive(Clone)]
pub struct RecordSigner {
    keys: Arc<dyn KeyProvider>,
}

impl RecordSigner {
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self { keys }
    }

    pub fn certificate(&self) -> AvResult<PublicCertificate> {
        Ok(self.keys.load_public_certificate()?)
    }

    /// Sign raw bytes with the private key.
    pub fn sign(&self, data: &[u8]) -> AvResult<Vec<u8>> {
        let key = self.keys.load_private_key()?;
        Ok(key.sign(data).to_bytes().to_vec())
    }

    /// Verify `signature` over `data`, surfacing the failure reason.
    pub fn check(&self, data: &[u8], signature: &[u8]) -> AvResult<()> {
        let cert = self.keys.load_public_certificate()?;
        let sig = Signature::from_slice(signature)
            .map_err(|e| AvError::crypto(format!("malformed signature: {e}")))?;
        cert.verifying_key()
            .verify(data, &sig)
            .map_err(|_| AvError::crypto("signature mismatch"))
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        self.check(data, signature).is_ok()
    }

    /// Base64 signature over the UTF-8 bytes of `text`.
    pub fn sign_text_b64(&self, text: &str) -> AvResult<String> {
        Ok(B64.encode(self.sign(text.as_bytes())?))
    }

    pub fn verify_text_b64(&self, text: &str, signature_b64: &str) -> bool {
        match B64.decode(signature_b64) {
            Ok(sig) => self.verify(text.as_bytes(), &sig),
            Err(_) => false,
        }
    }

    /// Signature over the record's current canonical bytes.
    pub fn sign_record(&self, record: &SignatureRecord) -> AvResult<Vec<u8>> {
        self.sign(&encode_record(record))
    }

    pub fn check_record(&self, record: &SignatureRecord) -> AvResult<()> {
        self.check(&encode_record(record), &record.record_signature)
    }
}

impl std::fmt::Debug for RecordSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSigner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyError, StaticKeyProvider};
    use ed25519_dalek::SigningKey;

    fn signer() -> RecordSigner {
        RecordSigner::new(Arc::new(StaticKeyProvider::generate()))
    }

    struct NoKeys;

    impl KeyProvider for NoKeys {
        fn load_private_key(&self) -> Result<SigningKey, KeyError> {
            Err(KeyError::Unavailable("keystore offline".into()))
        }

        fn load_public_certificate(&self) -> Result<PublicCertificate, KeyError> {
            Err(KeyError::Unavailable("keystore offline".into()))
        }
    }

    #[test]
    fn sign_then_verify() {
        let s = signer();
        let data = b"canonical bytes";
        let sig = s.sign(data).unwrap();
        assert!(s.verify(data, &sig));
    }

    #[test]
    fn every_bit_flip_in_data_fails() {
        let s = signer();
        let data = b"abc".to_vec();
        let sig = s.sign(&data).unwrap();

        for i in 0..data.len() * 8 {
            let mut tampered = data.clone();
            tampered[i / 8] ^= 1 << (i % 8);
            assert!(!s.verify(&tampered, &sig), "bit {i} flip went unnoticed");
        }
    }

    #[test]
    fn every_bit_flip_in_signature_fails() {
        let s = signer();
        let data = b"payload";
        let sig = s.sign(data).unwrap();

        for i in 0..sig.len() * 8 {
            let mut tampered = sig.clone();
            tampered[i / 8] ^= 1 << (i % 8);
            assert!(!s.verify(data, &tampered));
        }
    }

    #[test]
    fn wrong_key_and_garbage_are_false() {
        let a = signer();
        let b = signer();
        let sig = a.sign(b"x").unwrap();

        assert!(!b.verify(b"x", &sig));
        assert!(!a.verify(b"x", &[]));
        assert!(!a.verify(b"x", &[0u8; 3]));
        assert!(!a.verify_text_b64("x", "not base64!"));
    }

    #[test]
    fn text_signatures_roundtrip() {
        let s = signer();
        let sig = s.sign_text_b64("AVSIG001|1714564800|3").unwrap();
        assert!(s.verify_text_b64("AVSIG001|1714564800|3", &sig));
        assert!(!s.verify_text_b64("AVSIG001|1714564800|4", &sig));
    }

    #[test]
    fn missing_key_is_crypto_error() {
        let s = RecordSigner::new(Arc::new(NoKeys));
        assert!(matches!(s.sign(b"x"), Err(AvError::Crypto { .. })));
        assert!(!s.verify(b"x", &[0u8; 64]));
    }
}
