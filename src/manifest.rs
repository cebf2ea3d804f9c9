//! Manifest header, manifest document and the distribution bundle
//!
//! Everything a client downloads is derived from a single snapshot of the
//! ACTIVE records so that the text manifest, the binary payload and the
//! header count always describe the same list in the same order.
//!
//! Bundle framing (`B` is the boundary token):
//!
//! ```text
//! --B\r\n<part headers>\r\n\r\n<manifest.txt>\r\n
//! --B\r\n<part headers>\r\n\r\n<data.bin>\r\n
//! --B--\r\n
//! ```

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{release_date_of, SignatureService};
use crate::errors::{AvError, AvResult};
use crate::keys::PublicCertificate;
use crate::model::SignatureRecord;
use crate::record_encoder::encode_all;
use crate::signer::RecordSigner;

pub const MANIFEST_SIG_PREFIX: &str = "MANIFEST_SIG:";
pub const BOUNDARY_PREFIX: &str = "----AVBOUND-";
pub const MANIFEST_FILENAME: &str = "manifest.txt";
pub const DATA_FILENAME: &str = "data.bin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestHeader {
    pub magic_number: String,
    pub release_date: DateTime<Utc>,
    pub count: u64,
    /// Base64 signature over [`header_signing_input`].
    pub header_signature: String,
}

/// JSON view of the catalog: signed header plus the records it counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub header: ManifestHeader,
    pub records: Vec<SignatureRecord>,
}

/// A fully assembled multipart bundle.
#[derive(Debug, Clone)]
pub struct ManifestBundle {
    pub boundary: String,
    pub manifest_txt: String,
    pub data_bin: Vec<u8>,
    pub body: Vec<u8>,
}

impl ManifestBundle {
    pub fn content_type(&self) -> String {
        format!("multipart/mixed; boundary={}", self.boundary)
    }
}

/// One `id:signature` line of a verified text manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestLine {
    pub id: Uuid,
    pub record_signature: Vec<u8>,
}

/// The exact text the header signature covers.
pub fn header_signing_input(magic: &str, release_date: DateTime<Utc>, count: u64) -> String {
    format!("{magic}|{}|{count}", release_date.timestamp())
}

#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    signer: RecordSigner,
    magic: String,
}

impl ManifestBuilder {
    pub fn new(signer: RecordSigner, magic: impl Into<String>) -> Self {
        Self {
            signer,
            magic: magic.into(),
        }
    }

    pub fn magic(&self) -> &str {
        &self.magic
    }

    pub fn build_signed_header(
        &self,
        release_date: DateTime<Utc>,
        count: u64,
    ) -> AvResult<ManifestHeader> {
        let input = header_signing_input(&self.magic, release_date, count);
        Ok(ManifestHeader {
            magic_number: self.magic.clone(),
            release_date,
            count,
            header_signature: self.signer.sign_text_b64(&input)?,
        })
    }

    /// Header and records from one read of the ACTIVE list.
    pub fn build_document(&self, catalog: &SignatureService) -> AvResult<ManifestDocument> {
        let records = catalog.list_active()?;
        self.document_from(records)
    }

    pub fn document_from(&self, records: Vec<SignatureRecord>) -> AvResult<ManifestDocument> {
        let header = self.build_signed_header(release_date_of(&records), records.len() as u64)?;
        Ok(ManifestDocument { header, records })
    }

    /// Text manifest: count line, `id:signature` lines, then the signature line.
    pub fn manifest_text(&self, records: &[SignatureRecord]) -> AvResult<String> {
        let mut text = format!("{}\n", records.len());
        for record in records {
            text.push_str(&format!("{}:{}\n", record.id, B64.encode(&record.record_signature)));
        }
        let signature = self.signer.sign_text_b64(&text)?;
        text.push_str(MANIFEST_SIG_PREFIX);
        text.push_str(&signature);
        text.push('\n');
        Ok(text)
    }

    pub fn build_bundle(&self, catalog: &SignatureService) -> AvResult<ManifestBundle> {
        let records = catalog.list_active()?;
        self.bundle_from(&records)
    }

    /// Assemble the bundle for `records`, in the given order.
    pub fn bundle_from(&self, records: &[SignatureRecord]) -> AvResult<ManifestBundle> {
        let manifest_txt = self.manifest_text(records)?;
        let data_bin = encode_all(records);
        let boundary = format!("{BOUNDARY_PREFIX}{}", Uuid::new_v4());

        let part1_header = format!(
            "--{boundary}\r\nContent-Type: text/plain; charset=utf-8\r\n\
             Content-Disposition: attachment; filename={MANIFEST_FILENAME}\r\n\r\n"
        );
        let part2_header = format!(
            "\r\n--{boundary}\r\nContent-Type: application/octet-stream\r\n\
             Content-Disposition: attachment; filename={DATA_FILENAME}\r\n\r\n"
        );
        let end = format!("\r\n--{boundary}--\r\n");

        let mut body = Vec::with_capacity(
            part1_header.len()
                + manifest_txt.len()
                + part2_header.len()
                + data_bin.len()
                + end.len(),
        );
        body.extend_from_slice(part1_header.as_bytes());
        body.extend_from_slice(manifest_txt.as_bytes());
        body.extend_from_slice(part2_header.as_bytes());
        body.extend_from_slice(&data_bin);
        body.extend_from_slice(end.as_bytes());

        tracing::info!(
            count = records.len(),
            bytes = body.len(),
            %boundary,
            "Built manifest bundle"
        );
        Ok(ManifestBundle {
            boundary,
            manifest_txt,
            data_bin,
            body,
        })
    }

    /// PEM of the verifying key, for clients to pin.
    pub fn certificate_pem(&self) -> AvResult<String> {
        Ok(self.signer.certificate()?.to_pem())
    }
}

fn verify_b64(cert: &PublicCertificate, text: &str, signature_b64: &str) -> bool {
    let Ok(raw) = B64.decode(signature_b64.trim()) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&raw) else {
        return false;
    };
    cert.verifying_key().verify(text.as_bytes(), &signature).is_ok()
}

/// Check a header's signature against `cert`.
pub fn verify_header(header: &ManifestHeader, cert: &PublicCertificate) -> bool {
    let input = header_signing_input(&header.magic_number, header.release_date, header.count);
    verify_b64(cert, &input, &header.header_signature)
}

/// Parse and verify a text manifest as a client would.
///
/// Fails if the trailing signature line is missing or wrong, or if the
/// count line disagrees with the number of entries.
pub fn verify_manifest_text(text: &str, cert: &PublicCertificate) -> AvResult<Vec<ManifestLine>> {
    let sig_start = text
        .rfind(MANIFEST_SIG_PREFIX)
        .filter(|&idx| idx == 0 || text.as_bytes()[idx - 1] == b'\n')
        .ok_or_else(|| AvError::validation("manifest", "missing MANIFEST_SIG line"))?;

    let signed = &text[..sig_start];
    let signature_b64 =
        text[sig_start + MANIFEST_SIG_PREFIX.len()..].trim_end_matches(['\r', '\n']);
    if !verify_b64(cert, signed, signature_b64) {
        return Err(AvError::crypto("manifest signature mismatch"));
    }

    let mut lines = signed.lines();
    let count: usize = lines
        .next()
        .and_then(|l| l.trim().parse().ok())
        .ok_or_else(|| AvError::validation("manifest", "missing count line"))?;

    let mut entries = Vec::with_capacity(count);
    for line in lines {
        let (id, sig) = line
            .split_once(':')
            .ok_or_else(|| AvError::validation("manifest", format!("bad entry line {line:?}")))?;
        let id = Uuid::parse_str(id)
            .map_err(|_| AvError::validation("manifest", format!("bad id {id:?}")))?;
        let record_signature = B64
            .decode(sig)
            .map_err(|_| AvError::validation("manifest", format!("bad signature for {id}")))?;
        entries.push(ManifestLine {
            id,
            record_signature,
        });
    }

    if entries.len() != count {
        return Err(AvError::validation(
            "manifest",
            format!("count line says {count}, found {} entries", entries.len()),
        ));
    }
    Ok(entries)
}
