//! Signature catalog data model
//!
//! A [`SignatureRecord`] is one detection signature as stored and
//! distributed. The editable subset of its fields travels as a
//! [`RecordDraft`]; everything else (id, status, signature, version,
//! timestamps) is assigned by the catalog service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AvError, AvResult};

/// Longest accepted record name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Longest accepted prefix, in hex digits (8 bytes).
pub const MAX_PREFIX_HEX_DIGITS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectType {
    Pe,
    Java,
}

impl ObjectType {
    /// Single-byte code used in the canonical encoding.
    pub fn code(self) -> u8 {
        match self {
            ObjectType::Pe => 0,
            ObjectType::Java => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Active,
    Deleted,
}

/// A stored malware-detection signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRecord {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub object_type: Option<ObjectType>,
    /// Hex text, up to 8 bytes once decoded.
    #[serde(default)]
    pub signature_prefix: Option<String>,
    /// Hex text of the signature body.
    #[serde(default)]
    pub signature_body: Option<String>,
    /// Declared body length; kept as given even when it disagrees with the body.
    #[serde(default)]
    pub signature_length: Option<u32>,
    #[serde(default)]
    pub offset_begin: Option<i64>,
    #[serde(default)]
    pub offset_end: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    /// Signature over the record's canonical bytes.
    #[serde(default, with = "b64_bytes")]
    pub record_signature: Vec<u8>,
    pub status: RecordStatus,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SignatureRecord {
    /// Build an unsigned, unsaved ACTIVE record from a draft.
    pub fn from_draft(id: Uuid, draft: RecordDraft, now: DateTime<Utc>) -> Self {
        let mut record = Self {
            id,
            name: String::new(),
            object_type: None,
            signature_prefix: None,
            signature_body: None,
            signature_length: None,
            offset_begin: None,
            offset_end: None,
            description: None,
            record_signature: Vec::new(),
            status: RecordStatus::Active,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        record.apply(draft);
        record
    }

    /// Overwrite every editable field with the draft's values.
    pub fn apply(&mut self, draft: RecordDraft) {
        self.name = draft.name;
        self.object_type = draft.object_type;
        self.signature_prefix = draft.signature_prefix;
        self.signature_body = draft.signature_body;
        self.signature_length = draft.signature_length;
        self.offset_begin = draft.offset_begin;
        self.offset_end = draft.offset_end;
        self.description = draft.description;
    }

    pub fn is_active(&self) -> bool {
        self.status == RecordStatus::Active
    }

    pub fn has_signature(&self) -> bool {
        !self.record_signature.is_empty()
    }

    /// Full JSON snapshot used in audit entries.
    pub fn snapshot(&self) -> AvResult<String> {
        serde_json::to_string(self)
            .map_err(|e| AvError::serialization(format!("snapshot of {}", self.id), e))
    }
}

/// Administrator-supplied fields for create and update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub object_type: Option<ObjectType>,
    #[serde(default)]
    pub signature_prefix: Option<String>,
    #[serde(default)]
    pub signature_body: Option<String>,
    #[serde(default)]
    pub signature_length: Option<u32>,
    #[serde(default)]
    pub offset_begin: Option<i64>,
    #[serde(default)]
    pub offset_end: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl RecordDraft {
    /// Check the draft before anything is signed or stored.
    ///
    /// Hex fields may carry whitespace, `:` or `-` separators. Anything else
    /// that is not a hex digit is rejected here even though the encoder
    /// would silently drop it.
    pub fn validate(&self) -> AvResult<()> {
        if self.name.trim().is_empty() {
            return Err(AvError::validation("name", "name is required"));
        }
        if !self.name.is_ascii() {
            return Err(AvError::validation("name", "name must be ASCII"));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(AvError::validation(
                "name",
                format!("name exceeds {MAX_NAME_LEN} bytes"),
            ));
        }

        if let Some(prefix) = &self.signature_prefix {
            let digits = hex_digits("signaturePrefix", prefix)?;
            if digits > MAX_PREFIX_HEX_DIGITS {
                return Err(AvError::validation(
                    "signaturePrefix",
                    format!("prefix exceeds {MAX_PREFIX_HEX_DIGITS} hex digits"),
                ));
            }
        }

        if let Some(body) = &self.signature_body {
            let digits = hex_digits("signatureBody", body)?;
            if digits % 2 != 0 {
                return Err(AvError::validation(
                    "signatureBody",
                    "signature body has an odd number of hex digits",
                ));
            }
        }

        Ok(())
    }
}

impl From<&SignatureRecord> for RecordDraft {
    fn from(record: &SignatureRecord) -> Self {
        Self {
            name: record.name.clone(),
            object_type: record.object_type,
            signature_prefix: record.signature_prefix.clone(),
            signature_body: record.signature_body.clone(),
            signature_length: record.signature_length,
            offset_begin: record.offset_begin,
            offset_end: record.offset_end,
            description: record.description.clone(),
        }
    }
}

fn hex_digits(field: &str, text: &str) -> AvResult<usize> {
    let mut count = 0;
    for c in text.chars() {
        if c.is_ascii_hexdigit() {
            count += 1;
        } else if !(c.is_whitespace() || c == ':' || c == '-') {
            return Err(AvError::validation(
                field,
                format!("unexpected character {c:?} in hex text"),
            ));
        }
    }
    Ok(count)
}

/// Serde adapter rendering raw bytes as standard base64.
pub mod b64_bytes {
    use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        B64.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
