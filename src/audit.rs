//! Append-only audit trail for record changes and verification outcomes
//!
//! Entries are written through an [`AuditSink`]. The sinks expose `append`
//! and nothing else, so an entry once written cannot be edited or removed
//! through this crate. [`JsonlAuditSink`] additionally hash-links every line
//! to its predecessor so tampering with the file is detectable.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::{AvError, AvResult, SafeLock};

/// Actor recorded for sweep outcomes.
pub const VERIFIER_ACTOR: &str = "verifier";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    VerifyOk,
    VerifyFail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub signature_id: Uuid,
    pub change_kind: ChangeKind,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_snapshot: Option<String>,
}

pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> AvResult<()>;
}

/// Front door used by the services.
#[derive(Clone)]
pub struct AuditTrail {
    sink: Arc<dyn AuditSink>,
}

impl AuditTrail {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub fn record(
        &self,
        signature_id: Uuid,
        change_kind: ChangeKind,
        actor: &str,
        old_snapshot: Option<String>,
        new_snapshot: Option<String>,
    ) -> AvResult<AuditEntry> {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            signature_id,
            change_kind,
            actor: actor.to_string(),
            timestamp: Utc::now(),
            old_snapshot,
            new_snapshot,
        };
        self.sink.append(&entry)?;
        tracing::debug!(
            signature_id = %signature_id,
            kind = ?change_kind,
            actor,
            "Audit entry recorded"
        );
        Ok(entry)
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything appended so far, oldest first.
    pub fn entries(&self) -> AvResult<Vec<AuditEntry>> {
        Ok(self.entries.safe_lock()?.clone())
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: &AuditEntry) -> AvResult<()> {
        self.entries.safe_lock()?.push(entry.clone());
        Ok(())
    }
}

/// One line of the JSONL audit file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChainedAuditLine {
    line: String,
    hash: String,
    prev_hash: Option<String>,
}

fn chain_hash(prev_hash: Option<&str>, line: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev_hash {
        hasher.update(prev.as_bytes());
    }
    hasher.update(line.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash of the last line in `path`, if the file exists and has one.
pub fn read_last_hash<P: AsRef<Path>>(path: P) -> AvResult<Option<String>> {
    let file = match File::open(path.as_ref()) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AvError::io("open audit log", e)),
    };
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| AvError::io("read audit log", e))?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    match last {
        Some(line) => {
            let parsed: ChainedAuditLine = serde_json::from_str(&line)
                .map_err(|e| AvError::serialization("parse audit line", e))?;
            Ok(Some(parsed.hash))
        }
        None => Ok(None),
    }
}

/// Hash and byte length of the audit file as this sink last saw it.
#[derive(Debug)]
struct ChainTip {
    hash: Option<String>,
    len: u64,
}

/// File sink writing hash-chained JSON lines.
///
/// Each append holds an exclusive advisory lock on the file and picks up the
/// tip again if another writer grew the file since, so several processes
/// sharing one log keep a single chain.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    tip: Mutex<ChainTip>,
}

impl JsonlAuditSink {
    /// Open `path` for appending, picking up the chain where it left off.
    pub fn open<P: AsRef<Path>>(path: P) -> AvResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AvError::io("create audit directory", e))?;
            }
        }
        let len = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(AvError::io("stat audit log", e)),
        };
        let hash = read_last_hash(&path)?;
        Ok(Self {
            path,
            tip: Mutex::new(ChainTip { hash, len }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, entry: &AuditEntry) -> AvResult<()> {
        let mut tip = self.tip.safe_lock()?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AvError::io("open audit log", e))?;
        // Released when `file` is dropped.
        file.lock_exclusive()
            .map_err(|e| AvError::io("lock audit log", e))?;

        let len = file
            .metadata()
            .map_err(|e| AvError::io("stat audit log", e))?
            .len();
        if len != tip.len {
            tracing::debug!(
                path = %self.path.display(),
                "Audit log grew elsewhere, re-reading tip"
            );
            tip.hash = read_last_hash(&self.path)?;
        }

        let line = serde_json::to_string(entry)
            .map_err(|e| AvError::serialization("audit entry", e))?;
        let hash = chain_hash(tip.hash.as_deref(), &line);
        let record = ChainedAuditLine {
            line,
            hash: hash.clone(),
            prev_hash: tip.hash.clone(),
        };
        let json_line = serde_json::to_string(&record)
            .map_err(|e| AvError::serialization("audit line", e))?;
        writeln!(file, "{json_line}").map_err(|e| AvError::io("append audit log", e))?;

        tip.len = file
            .metadata()
            .map_err(|e| AvError::io("stat audit log", e))?
            .len();
        tip.hash = Some(hash);
        Ok(())
    }
}

/// Result of re-walking an audit file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub entries: usize,
    /// 1-based line number of the first line whose link or hash is wrong.
    pub first_broken_line: Option<usize>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_broken_line.is_none()
    }
}

/// Recompute every link in the audit file at `path`.
pub fn verify_chain<P: AsRef<Path>>(path: P) -> AvResult<ChainReport> {
    let file = File::open(path.as_ref()).map_err(|e| AvError::io("open audit log", e))?;
    let mut prev: Option<String> = None;
    let mut entries = 0;

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| AvError::io("read audit log", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let broken = ChainReport {
            entries,
            first_broken_line: Some(idx + 1),
        };

        let Ok(parsed) = serde_json::from_str::<ChainedAuditLine>(&line) else {
            return Ok(broken);
        };
        if parsed.prev_hash != prev || chain_hash(prev.as_deref(), &parsed.line) != parsed.hash {
            return Ok(broken);
        }
        if serde_json::from_str::<AuditEntry>(&parsed.line).is_err() {
            return Ok(broken);
        }

        entries += 1;
        prev = Some(parsed.hash);
    }

    Ok(ChainReport {
        entries,
        first_broken_line: None,
    })
}

/// Entries of an audit file, oldest first, without checking the chain.
pub fn read_entries<P: AsRef<Path>>(path: P) -> AvResult<Vec<AuditEntry>> {
    let file = File::open(path.as_ref()).map_err(|e| AvError::io("open audit log", e))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| AvError::io("read audit log", e))?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: ChainedAuditLine = serde_json::from_str(&line)
            .map_err(|e| AvError::serialization("parse audit line", e))?;
        out.push(
            serde_json::from_str(&parsed.line)
                .map_err(|e| AvError::serialization("parse audit entry", e))?,
        );
    }
    Ok(out)
}
