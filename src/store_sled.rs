//! sled-backed stores
//!
//! Layout: tree `records` maps the 16 uuid bytes to the record JSON, tree
//! `refresh_tokens` maps the token hash hex to the row JSON. Conditional
//! writes go through `Tree::compare_and_swap` against the exact bytes that
//! were read, so a concurrent writer always makes one side lose.

use std::path::Path;

use chrono::{DateTime, Utc};
use sled::{Db, Tree};
use uuid::Uuid;

use crate::errors::{AvError, AvResult};
use crate::model::{RecordStatus, SignatureRecord};
use crate::store::{RecordStore, RefreshTokenRow, TokenStore};

const RECORDS_TREE: &str = "records";
const TOKENS_TREE: &str = "refresh_tokens";

/// Open (or create) the sled database at `path`.
pub fn open_db<P: AsRef<Path>>(path: P) -> AvResult<Db> {
    sled::open(path.as_ref())
        .map_err(|e| AvError::database(format!("open {}", path.as_ref().display()), e))
}

fn open_tree(db: &Db, name: &str) -> AvResult<Tree> {
    db.open_tree(name)
        .map_err(|e| AvError::database(format!("open tree {name}"), e))
}

pub struct SledRecordStore {
    tree: Tree,
}

impl SledRecordStore {
    pub fn new(db: &Db) -> AvResult<Self> {
        Ok(Self {
            tree: open_tree(db, RECORDS_TREE)?,
        })
    }

    fn decode(bytes: &[u8]) -> AvResult<SignatureRecord> {
        serde_json::from_slice(bytes).map_err(|e| AvError::serialization("decode record", e))
    }

    fn encode(record: &SignatureRecord) -> AvResult<Vec<u8>> {
        serde_json::to_vec(record).map_err(|e| AvError::serialization("encode record", e))
    }

    fn scan<F>(&self, mut keep: F) -> AvResult<Vec<SignatureRecord>>
    where
        F: FnMut(&SignatureRecord) -> bool,
    {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            let record = Self::decode(&value)?;
            if keep(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }
}

impl RecordStore for SledRecordStore {
    fn find_by_id(&self, id: Uuid) -> AvResult<Option<SignatureRecord>> {
        match self.tree.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn find_by_status(&self, status: RecordStatus) -> AvResult<Vec<SignatureRecord>> {
        self.scan(|r| r.status == status)
    }

    fn find_by_updated_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AvResult<Vec<SignatureRecord>> {
        self.scan(|r| r.updated_at >= from && r.updated_at <= to)
    }

    fn list_all(&self) -> AvResult<Vec<SignatureRecord>> {
        self.scan(|_| true)
    }

    fn list_entries(&self) -> AvResult<Vec<(Uuid, AvResult<SignatureRecord>)>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            match Uuid::from_slice(&key) {
                Ok(id) => out.push((id, Self::decode(&value))),
                Err(e) => out.push((Uuid::nil(), Err(AvError::database("decode record key", e)))),
            }
        }
        Ok(out)
    }

    fn insert(&self, record: &SignatureRecord) -> AvResult<SignatureRecord> {
        let bytes = Self::encode(record)?;
        let swapped = self
            .tree
            .compare_and_swap(record.id.as_bytes(), None as Option<&[u8]>, Some(bytes))?;
        if swapped.is_err() {
            return Err(AvError::conflict(
                "signature",
                record.id.to_string(),
                record.version,
            ));
        }
        self.tree.flush()?;
        Ok(record.clone())
    }

    fn compare_and_swap(
        &self,
        record: &SignatureRecord,
        expected_version: u64,
    ) -> AvResult<SignatureRecord> {
        let key = record.id.as_bytes();
        let current_bytes = self
            .tree
            .get(key)?
            .ok_or_else(|| AvError::not_found("signature", record.id.to_string()))?;
        let current = Self::decode(&current_bytes)?;
        if current.version != expected_version {
            return Err(AvError::conflict(
                "signature",
                record.id.to_string(),
                expected_version,
            ));
        }

        let mut stored = record.clone();
        stored.version = expected_version + 1;
        let new_bytes = Self::encode(&stored)?;

        // Lost the race between read and swap.
        if self
            .tree
            .compare_and_swap(key, Some(&current_bytes), Some(new_bytes))?
            .is_err()
        {
            return Err(AvError::conflict(
                "signature",
                record.id.to_string(),
                expected_version,
            ));
        }
        self.tree.flush()?;
        Ok(stored)
    }

    fn count(&self) -> AvResult<usize> {
        Ok(self.tree.len())
    }
}

pub struct SledTokenStore {
    tree: Tree,
}

impl SledTokenStore {
    pub fn new(db: &Db) -> AvResult<Self> {
        Ok(Self {
            tree: open_tree(db, TOKENS_TREE)?,
        })
    }

    fn decode(bytes: &[u8]) -> AvResult<RefreshTokenRow> {
        serde_json::from_slice(bytes).map_err(|e| AvError::serialization("decode token row", e))
    }

    fn encode(row: &RefreshTokenRow) -> AvResult<Vec<u8>> {
        serde_json::to_vec(row).map_err(|e| AvError::serialization("encode token row", e))
    }

    fn rows_for_user(&self, user_id: Uuid) -> AvResult<Vec<RefreshTokenRow>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            let row = Self::decode(&value)?;
            if row.user_id == user_id {
                out.push(row);
            }
        }
        Ok(out)
    }
}

impl TokenStore for SledTokenStore {
    fn save(&self, row: &RefreshTokenRow) -> AvResult<()> {
        self.tree
            .insert(row.token_hash_hex.as_bytes(), Self::encode(row)?)?;
        self.tree.flush()?;
        Ok(())
    }

    fn find_by_hash(&self, token_hash_hex: &str) -> AvResult<Option<RefreshTokenRow>> {
        match self.tree.get(token_hash_hex.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn revoke_if_active(&self, token_hash_hex: &str, now: DateTime<Utc>) -> AvResult<bool> {
        let key = token_hash_hex.as_bytes();
        loop {
            let Some(current_bytes) = self.tree.get(key)? else {
                return Ok(false);
            };
            let mut row = Self::decode(&current_bytes)?;
            if !row.is_active_at(now) {
                return Ok(false);
            }
            row.revoked = true;

            let swapped = self.tree.compare_and_swap(
                key,
                Some(&current_bytes),
                Some(Self::encode(&row)?),
            )?;
            if swapped.is_ok() {
                self.tree.flush()?;
                return Ok(true);
            }
            // Row changed underneath us; re-read and decide again.
        }
    }

    fn find_all_for_user(&self, user_id: Uuid) -> AvResult<Vec<RefreshTokenRow>> {
        self.rows_for_user(user_id)
    }

    fn delete_all_for_user(&self, user_id: Uuid) -> AvResult<usize> {
        let mut removed = 0;
        for row in self.rows_for_user(user_id)? {
            if self.tree.remove(row.token_hash_hex.as_bytes())?.is_some() {
                removed += 1;
            }
        }
        self.tree.flush()?;
        Ok(removed)
    }
}
