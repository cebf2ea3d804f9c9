//! Repository traits and in-memory implementations
//!
//! Every query the services need is a named method here. Implementations
//! must be safe to share across threads; the two write paths that race in
//! practice, record updates and token rotation, are expressed as
//! [`RecordStore::compare_and_swap`] and [`TokenStore::revoke_if_active`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AvError, AvResult, SafeLock};
use crate::model::{RecordStatus, SignatureRecord};

/// Persistence for signature records.
///
/// List queries return records in ascending id order.
pub trait RecordStore: Send + Sync {
    fn find_by_id(&self, id: Uuid) -> AvResult<Option<SignatureRecord>>;

    fn find_by_status(&self, status: RecordStatus) -> AvResult<Vec<SignatureRecord>>;

    /// Records whose `updated_at` lies in `[from, to]`, any status.
    fn find_by_updated_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AvResult<Vec<SignatureRecord>>;

    /// Every record, DELETED included.
    fn list_all(&self) -> AvResult<Vec<SignatureRecord>>;

    /// Every stored entry paired with its own decode result, so one unreadable
    /// row does not hide the others. Ascending id order.
    fn list_entries(&self) -> AvResult<Vec<(Uuid, AvResult<SignatureRecord>)>> {
        Ok(self
            .list_all()?
            .into_iter()
            .map(|r| (r.id, Ok(r)))
            .collect())
    }

    /// Store a new record as given. Fails with `Conflict` if the id is taken.
    fn insert(&self, record: &SignatureRecord) -> AvResult<SignatureRecord>;

    /// Replace the stored record if its version is still `expected_version`.
    ///
    /// On success the stored copy carries `expected_version + 1` and is
    /// returned. A missing record is `NotFound`, a moved version is `Conflict`.
    fn compare_and_swap(
        &self,
        record: &SignatureRecord,
        expected_version: u64,
    ) -> AvResult<SignatureRecord>;

    fn count(&self) -> AvResult<usize>;

    fn is_empty(&self) -> AvResult<bool> {
        Ok(self.count()? == 0)
    }
}

/// Persisted half of a refresh token. The raw token is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRow {
    pub id: Uuid,
    pub token_hash_hex: String,
    pub user_id: Uuid,
    pub expiry: DateTime<Utc>,
    pub revoked: bool,
}

impl RefreshTokenRow {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expiry > now
    }
}

/// Persistence for refresh-token rows, keyed by token hash.
pub trait TokenStore: Send + Sync {
    fn save(&self, row: &RefreshTokenRow) -> AvResult<()>;

    fn find_by_hash(&self, token_hash_hex: &str) -> AvResult<Option<RefreshTokenRow>>;

    /// Atomically flip `revoked` to true if the row is currently active.
    ///
    /// Returns `true` for exactly one caller per row; everyone else, and any
    /// caller presenting an unknown, revoked or expired row, gets `false`.
    fn revoke_if_active(&self, token_hash_hex: &str, now: DateTime<Utc>) -> AvResult<bool>;

    fn find_all_for_user(&self, user_id: Uuid) -> AvResult<Vec<RefreshTokenRow>>;

    /// Remove every row owned by `user_id`, returning how many went.
    fn delete_all_for_user(&self, user_id: Uuid) -> AvResult<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
}

/// Lookup of already-registered users.
pub trait UserDirectory: Send + Sync {
    fn find_by_id(&self, id: Uuid) -> AvResult<Option<User>>;

    fn find_by_username(&self, username: &str) -> AvResult<Option<User>>;
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<Uuid, SignatureRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn find_by_id(&self, id: Uuid) -> AvResult<Option<SignatureRecord>> {
        Ok(self.records.safe_lock()?.get(&id).cloned())
    }

    fn find_by_status(&self, status: RecordStatus) -> AvResult<Vec<SignatureRecord>> {
        let records = self.records.safe_lock()?;
        Ok(records
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    fn find_by_updated_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> AvResult<Vec<SignatureRecord>> {
        let records = self.records.safe_lock()?;
        Ok(records
            .values()
            .filter(|r| r.updated_at >= from && r.updated_at <= to)
            .cloned()
            .collect())
    }

    fn list_all(&self) -> AvResult<Vec<SignatureRecord>> {
        Ok(self.records.safe_lock()?.values().cloned().collect())
    }

    fn insert(&self, record: &SignatureRecord) -> AvResult<SignatureRecord> {
        let mut records = self.records.safe_lock()?;
        if records.contains_key(&record.id) {
            return Err(AvError::conflict(
                "signature",
                record.id.to_string(),
                record.version,
            ));
        }
        records.insert(record.id, record.clone());
        Ok(record.clone())
    }

    fn compare_and_swap(
        &self,
        record: &SignatureRecord,
        expected_version: u64,
    ) -> AvResult<SignatureRecord> {
        let mut records = self.records.safe_lock()?;
        let current = records
            .get(&record.id)
            .ok_or_else(|| AvError::not_found("signature", record.id.to_string()))?;
        if current.version != expected_version {
            return Err(AvError::conflict(
                "signature",
                record.id.to_string(),
                expected_version,
            ));
        }

        let mut stored = record.clone();
        stored.version = expected_version + 1;
        records.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn count(&self) -> AvResult<usize> {
        Ok(self.records.safe_lock()?.len())
    }
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    rows: Mutex<HashMap<String, RefreshTokenRow>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn save(&self, row: &RefreshTokenRow) -> AvResult<()> {
        self.rows
            .safe_lock()?
            .insert(row.token_hash_hex.clone(), row.clone());
        Ok(())
    }

    fn find_by_hash(&self, token_hash_hex: &str) -> AvResult<Option<RefreshTokenRow>> {
        Ok(self.rows.safe_lock()?.get(token_hash_hex).cloned())
    }

    fn revoke_if_active(&self, token_hash_hex: &str, now: DateTime<Utc>) -> AvResult<bool> {
        let mut rows = self.rows.safe_lock()?;
        match rows.get_mut(token_hash_hex) {
            Some(row) if row.is_active_at(now) => {
                row.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn find_all_for_user(&self, user_id: Uuid) -> AvResult<Vec<RefreshTokenRow>> {
        let rows = self.rows.safe_lock()?;
        Ok(rows
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    fn delete_all_for_user(&self, user_id: Uuid) -> AvResult<usize> {
        let mut rows = self.rows.safe_lock()?;
        let before = rows.len();
        rows.retain(|_, r| r.user_id != user_id);
        Ok(before - rows.len())
    }
}

#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user and hand it back.
    pub fn add(&self, username: &str) -> AvResult<User> {
        let user = User {
            id: Uuid::new_v4(),
            username: username.to_string(),
        };
        self.users.safe_lock()?.insert(user.id, user.clone());
        Ok(user)
    }
}

impl UserDirectory for MemoryUserDirectory {
    fn find_by_id(&self, id: Uuid) -> AvResult<Option<User>> {
        Ok(self.users.safe_lock()?.get(&id).cloned())
    }

    fn find_by_username(&self, username: &str) -> AvResult<Option<User>> {
        let users = self.users.safe_lock()?;
        Ok(users.values().find(|u| u.username == username).cloned())
    }
}
