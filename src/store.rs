// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Persistent store abstraction.
//!
//! The engine needs very little from its backend:
//!
//! - point reads of a per-user document and of idempotency records
//! - an atomic compare-and-swap of the whole per-user document
//!   (account + ledger), failing with [`EngineError::TransactionConflict`]
//!   when another writer got there first
//! - an atomic insert-if-absent for idempotency records
//!
//! Anything offering those can back the engine. [`MemoryStore`] is the
//! in-process implementation used by the CLI and the tests.
//!
//! # Dyn Compatibility
//!
//! Methods return boxed futures so the store can be shared as `Arc<dyn Store>`.

use crate::account::Account;
use crate::base::{TransactionId, UserId};
use crate::error::EngineError;
use crate::transaction::LedgerEntry;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send + 'a>>;

/// Everything the engine keeps for one user, committed as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDocument {
    pub account: Account,
    pub ledger: Vec<LedgerEntry>,
}

impl UserDocument {
    pub fn new(user_id: UserId) -> Self {
        Self {
            account: Account::new(user_id),
            ledger: Vec::new(),
        }
    }

    /// Sum of all signed ledger amounts; equals the balance for a consistent document.
    pub fn ledger_sum(&self) -> i128 {
        self.ledger.iter().map(LedgerEntry::signed_amount).sum()
    }

    pub fn entry(&self, id: TransactionId) -> Option<&LedgerEntry> {
        self.ledger.iter().find(|entry| entry.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    /// Starts at 1 on first commit; 0 means "never written".
    pub version: u64,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub result: Option<serde_json::Value>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn pending(key: impl Into<String>, now: DateTime<Utc>, lease_until: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            result: None,
            status: RecordStatus::Pending,
            created_at: now,
            expires_at: lease_until,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A live record already holds the key.
    Existing(IdempotencyRecord),
}

/// Backend for per-user documents and idempotency records.
pub trait Store: Send + Sync {
    /// Loads a user's document, `None` if the user has never been written.
    fn load_user(&self, user_id: UserId) -> StoreFuture<'_, Option<Versioned<UserDocument>>>;

    /// Replaces the user's document if its version still equals `expected_version`.
    ///
    /// Returns the new version.
    ///
    /// # Errors
    ///
    /// - [`EngineError::TransactionConflict`] - another commit landed first.
    /// - [`EngineError::StoreUnavailable`] - nothing was written.
    fn commit_user(&self, expected_version: u64, document: UserDocument) -> StoreFuture<'_, u64>;

    /// Owner of a committed ledger entry.
    fn find_entry_owner(&self, id: TransactionId) -> StoreFuture<'_, Option<UserId>>;

    /// Allocates a fresh ledger entry id. Ids of aborted attempts are never reused.
    fn allocate_transaction_id(&self) -> TransactionId;

    fn get_record(&self, key: String) -> StoreFuture<'_, Option<IdempotencyRecord>>;

    /// Inserts `record` unless a non-expired record holds the same key.
    ///
    /// An expired record is replaced as if absent.
    fn insert_record_if_absent(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, InsertOutcome>;

    /// Marks a pending record successful and stores its result.
    fn complete_record(
        &self,
        key: String,
        result: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, ()>;

    /// Moves the expiry of a still-pending record to `expires_at`.
    ///
    /// Returns `false` when no pending record holds `key`.
    fn renew_record(&self, key: String, expires_at: DateTime<Utc>) -> StoreFuture<'_, bool>;

    fn remove_record(&self, key: String) -> StoreFuture<'_, ()>;

    /// Deletes expired records, returning how many were removed.
    fn purge_expired_records(&self, now: DateTime<Utc>) -> StoreFuture<'_, usize>;
}

/// Points at which [`MemoryStore`] can be told to fail a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// The balance has been staged but the ledger entries have not.
    AfterBalanceWrite,
}

#[derive(Debug, Default)]
struct Faults {
    failing_commits: u32,
    fail_point: Option<FailPoint>,
    unavailable: bool,
}

/// In-process store backed by [`DashMap`].
///
/// Commits hold the user's shard entry for the whole compare-and-swap, which
/// serializes writers per user while leaving other users independent.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<UserId, Versioned<UserDocument>>,
    entry_owners: DashMap<TransactionId, UserId>,
    records: DashMap<String, IdempotencyRecord>,
    next_id: AtomicU64,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` commits with [`EngineError::StoreUnavailable`].
    pub fn fail_next_commits(&self, count: u32) {
        self.faults.lock().failing_commits = count;
    }

    /// Arms a fail point that aborts every commit until cleared.
    pub fn set_fail_point(&self, point: Option<FailPoint>) {
        self.faults.lock().fail_point = point;
    }

    /// Makes every operation fail with [`EngineError::StoreUnavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn user_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<_> = self.users.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn check_available(&self) -> Result<(), EngineError> {
        if self.faults.lock().unavailable {
            return Err(EngineError::StoreUnavailable);
        }
        Ok(())
    }

    fn take_commit_fault(&self) -> Result<Option<FailPoint>, EngineError> {
        let mut faults = self.faults.lock();
        if faults.unavailable {
            return Err(EngineError::StoreUnavailable);
        }
        if faults.failing_commits > 0 {
            faults.failing_commits -= 1;
            return Err(EngineError::StoreUnavailable);
        }
        Ok(faults.fail_point)
    }

    fn commit_sync(
        &self,
        expected_version: u64,
        document: UserDocument,
    ) -> Result<u64, EngineError> {
        let fail_point = self.take_commit_fault()?;
        let user_id = document.account.user_id().clone();

        // Writes are staged into a fresh document and published in one step.
        let stage = |previous: Option<&UserDocument>| -> Result<UserDocument, EngineError> {
            let mut staged = match previous {
                Some(previous) => previous.clone(),
                None => UserDocument::new(user_id.clone()),
            };
            staged.account = document.account.clone();
            if fail_point == Some(FailPoint::AfterBalanceWrite) {
                return Err(EngineError::StoreUnavailable);
            }
            staged.ledger = document.ledger.clone();
            Ok(staged)
        };

        let (version, new_ids) = match self.users.entry(user_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.version != expected_version {
                    return Err(EngineError::TransactionConflict);
                }
                let known: HashSet<_> = current.value.ledger.iter().map(|e| e.id).collect();
                let staged = stage(Some(&current.value))?;
                let new_ids: Vec<_> = staged
                    .ledger
                    .iter()
                    .map(|e| e.id)
                    .filter(|id| !known.contains(id))
                    .collect();
                let version = expected_version + 1;
                occupied.insert(Versioned {
                    version,
                    value: staged,
                });
                (version, new_ids)
            }
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Err(EngineError::TransactionConflict);
                }
                let staged = stage(None)?;
                let new_ids: Vec<_> = staged.ledger.iter().map(|e| e.id).collect();
                vacant.insert(Versioned {
                    version: 1,
                    value: staged,
                });
                (1, new_ids)
            }
        };

        for id in new_ids {
            self.entry_owners.insert(id, user_id.clone());
        }
        Ok(version)
    }
}

impl Store for MemoryStore {
    fn load_user(&self, user_id: UserId) -> StoreFuture<'_, Option<Versioned<UserDocument>>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.users.get(&user_id).map(|doc| doc.value().clone()))
        })
    }

    fn commit_user(&self, expected_version: u64, document: UserDocument) -> StoreFuture<'_, u64> {
        Box::pin(async move { self.commit_sync(expected_version, document) })
    }

    fn find_entry_owner(&self, id: TransactionId) -> StoreFuture<'_, Option<UserId>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.entry_owners.get(&id).map(|owner| owner.value().clone()))
        })
    }

    fn allocate_transaction_id(&self) -> TransactionId {
        TransactionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn get_record(&self, key: String) -> StoreFuture<'_, Option<IdempotencyRecord>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.records.get(&key).map(|record| record.value().clone()))
        })
    }

    fn insert_record_if_absent(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, InsertOutcome> {
        Box::pin(async move {
            self.check_available()?;
            // Entry API gives an atomic read-then-write-if-absent per key.
            match self.records.entry(record.key.clone()) {
                Entry::Occupied(mut occupied) => {
                    if occupied.get().is_expired(now) {
                        occupied.insert(record);
                        Ok(InsertOutcome::Inserted)
                    } else {
                        Ok(InsertOutcome::Existing(occupied.get().clone()))
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(record);
                    Ok(InsertOutcome::Inserted)
                }
            }
        })
    }

    fn complete_record(
        &self,
        key: String,
        result: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check_available()?;
            let mut record = self
                .records
                .get_mut(&key)
                .ok_or(EngineError::NotFound("idempotency record"))?;
            record.result = Some(result);
            record.status = RecordStatus::Success;
            record.expires_at = expires_at;
            Ok(())
        })
    }

    fn renew_record(&self, key: String, expires_at: DateTime<Utc>) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.check_available()?;
            match self.records.get_mut(&key) {
                Some(mut record) if record.status == RecordStatus::Pending => {
                    record.expires_at = expires_at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn remove_record(&self, key: String) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check_available()?;
            self.records.remove(&key);
            Ok(())
        })
    }

    fn purge_expired_records(&self, now: DateTime<Utc>) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            self.check_available()?;
            let before = self.records.len();
            self.records.retain(|_, record| !record.is_expired(now));
            Ok(before.saturating_sub(self.records.len()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn document_with_balance(user: &str, balance: u64) -> UserDocument {
        let mut document = UserDocument::new(UserId::new(user));
        document.account.credit(balance).unwrap();
        document
    }

    #[tokio::test]
    async fn first_commit_requires_version_zero() {
        let store = MemoryStore::new();
        let result = store.commit_user(3, document_with_balance("u", 1)).await;
        assert_eq!(result, Err(EngineError::TransactionConflict));

        assert_eq!(store.commit_user(0, document_with_balance("u", 1)).await, Ok(1));
        let loaded = store.load_user(UserId::new("u")).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.value.account.balance(), 1);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = MemoryStore::new();
        store.commit_user(0, document_with_balance("u", 1)).await.unwrap();
        store.commit_user(1, document_with_balance("u", 2)).await.unwrap();

        let result = store.commit_user(1, document_with_balance("u", 3)).await;
        assert_eq!(result, Err(EngineError::TransactionConflict));
        let loaded = store.load_user(UserId::new("u")).await.unwrap().unwrap();
        assert_eq!(loaded.value.account.balance(), 2);
    }

    #[tokio::test]
    async fn fail_point_publishes_nothing() {
        let store = MemoryStore::new();
        store.commit_user(0, document_with_balance("u", 10)).await.unwrap();
        store.set_fail_point(Some(FailPoint::AfterBalanceWrite));

        let result = store.commit_user(1, document_with_balance("u", 99)).await;
        assert_eq!(result, Err(EngineError::StoreUnavailable));

        let loaded = store.load_user(UserId::new("u")).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.value.account.balance(), 10);
    }

    #[tokio::test]
    async fn failing_commits_are_counted_down() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);
        assert_eq!(
            store.commit_user(0, document_with_balance("u", 1)).await,
            Err(EngineError::StoreUnavailable)
        );
        assert_eq!(store.commit_user(0, document_with_balance("u", 1)).await, Ok(1));
    }

    #[tokio::test]
    async fn insert_if_absent_keeps_first_writer() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = IdempotencyRecord::pending("k", now, now + Duration::seconds(30));
        let second = IdempotencyRecord::pending("k", now, now + Duration::seconds(60));

        assert_eq!(
            store.insert_record_if_absent(first.clone(), now).await,
            Ok(InsertOutcome::Inserted)
        );
        assert_eq!(
            store.insert_record_if_absent(second, now).await,
            Ok(InsertOutcome::Existing(first))
        );
    }

    #[tokio::test]
    async fn expired_record_is_replaced() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let stale = IdempotencyRecord::pending("k", now, now + Duration::seconds(1));
        store.insert_record_if_absent(stale, now).await.unwrap();

        let later = now + Duration::seconds(5);
        let fresh = IdempotencyRecord::pending("k", later, later + Duration::seconds(30));
        assert_eq!(
            store.insert_record_if_absent(fresh, later).await,
            Ok(InsertOutcome::Inserted)
        );
    }

    #[tokio::test]
    async fn renew_extends_pending_records_only() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let claim = IdempotencyRecord::pending("k", now, now + Duration::seconds(1));
        store.insert_record_if_absent(claim, now).await.unwrap();

        let renewed = store
            .renew_record("k".into(), now + Duration::seconds(60))
            .await;
        assert_eq!(renewed, Ok(true));
        let later = now + Duration::seconds(30);
        let rival = IdempotencyRecord::pending("k", later, later + Duration::seconds(1));
        assert!(matches!(
            store.insert_record_if_absent(rival, later).await,
            Ok(InsertOutcome::Existing(_))
        ));

        store
            .complete_record("k".into(), serde_json::json!(1), now + Duration::seconds(90))
            .await
            .unwrap();
        assert_eq!(store.renew_record("k".into(), now).await, Ok(false));
        assert_eq!(store.renew_record("missing".into(), now).await, Ok(false));
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (key, secs) in [("a", 1), ("b", 100)] {
            let record = IdempotencyRecord::pending(key, now, now + Duration::seconds(secs));
            store.insert_record_if_absent(record, now).await.unwrap();
        }
        let removed = store
            .purge_expired_records(now + Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.record_count(), 1);
    }

    #[test]
    fn transaction_ids_are_unique() {
        let store = MemoryStore::new();
        let a = store.allocate_transaction_id();
        let b = store.allocate_transaction_id();
        assert_ne!(a, b);
    }
}
