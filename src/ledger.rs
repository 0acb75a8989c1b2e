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

//! Wallet ledger and the atomic per-user update primitive.
//!
//! Every balance, inventory, or unlock mutation goes through
//! [`WalletLedger::with_atomic_user_update`]:
//!
//! 1. load the user's document and its version
//! 2. run the body against a private working copy ([`UserTransaction`])
//! 3. compare-and-swap the working copy back
//! 4. on a version conflict, back off and start over from 1
//!
//! A body that returns an error aborts the attempt; nothing it wrote is
//! committed. Balance changes can only be made together with a ledger entry.

use crate::account::Account;
use crate::base::{AssetType, CharacterId, TransactionId, UserId};
use crate::clock::Clock;
use crate::config::RetryPolicy;
use crate::error::EngineError;
use crate::inventory::UnlockState;
use crate::store::{Store, UserDocument};
use crate::transaction::{
    LedgerEntry, RefundInfo, TransactionMetadata, TransactionStatus, TransactionType,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Published once per committed ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEvent {
    pub user_id: UserId,
    pub transaction_id: TransactionId,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: u64,
    pub balance_before: u64,
    pub balance_after: u64,
    pub at: DateTime<Utc>,
}

impl From<&LedgerEntry> for LedgerEvent {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            user_id: entry.user_id.clone(),
            transaction_id: entry.id,
            kind: entry.kind,
            amount: entry.amount,
            balance_before: entry.balance_before,
            balance_after: entry.balance_after,
            at: entry.created_at,
        }
    }
}

/// Working copy of one user's document inside an atomic update.
pub struct UserTransaction<'a> {
    store: &'a dyn Store,
    document: UserDocument,
    now: DateTime<Utc>,
    written: Vec<TransactionId>,
    dirty: bool,
}

impl<'a> UserTransaction<'a> {
    fn new(store: &'a dyn Store, document: UserDocument, now: DateTime<Utc>) -> Self {
        Self {
            store,
            document,
            now,
            written: Vec::new(),
            dirty: false,
        }
    }

    /// Transaction timestamp, shared by every entry written in it.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn user_id(&self) -> &UserId {
        self.document.account.user_id()
    }

    pub fn balance(&self) -> u64 {
        self.document.account.balance()
    }

    pub fn account(&self) -> &Account {
        &self.document.account
    }

    pub fn entry(&self, id: TransactionId) -> Option<&LedgerEntry> {
        self.document.entry(id)
    }

    /// Lowers the balance by `amount` and appends the paired entry.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InsufficientFunds`] - balance is below `amount`.
    /// - [`EngineError::InvalidArgument`] - `kind` is a credit type.
    pub fn debit(
        &mut self,
        kind: TransactionType,
        amount: u64,
        metadata: TransactionMetadata,
    ) -> Result<LedgerEntry, EngineError> {
        if kind.is_credit() {
            return Err(EngineError::InvalidArgument(format!(
                "{kind:?} is not a debit"
            )));
        }
        let before = self.balance();
        let after = self.document.account.debit(amount)?;
        Ok(self.append(kind, amount, before, after, metadata))
    }

    /// Raises the balance by `amount` and appends the paired entry.
    pub fn credit(
        &mut self,
        kind: TransactionType,
        amount: u64,
        metadata: TransactionMetadata,
    ) -> Result<LedgerEntry, EngineError> {
        if !kind.is_credit() {
            return Err(EngineError::InvalidArgument(format!(
                "{kind:?} is not a credit"
            )));
        }
        let before = self.balance();
        let after = self.document.account.credit(amount)?;
        Ok(self.append(kind, amount, before, after, metadata))
    }

    fn append(
        &mut self,
        kind: TransactionType,
        amount: u64,
        balance_before: u64,
        balance_after: u64,
        metadata: TransactionMetadata,
    ) -> LedgerEntry {
        let entry = LedgerEntry {
            id: self.store.allocate_transaction_id(),
            user_id: self.user_id().clone(),
            kind,
            amount,
            balance_before,
            balance_after,
            metadata,
            status: TransactionStatus::Completed,
            refund: None,
            created_at: self.now,
        };
        self.written.push(entry.id);
        self.dirty = true;
        self.document.ledger.push(entry.clone());
        entry
    }

    pub fn grant_asset(&mut self, asset_type: AssetType, quantity: u64) -> Result<u64, EngineError> {
        self.dirty = true;
        self.document.account.inventory_mut().grant(asset_type, quantity)
    }

    /// Strict removal; fails the whole update when the user holds too few.
    pub fn consume_asset(
        &mut self,
        asset_type: AssetType,
        quantity: u64,
    ) -> Result<u64, EngineError> {
        self.dirty = true;
        self.document.account.inventory_mut().consume(asset_type, quantity)
    }

    /// Clamped removal, returns the quantity actually taken.
    pub fn reclaim_asset(&mut self, asset_type: AssetType, quantity: u64) -> u64 {
        self.dirty = true;
        self.document.account.inventory_mut().reclaim(asset_type, quantity)
    }

    pub fn unlock_state(&self, character_id: &CharacterId) -> Option<&UnlockState> {
        self.document.account.unlock_state(character_id)
    }

    pub fn unlock_state_mut(&mut self, character_id: &CharacterId) -> &mut UnlockState {
        self.dirty = true;
        self.document.account.unlock_state_mut(character_id)
    }

    /// One-way `completed → refunded` transition of an existing entry.
    pub fn mark_refunded(&mut self, id: TransactionId, info: RefundInfo) -> Result<(), EngineError> {
        let entry = self
            .document
            .ledger
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or(EngineError::NotFound("transaction"))?;
        if entry.status == TransactionStatus::Refunded {
            return Err(EngineError::AlreadyRefunded);
        }
        entry.status = TransactionStatus::Refunded;
        entry.refund = Some(info);
        self.dirty = true;
        Ok(())
    }

    fn assert_invariants(&self) {
        debug_assert_eq!(
            self.document.ledger_sum(),
            i128::from(self.balance()),
            "Invariant violated: ledger sum differs from balance for {}",
            self.user_id()
        );
    }
}

/// Filter for [`WalletLedger::history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Only entries of this type.
    pub kind: Option<TransactionType>,
    /// Only entries in this status.
    pub status: Option<TransactionStatus>,
    /// Newest entries to skip.
    pub offset: usize,
    /// Defaults to 50 when `None`.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeTotals {
    pub count: u64,
    pub total_amount: u64,
}

/// Totals over every entry, refunded ones included.
///
/// `total_credited - total_debited` always equals the balance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total_transactions: u64,
    /// Sum of REFUND and ADMIN amounts.
    pub total_credited: u64,
    /// Sum of every debit amount.
    pub total_debited: u64,
    /// Sum of REFUND amounts; also counted in `total_credited`.
    pub total_refunded: u64,
    /// Count and amount per upper-case type name.
    pub by_type: BTreeMap<String, TypeTotals>,
}

/// Owner of balances and the append-only transaction log.
pub struct WalletLedger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    /// Backoff for commit conflicts.
    retry: RetryPolicy,
    /// Committed entries, one event each.
    events: broadcast::Sender<LedgerEvent>,
}

impl WalletLedger {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            clock,
            retry,
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Receives one event per committed ledger entry.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Runs `body` as one atomic, optimistically retried update of `user_id`'s record.
    ///
    /// `body` may run several times; it must only act through the given
    /// [`UserTransaction`].
    ///
    /// # Errors
    ///
    /// - Any error returned by `body`, with nothing committed.
    /// - [`EngineError::Timeout`] - every retry lost an optimistic race.
    /// - [`EngineError::StoreUnavailable`] - the store failed; nothing committed.
    pub async fn with_atomic_user_update<T, F>(
        &self,
        user_id: &UserId,
        mut body: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut(&mut UserTransaction<'_>) -> Result<T, EngineError>,
    {
        if user_id.as_str().trim().is_empty() {
            return Err(EngineError::MissingParameter("user_id"));
        }

        let mut attempt = 0;
        loop {
            let (version, document) = match self.store.load_user(user_id.clone()).await? {
                Some(current) => (current.version, current.value),
                None => (0, UserDocument::new(user_id.clone())),
            };

            let mut tx = UserTransaction::new(self.store.as_ref(), document, self.clock.now());
            let value = body(&mut tx)?;
            tx.assert_invariants();

            let UserTransaction {
                document,
                written,
                dirty,
                ..
            } = tx;
            if !dirty {
                return Ok(value);
            }

            match self.store.commit_user(version, document.clone()).await {
                Ok(_) => {
                    self.publish(&document, &written);
                    return Ok(value);
                }
                Err(EngineError::TransactionConflict) => {
                    if attempt >= self.retry.max_retries {
                        warn!(user_id = %user_id, attempts = attempt + 1, "giving up after repeated commit conflicts");
                        return Err(EngineError::Timeout);
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(user_id = %user_id, attempt, ?delay, "commit conflict, retrying");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn publish(&self, document: &UserDocument, written: &[TransactionId]) {
        for id in written {
            let Some(entry) = document.entry(*id) else {
                continue;
            };
            info!(
                user_id = %entry.user_id,
                transaction_id = %entry.id,
                kind = ?entry.kind,
                amount = entry.amount,
                balance_before = entry.balance_before,
                balance_after = entry.balance_after,
                "ledger entry committed"
            );
            // No subscribers is fine.
            let _ = self.events.send(LedgerEvent::from(entry));
        }
    }

    /// Credits `amount` as an ADMIN entry (confirmed payments, manual grants).
    pub async fn credit(
        &self,
        user_id: &UserId,
        amount: u64,
        reason: &str,
    ) -> Result<LedgerEntry, EngineError> {
        if amount == 0 {
            return Err(EngineError::InvalidArgument("amount must be positive".into()));
        }
        self.with_atomic_user_update(user_id, |tx| {
            tx.credit(
                TransactionType::Admin,
                amount,
                TransactionMetadata::Admin {
                    reason: reason.to_string(),
                    package: None,
                },
            )
        })
        .await
    }

    /// Removes `amount` as a DEDUCT entry.
    pub async fn deduct(
        &self,
        user_id: &UserId,
        amount: u64,
        reason: &str,
    ) -> Result<LedgerEntry, EngineError> {
        if amount == 0 {
            return Err(EngineError::InvalidArgument("amount must be positive".into()));
        }
        self.with_atomic_user_update(user_id, |tx| {
            tx.debit(
                TransactionType::Deduct,
                amount,
                TransactionMetadata::Deduct {
                    reason: reason.to_string(),
                },
            )
        })
        .await
    }

    /// Current account, or an empty one for unknown users.
    pub async fn account(&self, user_id: &UserId) -> Result<Account, EngineError> {
        Ok(self
            .store
            .load_user(user_id.clone())
            .await?
            .map(|doc| doc.value.account)
            .unwrap_or_else(|| Account::new(user_id.clone())))
    }

    pub async fn balance(&self, user_id: &UserId) -> Result<u64, EngineError> {
        Ok(self.account(user_id).await?.balance())
    }

    pub async fn entry(
        &self,
        user_id: &UserId,
        id: TransactionId,
    ) -> Result<Option<LedgerEntry>, EngineError> {
        Ok(self
            .store
            .load_user(user_id.clone())
            .await?
            .and_then(|doc| doc.value.entry(id).cloned()))
    }

    /// Entries newest first.
    pub async fn history(
        &self,
        user_id: &UserId,
        filter: &HistoryFilter,
    ) -> Result<Vec<LedgerEntry>, EngineError> {
        let Some(doc) = self.store.load_user(user_id.clone()).await? else {
            return Ok(Vec::new());
        };
        Ok(doc
            .value
            .ledger
            .into_iter()
            .rev()
            .filter(|e| filter.kind.is_none_or(|kind| e.kind == kind))
            .filter(|e| filter.status.is_none_or(|status| e.status == status))
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(50))
            .collect())
    }

    pub async fn stats(&self, user_id: &UserId) -> Result<LedgerStats, EngineError> {
        let filter = HistoryFilter {
            limit: Some(usize::MAX),
            ..HistoryFilter::default()
        };
        let mut stats = LedgerStats::default();
        for entry in self.history(user_id, &filter).await? {
            stats.total_transactions += 1;
            if entry.kind == TransactionType::Refund {
                stats.total_refunded += entry.amount;
            }
            if entry.kind.is_credit() {
                stats.total_credited += entry.amount;
            } else {
                stats.total_debited += entry.amount;
            }
            let totals = stats
                .by_type
                .entry(format!("{:?}", entry.kind).to_uppercase())
                .or_default();
            totals.count += 1;
            totals.total_amount += entry.amount;
        }
        Ok(stats)
    }

    /// Checks `balance == Σ signed ledger amounts` and that every entry is self-consistent.
    pub async fn verify_balance_invariant(&self, user_id: &UserId) -> Result<bool, EngineError> {
        let Some(doc) = self.store.load_user(user_id.clone()).await? else {
            return Ok(true);
        };
        let doc = doc.value;
        Ok(doc.ledger_sum() == i128::from(doc.account.balance())
            && doc.ledger.iter().all(LedgerEntry::is_consistent))
    }
}
