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

//! Refunds of debit ledger entries.
//!
//! Refundable types: PURCHASE, GIFT, UNLOCK, DEDUCT.
//!
//! Preconditions are checked in this order, all inside the same atomic update
//! that applies the effects:
//!
//! 1. entry exists and belongs to the user
//! 2. entry is not already refunded
//! 3. entry type is refundable
//! 4. entry is inside the refund window, unless forced
//!
//! Granted assets are taken back clamped at zero; the currency refund is
//! always the full original amount.

use crate::base::{AssetType, CharacterId, TransactionId, UserId};
use crate::error::EngineError;
use crate::ledger::{UserTransaction, WalletLedger};
use crate::transaction::{
    LedgerEntry, PaymentMethod, RefundInfo, RefundedAsset, TransactionMetadata,
    TransactionStatus, TransactionType,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Per-request refund settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundOptions {
    /// Overrides the configured refund window.
    pub within_days: Option<u32>,
    /// Skips the window check.
    #[serde(default)]
    pub force: bool,
    /// Deduplicates retries of this refund request.
    pub idempotency_key: Option<String>,
}

/// Outcome of a refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundResult {
    /// The REFUND credit entry.
    pub refund_transaction_id: TransactionId,
    /// The entry now marked refunded.
    pub original_transaction_id: TransactionId,
    pub refund_amount: u64,
    /// Balance right after the refund.
    pub balance: u64,
    /// Assets the original entry granted.
    pub refunded_asset: Option<RefundedAsset>,
    /// How many of them were actually taken back.
    pub reclaimed_quantity: u64,
    /// Character whose unlock was revoked or shortened.
    pub unlock_revoked: Option<CharacterId>,
    /// A ticket-paid unlock gave its card back.
    pub ticket_returned: bool,
}

/// Applies refunds inside one atomic user update.
pub struct RefundEngine {
    ledger: Arc<WalletLedger>,
    default_window_days: u32,
}

impl RefundEngine {
    pub fn new(ledger: Arc<WalletLedger>, default_window_days: u32) -> Self {
        Self {
            ledger,
            default_window_days,
        }
    }

    /// Refunds ledger entry `transaction_id` of `user_id`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::MissingParameter`] - empty `reason`.
    /// - [`EngineError::NotFound`] - no such entry.
    /// - [`EngineError::OwnerMismatch`] - entry belongs to another user.
    /// - [`EngineError::AlreadyRefunded`]
    /// - [`EngineError::UnsupportedTransactionType`]
    /// - [`EngineError::RefundWindowExpired`]
    pub async fn refund(
        &self,
        user_id: &UserId,
        transaction_id: TransactionId,
        reason: &str,
        options: &RefundOptions,
    ) -> Result<RefundResult, EngineError> {
        if reason.trim().is_empty() {
            return Err(EngineError::MissingParameter("reason"));
        }
        match self
            .ledger
            .store()
            .find_entry_owner(transaction_id)
            .await?
        {
            None => return Err(EngineError::NotFound("transaction")),
            Some(owner) if owner != *user_id => return Err(EngineError::OwnerMismatch),
            Some(_) => {}
        }

        let window_days = options.within_days.unwrap_or(self.default_window_days);
        let result = self
            .ledger
            .with_atomic_user_update(user_id, |tx| {
                apply_refund(tx, transaction_id, reason, window_days, options.force)
            })
            .await?;

        info!(
            user_id = %user_id,
            original_transaction_id = %transaction_id,
            refund_transaction_id = %result.refund_transaction_id,
            amount = result.refund_amount,
            balance = result.balance,
            "refund completed"
        );
        Ok(result)
    }
}

fn apply_refund(
    tx: &mut UserTransaction<'_>,
    transaction_id: TransactionId,
    reason: &str,
    window_days: u32,
    force: bool,
) -> Result<RefundResult, EngineError> {
    let original: LedgerEntry = tx
        .entry(transaction_id)
        .cloned()
        .ok_or(EngineError::NotFound("transaction"))?;
    if original.status == TransactionStatus::Refunded {
        return Err(EngineError::AlreadyRefunded);
    }
    if !original.kind.is_refundable() {
        return Err(EngineError::UnsupportedTransactionType);
    }
    let elapsed = tx.now() - original.created_at;
    if !force && elapsed > chrono::Duration::days(i64::from(window_days)) {
        return Err(EngineError::RefundWindowExpired {
            window_days,
            elapsed_days: elapsed.num_days(),
        });
    }

    let refunded_asset = original
        .metadata
        .asset_grant()
        .map(|(asset_type, quantity)| RefundedAsset {
            asset_type,
            quantity,
        });
    let mut reclaimed_quantity = 0;
    if let Some(asset) = &refunded_asset {
        reclaimed_quantity = tx.reclaim_asset(asset.asset_type, asset.quantity);
        if reclaimed_quantity < asset.quantity {
            warn!(
                user_id = %original.user_id,
                transaction_id = %transaction_id,
                asset_type = %asset.asset_type,
                granted = asset.quantity,
                reclaimed = reclaimed_quantity,
                "refunded assets were partly consumed, reclaiming what remains"
            );
        }
    }

    let now = tx.now();
    let mut unlock_revoked = None;
    let mut ticket_returned = false;
    if let TransactionMetadata::Unlock {
        character_id,
        permanent,
        days,
        payment,
        ..
    } = &original.metadata
    {
        let state = tx.unlock_state_mut(character_id);
        match (*permanent, days) {
            (true, _) => state.revoke(now),
            (false, Some(days)) => {
                state.shorten(now, chrono::Duration::days(i64::from(*days)));
                state.refunded_at = Some(now);
            }
            // Older entries do not record their duration.
            (false, None) => {
                state.temporary_unlock_until = None;
                state.refunded_at = Some(now);
            }
        }
        unlock_revoked = Some(character_id.clone());
        if *payment == PaymentMethod::Ticket {
            tx.grant_asset(AssetType::CharacterUnlockCard, 1)?;
            ticket_returned = true;
        }
    }

    let refund = tx.credit(
        TransactionType::Refund,
        original.amount,
        TransactionMetadata::Refund {
            original_transaction_id: transaction_id,
            reason: reason.to_string(),
            refunded_asset: refunded_asset.clone(),
            reclaimed_quantity,
        },
    )?;
    tx.mark_refunded(
        transaction_id,
        RefundInfo {
            refunded_at: now,
            reason: reason.to_string(),
            refund_transaction_id: refund.id,
        },
    )?;

    Ok(RefundResult {
        refund_transaction_id: refund.id,
        original_transaction_id: transaction_id,
        refund_amount: refund.amount,
        balance: refund.balance_after,
        refunded_asset,
        reclaimed_quantity,
        unlock_revoked,
        ticket_returned,
    })
}
