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

//! Ledger entries.
//!
//! An entry is immutable except for a single status transition:
//! - [`Completed`] → [`Refunded`] (via refund)
//!
//! [`Completed`]: TransactionStatus::Completed
//! [`Refunded`]: TransactionStatus::Refunded

use crate::base::{AssetType, CharacterId, Sku, TransactionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Purchase,
    Spend,
    Refund,
    Admin,
    Gift,
    Unlock,
    Deduct,
}

impl TransactionType {
    pub const ALL: [TransactionType; 7] = [
        Self::Purchase,
        Self::Spend,
        Self::Refund,
        Self::Admin,
        Self::Gift,
        Self::Unlock,
        Self::Deduct,
    ];

    /// Credits raise the balance; everything else lowers it.
    pub fn is_credit(&self) -> bool {
        matches!(self, Self::Refund | Self::Admin)
    }

    pub fn is_refundable(&self) -> bool {
        matches!(
            self,
            Self::Purchase | Self::Gift | Self::Unlock | Self::Deduct
        )
    }

    /// `amount` with the sign implied by this type.
    pub fn signed(&self, amount: u64) -> i128 {
        if self.is_credit() {
            i128::from(amount)
        } else {
            -i128::from(amount)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Completed,
    Refunded,
}

/// How an unlock was paid for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    #[default]
    Coins,
    Ticket,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundedAsset {
    pub asset_type: AssetType,
    pub quantity: u64,
}

/// Per-type payload of a ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionMetadata {
    Purchase {
        sku: Sku,
        asset_type: AssetType,
        quantity: u64,
    },
    Unlock {
        sku: Sku,
        character_id: CharacterId,
        permanent: bool,
        /// End of the timed unlock this entry granted.
        until: Option<DateTime<Utc>>,
        /// Days this entry added to a timed unlock.
        #[serde(default)]
        days: Option<u32>,
        payment: PaymentMethod,
    },
    Spend {
        sku: Sku,
    },
    Gift {
        sku: Sku,
        gift_id: String,
        character_id: CharacterId,
    },
    Admin {
        reason: String,
        package: Option<Sku>,
    },
    Deduct {
        reason: String,
    },
    Refund {
        original_transaction_id: TransactionId,
        reason: String,
        refunded_asset: Option<RefundedAsset>,
        /// Quantity actually taken back when the user had already consumed some.
        reclaimed_quantity: u64,
    },
    /// Untyped records written before metadata was structured.
    Legacy { fields: serde_json::Value },
}

impl TransactionMetadata {
    /// Asset grant carried by this entry, if any.
    pub fn asset_grant(&self) -> Option<(AssetType, u64)> {
        match self {
            Self::Purchase {
                asset_type,
                quantity,
                ..
            } => Some((*asset_type, *quantity)),
            Self::Legacy { fields } => {
                let asset_type = serde_json::from_value(fields.get("assetType")?.clone()).ok()?;
                let quantity = fields.get("quantity").and_then(|q| q.as_u64()).unwrap_or(1);
                Some((asset_type, quantity))
            }
            _ => None,
        }
    }
}

/// Set once when an entry is refunded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundInfo {
    pub refunded_at: DateTime<Utc>,
    pub reason: String,
    pub refund_transaction_id: TransactionId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: TransactionId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: u64,
    pub balance_before: u64,
    pub balance_after: u64,
    pub metadata: TransactionMetadata,
    pub status: TransactionStatus,
    pub refund: Option<RefundInfo>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn signed_amount(&self) -> i128 {
        self.kind.signed(self.amount)
    }

    /// `balance_after == balance_before ± amount` per the sign of the type.
    pub fn is_consistent(&self) -> bool {
        i128::from(self.balance_before) + self.signed_amount() == i128::from(self.balance_after)
    }
}
