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

//! Purchase orchestration.
//!
//! A purchase resolves its price first, then performs every check and write in
//! one atomic user update: balance sufficiency, the already-unlocked check,
//! the debit with its ledger entry, and the asset grant or unlock.

use crate::base::{AssetType, CharacterId, Sku, TransactionId, UserId};
use crate::error::EngineError;
use crate::ledger::{UserTransaction, WalletLedger};
use crate::pricing::{CatalogItem, ItemKind, PricingResolver};
use crate::transaction::{LedgerEntry, PaymentMethod, TransactionMetadata, TransactionType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// What the user asked to buy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub sku: Sku,
    /// Required for unlocks and gifts.
    pub character_id: Option<CharacterId>,
    /// Coins by default; a ticket is accepted for permanent unlocks only.
    #[serde(default)]
    pub payment: PaymentMethod,
}

impl PurchaseRequest {
    pub fn new(sku: impl Into<String>) -> Self {
        Self {
            sku: Sku::new(sku),
            character_id: None,
            payment: PaymentMethod::Coins,
        }
    }

    pub fn for_character(mut self, character_id: impl Into<String>) -> Self {
        self.character_id = Some(CharacterId::new(character_id));
        self
    }

    pub fn with_ticket(mut self) -> Self {
        self.payment = PaymentMethod::Ticket;
        self
    }
}

/// Assets added by an asset-pack purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetGrant {
    pub asset_type: AssetType,
    pub quantity: u64,
    /// Quantity held after the grant.
    pub total: u64,
}

/// Character access granted by an unlock purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockGrant {
    pub character_id: CharacterId,
    pub permanent: bool,
    /// New end of the timed unlock; `None` for permanent unlocks.
    pub until: Option<DateTime<Utc>>,
}

/// Outcome of a purchase, as cached under its idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseResult {
    /// The debit entry written for this purchase.
    pub transaction_id: TransactionId,
    pub user_id: UserId,
    pub sku: Sku,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    /// Coins debited; 0 when paid with a ticket.
    pub cost: u64,
    /// Balance right after the purchase.
    pub balance: u64,
    pub asset: Option<AssetGrant>,
    pub unlock: Option<UnlockGrant>,
    pub payment: PaymentMethod,
}

impl PurchaseResult {
    fn from_entry(entry: &LedgerEntry, sku: &Sku, payment: PaymentMethod) -> Self {
        Self {
            transaction_id: entry.id,
            user_id: entry.user_id.clone(),
            sku: sku.clone(),
            kind: entry.kind,
            cost: entry.amount,
            balance: entry.balance_after,
            asset: None,
            unlock: None,
            payment,
        }
    }
}

/// Turns catalog items into ledger debits plus their grants.
pub struct PurchaseOrchestrator {
    ledger: Arc<WalletLedger>,
    pricing: Arc<PricingResolver>,
}

impl PurchaseOrchestrator {
    pub fn new(ledger: Arc<WalletLedger>, pricing: Arc<PricingResolver>) -> Self {
        Self { ledger, pricing }
    }

    /// Buys `request.sku` for `user_id`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] / [`EngineError::InactiveSku`] - unknown or retired SKU.
    /// - [`EngineError::MissingParameter`] - unlocks and gifts need a character.
    /// - [`EngineError::InsufficientFunds`] - balance below the price.
    /// - [`EngineError::InsufficientInventory`] - ticket payment without a ticket.
    /// - [`EngineError::AlreadyUnlocked`] - permanent unlock already held.
    pub async fn purchase(
        &self,
        user_id: &UserId,
        request: &PurchaseRequest,
    ) -> Result<PurchaseResult, EngineError> {
        let item = self.pricing.resolve(&request.sku).await?;
        let character = match (&request.character_id, item.needs_character()) {
            (Some(id), true) if !id.0.trim().is_empty() => Some(id),
            (_, true) => return Err(EngineError::MissingParameter("character_id")),
            (_, false) => None,
        };
        if request.payment == PaymentMethod::Ticket && item.kind != ItemKind::PermanentUnlock {
            return Err(EngineError::InvalidArgument(
                "only permanent unlocks can be paid with a ticket".into(),
            ));
        }

        let result = self
            .ledger
            .with_atomic_user_update(user_id, |tx| {
                apply_purchase(tx, &item, character, request.payment)
            })
            .await?;

        info!(
            user_id = %user_id,
            sku = %item.sku,
            transaction_id = %result.transaction_id,
            cost = result.cost,
            balance = result.balance,
            "purchase completed"
        );
        Ok(result)
    }

    /// Credits a coin package after its external payment was confirmed.
    pub async fn top_up(&self, user_id: &UserId, sku: &Sku) -> Result<LedgerEntry, EngineError> {
        let item = self.pricing.resolve(sku).await?;
        let ItemKind::CoinPackage { coins } = item.kind else {
            return Err(EngineError::InvalidArgument(format!(
                "{sku} is not a coin package"
            )));
        };
        self.ledger
            .with_atomic_user_update(user_id, |tx| {
                tx.credit(
                    TransactionType::Admin,
                    coins,
                    TransactionMetadata::Admin {
                        reason: "coin package purchase".into(),
                        package: Some(sku.clone()),
                    },
                )
            })
            .await
    }
}

fn apply_purchase(
    tx: &mut UserTransaction<'_>,
    item: &CatalogItem,
    character: Option<&CharacterId>,
    payment: PaymentMethod,
) -> Result<PurchaseResult, EngineError> {
    let sku = item.sku.clone();
    match (&item.kind, character) {
        (ItemKind::AssetPack { asset_type, quantity }, _) => {
            let entry = tx.debit(
                TransactionType::Purchase,
                item.price,
                TransactionMetadata::Purchase {
                    sku: sku.clone(),
                    asset_type: *asset_type,
                    quantity: *quantity,
                },
            )?;
            let total = tx.grant_asset(*asset_type, *quantity)?;
            let mut result = PurchaseResult::from_entry(&entry, &sku, payment);
            result.asset = Some(AssetGrant {
                asset_type: *asset_type,
                quantity: *quantity,
                total,
            });
            Ok(result)
        }
        (ItemKind::PermanentUnlock, Some(character)) => {
            // Checked against the same snapshot the debit commits on.
            tx.unlock_state_mut(character).unlock_permanently()?;
            let cost = match payment {
                PaymentMethod::Coins => item.price,
                PaymentMethod::Ticket => {
                    tx.consume_asset(AssetType::CharacterUnlockCard, 1)?;
                    0
                }
            };
            let entry = tx.debit(
                TransactionType::Unlock,
                cost,
                TransactionMetadata::Unlock {
                    sku: sku.clone(),
                    character_id: character.clone(),
                    permanent: true,
                    until: None,
                    days: None,
                    payment,
                },
            )?;
            let mut result = PurchaseResult::from_entry(&entry, &sku, payment);
            result.unlock = Some(UnlockGrant {
                character_id: character.clone(),
                permanent: true,
                until: None,
            });
            Ok(result)
        }
        (ItemKind::TimedUnlock { days }, Some(character)) => {
            if tx.unlock_state(character).is_some_and(|s| s.permanent_unlock) {
                return Err(EngineError::AlreadyUnlocked);
            }
            let now = tx.now();
            let until = tx
                .unlock_state_mut(character)
                .extend(now, chrono::Duration::days(i64::from(*days)));
            let entry = tx.debit(
                TransactionType::Unlock,
                item.price,
                TransactionMetadata::Unlock {
                    sku: sku.clone(),
                    character_id: character.clone(),
                    permanent: false,
                    until: Some(until),
                    days: Some(*days),
                    payment,
                },
            )?;
            let mut result = PurchaseResult::from_entry(&entry, &sku, payment);
            result.unlock = Some(UnlockGrant {
                character_id: character.clone(),
                permanent: false,
                until: Some(until),
            });
            Ok(result)
        }
        (ItemKind::Gift { gift_id }, Some(character)) => {
            let entry = tx.debit(
                TransactionType::Gift,
                item.price,
                TransactionMetadata::Gift {
                    sku: sku.clone(),
                    gift_id: gift_id.clone(),
                    character_id: character.clone(),
                },
            )?;
            Ok(PurchaseResult::from_entry(&entry, &sku, payment))
        }
        (ItemKind::Feature, _) => {
            let entry = tx.debit(
                TransactionType::Spend,
                item.price,
                TransactionMetadata::Spend { sku: sku.clone() },
            )?;
            Ok(PurchaseResult::from_entry(&entry, &sku, payment))
        }
        (ItemKind::CoinPackage { .. }, _) => Err(EngineError::InvalidArgument(
            "coin packages are credited through top-up".into(),
        )),
        (_, None) => Err(EngineError::MissingParameter("character_id")),
    }
}
