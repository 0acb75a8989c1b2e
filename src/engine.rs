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

//! Wallet engine.
//!
//! The [`Engine`] is the entry point callers use. It wires the components
//! together and runs every mutating operation through the idempotency gate.
//!
//! # Operations
//!
//! | Operation | Ledger type | Idempotency key |
//! |-----------|-------------|-----------------|
//! | [`purchase`](Engine::purchase) | PURCHASE, UNLOCK, SPEND, GIFT | required |
//! | [`refund`](Engine::refund) | REFUND | optional |
//! | [`top_up`](Engine::top_up) | ADMIN | required |
//! | [`credit`](Engine::credit) | ADMIN | optional |
//! | [`deduct`](Engine::deduct) | DEDUCT | optional |
//!
//! # Thread Safety
//!
//! The engine is `Send + Sync` and meant to be shared behind an [`Arc`].
//! Operations on different users never contend; operations on one user are
//! linearized by the store's optimistic commit.

use crate::base::{Sku, TransactionId, UserId};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::idempotency::{IdempotencyGate, Idempotent, Provenance};
use crate::ledger::{LedgerEvent, WalletLedger};
use crate::legacy::LegacyAssetView;
use crate::orchestrator::{PurchaseOrchestrator, PurchaseRequest, PurchaseResult};
use crate::pricing::{PriceSource, PricingResolver};
use crate::refund::{RefundEngine, RefundOptions, RefundResult};
use crate::store::{MemoryStore, Store};
use crate::transaction::LedgerEntry;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Wallet engine.
///
/// Owns one idempotency gate and one ledger over a shared [`Store`]. Several
/// engines over the same store behave like several processes: a key is
/// still executed once.
pub struct Engine {
    /// Per-user atomic updates and the ledger itself.
    ledger: Arc<WalletLedger>,
    /// Deduplicates keyed operations.
    gate: IdempotencyGate,
    /// Purchases and top-ups.
    orchestrator: Arc<PurchaseOrchestrator>,
    /// Refunds of debit entries.
    refunds: Arc<RefundEngine>,
    /// Catalog lookups shared with the orchestrator.
    pricing: Arc<PricingResolver>,
    config: EngineConfig,
}

impl Engine {
    /// Creates an engine on `store` with the system clock and built-in prices.
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        Self::with_parts(store, Arc::new(SystemClock), None, config)
    }

    pub fn with_parts(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        price_source: Option<Arc<dyn PriceSource>>,
        config: EngineConfig,
    ) -> Self {
        let ledger = Arc::new(WalletLedger::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.retry.clone(),
        ));
        let pricing = Arc::new(PricingResolver::new(
            price_source,
            Arc::clone(&clock),
            config.price_cache_ttl,
        ));
        Self {
            gate: IdempotencyGate::new(store, clock, config.clone()),
            orchestrator: Arc::new(PurchaseOrchestrator::new(
                Arc::clone(&ledger),
                Arc::clone(&pricing),
            )),
            refunds: Arc::new(RefundEngine::new(
                Arc::clone(&ledger),
                config.refund_window_days,
            )),
            ledger,
            pricing,
            config,
        }
    }

    /// Engine on a fresh [`MemoryStore`] with default configuration.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), EngineConfig::default())
    }

    /// Starts background maintenance. Requires a Tokio runtime.
    pub fn start(&self) {
        self.gate.start();
    }

    pub fn stop(&self) {
        self.gate.stop();
    }

    pub fn ledger(&self) -> &WalletLedger {
        &self.ledger
    }

    pub fn gate(&self) -> &IdempotencyGate {
        &self.gate
    }

    pub fn pricing(&self) -> &PricingResolver {
        &self.pricing
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.ledger.subscribe()
    }

    /// Buys `request.sku` at most once per `idempotency_key`.
    ///
    /// # Errors
    ///
    /// See [`PurchaseOrchestrator::purchase`] and [`IdempotencyGate::execute`].
    pub async fn purchase(
        &self,
        user_id: &UserId,
        request: &PurchaseRequest,
        idempotency_key: &str,
    ) -> Result<Idempotent<PurchaseResult>, EngineError> {
        let key = scoped_key("purchase", user_id, Some(idempotency_key))?;
        let orchestrator = Arc::clone(&self.orchestrator);
        let (user_id, request) = (user_id.clone(), request.clone());
        self.gate
            .execute(&key, self.config.purchase_ttl, move || async move {
                orchestrator.purchase(&user_id, &request).await
            })
            .await
    }

    /// Refunds `transaction_id`.
    ///
    /// Without `options.idempotency_key` the refund is not deduplicated by key;
    /// a repeated call fails with [`EngineError::AlreadyRefunded`].
    pub async fn refund(
        &self,
        user_id: &UserId,
        transaction_id: TransactionId,
        reason: &str,
        options: &RefundOptions,
    ) -> Result<Idempotent<RefundResult>, EngineError> {
        let refunds = Arc::clone(&self.refunds);
        let (owner, reason_owned, options_owned) =
            (user_id.clone(), reason.to_string(), options.clone());
        self.maybe_gated(
            "refund",
            user_id,
            options.idempotency_key.as_deref(),
            self.config.refund_ttl,
            move || async move {
                refunds
                    .refund(&owner, transaction_id, &reason_owned, &options_owned)
                    .await
            },
        )
        .await
    }

    /// Credits a confirmed coin package.
    pub async fn top_up(
        &self,
        user_id: &UserId,
        package: &Sku,
        idempotency_key: &str,
    ) -> Result<Idempotent<LedgerEntry>, EngineError> {
        let key = scoped_key("topup", user_id, Some(idempotency_key))?;
        let orchestrator = Arc::clone(&self.orchestrator);
        let (user_id, package) = (user_id.clone(), package.clone());
        self.gate
            .execute(&key, self.config.purchase_ttl, move || async move {
                orchestrator.top_up(&user_id, &package).await
            })
            .await
    }

    /// Administrative credit.
    pub async fn credit(
        &self,
        user_id: &UserId,
        amount: u64,
        reason: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Idempotent<LedgerEntry>, EngineError> {
        let ledger = Arc::clone(&self.ledger);
        let (owner, reason) = (user_id.clone(), reason.to_string());
        self.maybe_gated(
            "credit",
            user_id,
            idempotency_key,
            self.config.purchase_ttl,
            move || async move { ledger.credit(&owner, amount, &reason).await },
        )
        .await
    }

    /// Administrative deduction.
    pub async fn deduct(
        &self,
        user_id: &UserId,
        amount: u64,
        reason: &str,
        idempotency_key: Option<&str>,
    ) -> Result<Idempotent<LedgerEntry>, EngineError> {
        let ledger = Arc::clone(&self.ledger);
        let (owner, reason) = (user_id.clone(), reason.to_string());
        self.maybe_gated(
            "deduct",
            user_id,
            idempotency_key,
            self.config.purchase_ttl,
            move || async move { ledger.deduct(&owner, amount, &reason).await },
        )
        .await
    }

    pub async fn balance(&self, user_id: &UserId) -> Result<u64, EngineError> {
        self.ledger.balance(user_id).await
    }

    pub async fn legacy_assets(&self, user_id: &UserId) -> Result<LegacyAssetView, EngineError> {
        let account = self.ledger.account(user_id).await?;
        Ok(LegacyAssetView::from_inventory(account.inventory()))
    }

    async fn maybe_gated<T, F, Fut>(
        &self,
        scope: &str,
        user_id: &UserId,
        idempotency_key: Option<&str>,
        ttl: Duration,
        operation: F,
    ) -> Result<Idempotent<T>, EngineError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        if idempotency_key.is_none() {
            return Ok(Idempotent {
                value: operation().await?,
                provenance: Provenance::Fresh,
            });
        }
        let key = scoped_key(scope, user_id, idempotency_key)?;
        self.gate.execute(&key, ttl, operation).await
    }
}

/// Namespaces a caller key by operation and user so keys never collide across either.
fn scoped_key(scope: &str, user_id: &UserId, key: Option<&str>) -> Result<String, EngineError> {
    match key.map(str::trim) {
        Some(key) if !key.is_empty() => Ok(format!("{scope}:{user_id}:{key}")),
        _ => Err(EngineError::InvalidArgument(
            "idempotency key must be a non-empty string".into(),
        )),
    }
}
