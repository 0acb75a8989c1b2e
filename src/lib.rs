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
//! # Wallet Engine
//!
//! This library provides the transaction core of a coin-based wallet: coin
//! balances with an auditable ledger, asset inventories, character unlocks,
//! purchases, and refunds, all made idempotent per caller-supplied key.
//!
//! ## Core Components
//!
//! - [`Engine`]: Entry point wiring every component together
//! - [`IdempotencyGate`]: At-most-once execution per key, in-process and across processes
//! - [`WalletLedger`]: Balances, the append-only ledger, and the atomic per-user update
//! - [`PurchaseOrchestrator`]: Price lookup, debit, and grant in one atomic update
//! - [`RefundEngine`]: Reverses refundable debits within a time window
//! - [`PricingResolver`]: Cached catalog prices with a built-in fallback
//! - [`Store`]: Persistence seam, with [`MemoryStore`] as the in-process backend
//!
//! ## Example
//!
//! ```
//! use wallet_engine_rs::{Engine, Provenance, PurchaseRequest, UserId};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let engine = Engine::in_memory();
//! let user = UserId::new("user-1");
//!
//! engine.credit(&user, 500, "welcome bonus", None).await.unwrap();
//!
//! let request = PurchaseRequest::new("video-unlock-5");
//! let first = engine.purchase(&user, &request, "order-1").await.unwrap();
//! let retry = engine.purchase(&user, &request, "order-1").await.unwrap();
//!
//! assert_eq!(first.provenance, Provenance::Fresh);
//! assert_eq!(retry.provenance, Provenance::CachedLocal);
//! assert_eq!(retry.value, first.value);
//! assert_eq!(engine.balance(&user).await.unwrap(), 450);
//! # });
//! ```
//!
//! ## Thread Safety
//!
//! All components are `Send + Sync`. Mutations to one user are linearized by
//! optimistic commits on the store; different users never contend.

pub mod account;
mod base;
pub mod clock;
pub mod config;
mod engine;
pub mod error;
pub mod idempotency;
pub mod inventory;
pub mod ledger;
pub mod legacy;
pub mod orchestrator;
pub mod pricing;
pub mod refund;
pub mod store;
mod transaction;

pub use account::Account;
pub use base::{AssetType, CharacterId, Sku, TransactionId, UserId};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, RetryPolicy};
pub use engine::Engine;
pub use error::{EngineError, ErrorResponse};
pub use idempotency::{GateStats, IdempotencyGate, Idempotent, Provenance};
pub use inventory::{AssetInventory, UnlockState};
pub use ledger::{HistoryFilter, LedgerEvent, LedgerStats, UserTransaction, WalletLedger};
pub use legacy::LegacyAssetView;
pub use orchestrator::{PurchaseOrchestrator, PurchaseRequest, PurchaseResult};
pub use pricing::{CatalogItem, ItemKind, PriceSource, PricingResolver, StaticPriceSource};
pub use refund::{RefundEngine, RefundOptions, RefundResult};
pub use store::{FailPoint, MemoryStore, Store};
pub use transaction::{
    LedgerEntry, PaymentMethod, RefundInfo, RefundedAsset, TransactionMetadata,
    TransactionStatus, TransactionType,
};
