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

//! Catalog and price resolution.
//!
//! Prices come from a [`PriceSource`] and are cached for a short TTL. When the
//! source fails or returns nothing, the built-in catalog is used instead and
//! the fallback is not cached, so the next lookup tries the source again.

use crate::base::{AssetType, Sku};
use crate::clock::Clock;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What buying a catalog item does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemKind {
    /// Grants `quantity` units of an asset.
    AssetPack { asset_type: AssetType, quantity: u64 },
    /// Unlocks a character forever.
    PermanentUnlock,
    /// Unlocks a character for `days`, stacking on an active unlock.
    TimedUnlock { days: u32 },
    /// One-off paid feature use.
    Feature,
    /// Gift sent to a character.
    Gift { gift_id: String },
    /// Coins credited after an external payment.
    CoinPackage { coins: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub sku: Sku,
    pub name: String,
    /// Cost in coins. For coin packages this is the external price and is not charged.
    pub price: u64,
    #[serde(flatten)]
    pub kind: ItemKind,
    #[serde(default = "active_by_default")]
    pub active: bool,
}

fn active_by_default() -> bool {
    true
}

impl CatalogItem {
    pub fn new(sku: &str, name: &str, price: u64, kind: ItemKind) -> Self {
        Self {
            sku: Sku::new(sku),
            name: name.to_string(),
            price,
            kind,
            active: true,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Whether buying this item needs a target character.
    pub fn needs_character(&self) -> bool {
        matches!(
            self.kind,
            ItemKind::PermanentUnlock | ItemKind::TimedUnlock { .. } | ItemKind::Gift { .. }
        )
    }
}

pub type CatalogFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<CatalogItem>, EngineError>> + Send + 'a>>;

/// Remote pricing/config source.
pub trait PriceSource: Send + Sync {
    fn fetch_catalog(&self) -> CatalogFuture<'_>;
}

/// Source that always returns a fixed item list.
#[derive(Debug, Clone, Default)]
pub struct StaticPriceSource {
    items: Vec<CatalogItem>,
}

impl StaticPriceSource {
    pub fn new(items: Vec<CatalogItem>) -> Self {
        Self { items }
    }
}

impl PriceSource for StaticPriceSource {
    fn fetch_catalog(&self) -> CatalogFuture<'_> {
        Box::pin(async move { Ok(self.items.clone()) })
    }
}

/// Built-in catalog used when no source is configured or reachable.
pub fn builtin_catalog() -> Vec<CatalogItem> {
    use AssetType::*;
    let pack = |sku: &str, name: &str, price, asset_type, quantity| {
        CatalogItem::new(sku, name, price, ItemKind::AssetPack { asset_type, quantity })
    };
    let gift = |id: &str, name: &str, price| {
        CatalogItem::new(
            &format!("gift-{id}"),
            name,
            price,
            ItemKind::Gift {
                gift_id: id.to_string(),
            },
        )
    };
    let coins = |sku: &str, coins| {
        CatalogItem::new(sku, &format!("{coins} coins"), 0, ItemKind::CoinPackage { coins })
    };

    vec![
        CatalogItem::new("ai_photo", "AI photo", 25, ItemKind::Feature),
        CatalogItem::new("ai_video", "AI video", 60, ItemKind::Feature),
        CatalogItem::new(
            "character_unlock_ticket",
            "7-day character unlock",
            100,
            ItemKind::TimedUnlock { days: 7 },
        ),
        CatalogItem::new(
            "character_unlock_permanent",
            "Permanent character unlock",
            250,
            ItemKind::PermanentUnlock,
        ),
        pack("character-unlock-1", "Character unlock card", 200, CharacterUnlockCard, 1),
        pack("photo-unlock-1", "Photo unlock card", 10, PhotoUnlockCard, 1),
        pack("photo-unlock-5", "Photo unlock cards x5", 45, PhotoUnlockCard, 5),
        pack("video-unlock-1", "Video unlock card", 12, VideoUnlockCard, 1),
        pack("video-unlock-5", "Video unlock cards x5", 50, VideoUnlockCard, 5),
        pack("video-unlock-10", "Video unlock cards x10", 90, VideoUnlockCard, 10),
        pack("voice-unlock-1", "Voice unlock card", 8, VoiceUnlockCard, 1),
        pack("create-1", "Character creation card", 80, CreateCard, 1),
        gift("rose", "Rose", 15),
        gift("coffee", "Coffee", 20),
        gift("chocolate", "Chocolate", 25),
        gift("cake", "Cake", 40),
        gift("diamond", "Diamond", 120),
        coins("coins_30", 30),
        coins("coins_100", 110),
        coins("coins_300", 360),
        coins("coins_600", 750),
    ]
}

struct CachedCatalog {
    items: Arc<HashMap<Sku, CatalogItem>>,
    expires_at: DateTime<Utc>,
}

/// Resolves SKUs against a cached catalog.
pub struct PricingResolver {
    source: Option<Arc<dyn PriceSource>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    fallback: Arc<HashMap<Sku, CatalogItem>>,
    cache: RwLock<Option<CachedCatalog>>,
}

impl PricingResolver {
    pub fn new(source: Option<Arc<dyn PriceSource>>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            source,
            clock,
            ttl,
            fallback: Arc::new(index(builtin_catalog())),
            cache: RwLock::new(None),
        }
    }

    /// Looks up a purchasable item.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] - no such SKU.
    /// - [`EngineError::InactiveSku`] - the SKU exists but is not on sale.
    pub async fn resolve(&self, sku: &Sku) -> Result<CatalogItem, EngineError> {
        let catalog = self.catalog().await;
        let item = catalog
            .get(sku)
            .ok_or(EngineError::NotFound("catalog item"))?;
        if !item.active {
            return Err(EngineError::InactiveSku);
        }
        Ok(item.clone())
    }

    pub async fn price(&self, sku: &Sku) -> Result<u64, EngineError> {
        Ok(self.resolve(sku).await?.price)
    }

    /// Forces the next lookup to hit the source.
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }

    async fn catalog(&self) -> Arc<HashMap<Sku, CatalogItem>> {
        let now = self.clock.now();
        let cached = self
            .cache
            .read()
            .as_ref()
            .filter(|cached| cached.expires_at > now)
            .map(|cached| Arc::clone(&cached.items));
        if let Some(items) = cached {
            return items;
        }

        let Some(source) = &self.source else {
            return Arc::clone(&self.fallback);
        };
        match source.fetch_catalog().await {
            Ok(items) if !items.is_empty() => {
                debug!(items = items.len(), "catalog refreshed from price source");
                let items = Arc::new(index(items));
                let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
                *self.cache.write() = Some(CachedCatalog {
                    items: Arc::clone(&items),
                    expires_at: now + ttl,
                });
                items
            }
            Ok(_) => {
                warn!("price source returned an empty catalog, using built-in prices");
                Arc::clone(&self.fallback)
            }
            Err(e) => {
                warn!(error = %e, "price source unavailable, using built-in prices");
                Arc::clone(&self.fallback)
            }
        }
    }
}

fn index(items: Vec<CatalogItem>) -> HashMap<Sku, CatalogItem> {
    items.into_iter().map(|item| (item.sku.clone(), item)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSource {
        calls: AtomicU32,
        items: Vec<CatalogItem>,
        fail: bool,
    }

    impl PriceSource for CountingSource {
        fn fetch_catalog(&self) -> CatalogFuture<'_> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    return Err(EngineError::StoreUnavailable);
                }
                Ok(self.items.clone())
            })
        }
    }

    fn resolver(source: Arc<CountingSource>, clock: Arc<ManualClock>) -> PricingResolver {
        PricingResolver::new(Some(source), clock, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn builtin_catalog_without_source() {
        let resolver = PricingResolver::new(
            None,
            Arc::new(ManualClock::new(Utc::now())),
            Duration::from_secs(60),
        );
        let item = resolver.resolve(&Sku::new("video-unlock-5")).await.unwrap();
        assert_eq!(
            item.kind,
            ItemKind::AssetPack {
                asset_type: AssetType::VideoUnlockCard,
                quantity: 5
            }
        );
        assert_eq!(
            resolver.resolve(&Sku::new("nope")).await,
            Err(EngineError::NotFound("catalog item"))
        );
    }

    #[tokio::test]
    async fn source_prices_are_cached_until_ttl() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let source = Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            items: vec![CatalogItem::new("ai_photo", "AI photo", 30, ItemKind::Feature)],
            fail: false,
        });
        let resolver = resolver(source.clone(), clock.clone());

        assert_eq!(resolver.price(&Sku::new("ai_photo")).await, Ok(30));
        assert_eq!(resolver.price(&Sku::new("ai_photo")).await, Ok(30));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        clock.advance(chrono::Duration::seconds(61));
        resolver.price(&Sku::new("ai_photo")).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_source_falls_back_uncached() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let source = Arc::new(CountingSource {
            calls: AtomicU32::new(0),
            items: Vec::new(),
            fail: true,
        });
        let resolver = resolver(source.clone(), clock);

        assert_eq!(resolver.price(&Sku::new("ai_photo")).await, Ok(25));
        assert_eq!(resolver.price(&Sku::new("ai_photo")).await, Ok(25));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn inactive_items_are_rejected() {
        let source = Arc::new(StaticPriceSource::new(vec![
            CatalogItem::new("ai_photo", "AI photo", 25, ItemKind::Feature).inactive(),
        ]));
        let resolver = PricingResolver::new(
            Some(source),
            Arc::new(ManualClock::new(Utc::now())),
            Duration::from_secs(60),
        );
        assert_eq!(
            resolver.resolve(&Sku::new("ai_photo")).await,
            Err(EngineError::InactiveSku)
        );
    }

    #[test]
    fn catalog_item_deserializes_with_defaults() {
        let item: CatalogItem = serde_json::from_str(
            r#"{"sku":"gift-rose","name":"Rose","price":15,"kind":"gift","gift_id":"rose"}"#,
        )
        .unwrap();
        assert!(item.active);
        assert!(item.needs_character());
    }
}
