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

//! Legacy-shaped asset views.
//!
//! Older readers expect each asset twice: as a flattened `assets.<plural>`
//! field on the user record, and as a normalized per-type record. Both shapes
//! are derived here from the one canonical [`AssetInventory`], so they cannot
//! disagree.

use crate::base::AssetType;
use crate::inventory::AssetInventory;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetRecord {
    pub id: &'static str,
    pub asset_type: AssetType,
    pub quantity: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LegacyAssetView {
    /// `assets.<field_name>` → quantity.
    pub flattened: BTreeMap<String, u64>,
    pub records: Vec<AssetRecord>,
}

impl LegacyAssetView {
    /// Builds both shapes for every asset type, zero quantities included.
    pub fn from_inventory(inventory: &AssetInventory) -> Self {
        let mut view = Self::default();
        for asset_type in AssetType::ALL {
            let quantity = inventory.quantity(asset_type);
            view.flattened
                .insert(format!("assets.{}", asset_type.field_name()), quantity);
            view.records.push(AssetRecord {
                id: asset_type.record_name(),
                asset_type,
                quantity,
            });
        }
        view
    }

    pub fn record(&self, asset_type: AssetType) -> Option<&AssetRecord> {
        self.records.iter().find(|r| r.asset_type == asset_type)
    }
}
