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

//! Asset inventory and unlock state.
//!
//! Both are plain values owned by an [`Account`](crate::Account); they are only
//! ever mutated on a working copy inside an atomic user update, so a failed
//! operation never leaves a partial change behind.

use crate::base::AssetType;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical per-user asset quantities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetInventory {
    quantities: BTreeMap<AssetType, u64>,
}

impl AssetInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quantity(&self, asset_type: AssetType) -> u64 {
        self.quantities.get(&asset_type).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (AssetType, u64)> + '_ {
        self.quantities.iter().map(|(k, v)| (*k, *v))
    }

    /// Adds `quantity` units, returning the new quantity.
    pub fn grant(&mut self, asset_type: AssetType, quantity: u64) -> Result<u64, EngineError> {
        if quantity == 0 {
            return Err(EngineError::InvalidArgument(
                "asset quantity must be positive".into(),
            ));
        }
        let current = self.quantity(asset_type);
        let updated = current
            .checked_add(quantity)
            .ok_or_else(|| EngineError::InvalidArgument("asset quantity overflow".into()))?;
        self.quantities.insert(asset_type, updated);
        Ok(updated)
    }

    /// Removes exactly `quantity` units or fails without touching the inventory.
    pub fn consume(&mut self, asset_type: AssetType, quantity: u64) -> Result<u64, EngineError> {
        if quantity == 0 {
            return Err(EngineError::InvalidArgument(
                "asset quantity must be positive".into(),
            ));
        }
        let current = self.quantity(asset_type);
        if current < quantity {
            return Err(EngineError::InsufficientInventory {
                required: quantity,
                available: current,
            });
        }
        self.quantities.insert(asset_type, current - quantity);
        Ok(current - quantity)
    }

    /// Removes up to `quantity` units, stopping at zero.
    ///
    /// Returns the number of units actually removed.
    pub fn reclaim(&mut self, asset_type: AssetType, quantity: u64) -> u64 {
        let current = self.quantity(asset_type);
        let removed = current.min(quantity);
        self.quantities.insert(asset_type, current - removed);
        removed
    }
}

/// Access a user holds to one character's conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockState {
    pub permanent_unlock: bool,
    pub temporary_unlock_until: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl UnlockState {
    pub fn is_unlocked_at(&self, now: DateTime<Utc>) -> bool {
        self.permanent_unlock || self.temporary_unlock_until.is_some_and(|until| until > now)
    }

    pub fn unlock_permanently(&mut self) -> Result<(), EngineError> {
        if self.permanent_unlock {
            return Err(EngineError::AlreadyUnlocked);
        }
        self.permanent_unlock = true;
        self.refunded_at = None;
        Ok(())
    }

    /// Extends a timed unlock by `by`, starting from `now` or the current expiry, whichever is later.
    pub fn extend(&mut self, now: DateTime<Utc>, by: chrono::Duration) -> DateTime<Utc> {
        let start = match self.temporary_unlock_until {
            Some(until) if until > now => until,
            _ => now,
        };
        let until = start + by;
        self.temporary_unlock_until = Some(until);
        until
    }

    /// Takes `by` back off a timed unlock. The unlock never ends before `now`;
    /// if nothing remains past `now` it is cleared.
    pub fn shorten(&mut self, now: DateTime<Utc>, by: chrono::Duration) {
        self.temporary_unlock_until = self
            .temporary_unlock_until
            .map(|until| until - by)
            .filter(|until| *until > now);
    }

    /// Clears the permanent flag and stamps the refund time.
    pub fn revoke(&mut self, at: DateTime<Utc>) {
        self.permanent_unlock = false;
        self.refunded_at = Some(at);
    }
}
