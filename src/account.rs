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

//! Per-user account record: wallet balance, asset inventory, and unlock state.
//!
//! This is the unit of contention. All three parts live in one record so a
//! single optimistic commit covers every mutation a purchase or refund makes.
//!
//! # Example
//!
//! ```
//! use wallet_engine_rs::{Account, UserId};
//!
//! let account = Account::new(UserId::new("user-1"));
//! assert_eq!(account.balance(), 0);
//! ```

use crate::base::{AssetType, CharacterId, UserId};
use crate::error::EngineError;
use crate::inventory::{AssetInventory, UnlockState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    user_id: UserId,
    balance: u64,
    inventory: AssetInventory,
    unlocks: BTreeMap<CharacterId, UnlockState>,
}

impl Account {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: 0,
            inventory: AssetInventory::new(),
            unlocks: BTreeMap::new(),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn balance(&self) -> u64 {
        self.balance
    }

    pub fn inventory(&self) -> &AssetInventory {
        &self.inventory
    }

    pub fn asset_quantity(&self, asset_type: AssetType) -> u64 {
        self.inventory.quantity(asset_type)
    }

    pub fn unlock_state(&self, character_id: &CharacterId) -> Option<&UnlockState> {
        self.unlocks.get(character_id)
    }

    pub fn unlocks(&self) -> impl Iterator<Item = (&CharacterId, &UnlockState)> {
        self.unlocks.iter()
    }

    pub(crate) fn inventory_mut(&mut self) -> &mut AssetInventory {
        &mut self.inventory
    }

    pub(crate) fn unlock_state_mut(&mut self, character_id: &CharacterId) -> &mut UnlockState {
        self.unlocks.entry(character_id.clone()).or_default()
    }

    /// Increases the balance, returning the new balance.
    pub(crate) fn credit(&mut self, amount: u64) -> Result<u64, EngineError> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| EngineError::InvalidArgument("balance overflow".into()))?;
        Ok(self.balance)
    }

    /// Decreases the balance, returning the new balance.
    pub(crate) fn debit(&mut self, amount: u64) -> Result<u64, EngineError> {
        if self.balance < amount {
            return Err(EngineError::InsufficientFunds {
                required: amount,
                available: self.balance,
            });
        }
        self.balance -= amount;
        Ok(self.balance)
    }
}
