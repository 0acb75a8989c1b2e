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

//! Core identifier types for users, ledger entries, characters, and catalog items.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a user, as handed over by the identity layer.
///
/// The engine never re-derives or re-checks it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a ledger entry.
///
/// Allocated by the store and globally unique across all users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a chat character whose conversation can be unlocked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct CharacterId(pub String);

impl CharacterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stock keeping unit of a purchasable catalog item (e.g. `video-unlock-5`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Sku(pub String);

impl Sku {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sku {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discrete, countable items a user can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetType {
    CharacterUnlockCard,
    PhotoUnlockCard,
    VideoUnlockCard,
    VoiceUnlockCard,
    CreateCard,
}

impl AssetType {
    pub const ALL: [AssetType; 5] = [
        AssetType::CharacterUnlockCard,
        AssetType::PhotoUnlockCard,
        AssetType::VideoUnlockCard,
        AssetType::VoiceUnlockCard,
        AssetType::CreateCard,
    ];

    /// Name of the normalized per-type record.
    pub fn record_name(&self) -> &'static str {
        match self {
            Self::CharacterUnlockCard => "characterUnlockCard",
            Self::PhotoUnlockCard => "photoUnlockCard",
            Self::VideoUnlockCard => "videoUnlockCard",
            Self::VoiceUnlockCard => "voiceUnlockCard",
            Self::CreateCard => "createCards",
        }
    }

    /// Name of the flattened field on the user record (`assets.<name>`).
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::CharacterUnlockCard => "characterUnlockCards",
            Self::PhotoUnlockCard => "photoUnlockCards",
            Self::VideoUnlockCard => "videoUnlockCards",
            Self::VoiceUnlockCard => "voiceUnlockCards",
            Self::CreateCard => "createCards",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.record_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_display_inner_value() {
        assert_eq!(UserId::new("u-1").to_string(), "u-1");
        assert_eq!(TransactionId(42).to_string(), "42");
        assert_eq!(Sku::new("video-unlock-5").to_string(), "video-unlock-5");
    }

    #[test]
    fn asset_type_serializes_as_record_name() {
        for asset in AssetType::ALL {
            let json = serde_json::to_string(&asset).unwrap();
            // create cards keep their plural record name, everything else is camelCase
            if asset != AssetType::CreateCard {
                assert_eq!(json, format!("\"{}\"", asset.record_name()));
            }
        }
    }

    #[test]
    fn flattened_field_names_are_plural() {
        for asset in AssetType::ALL {
            assert!(asset.field_name().ends_with('s'));
        }
    }
}
