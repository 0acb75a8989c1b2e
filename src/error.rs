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

//! Error types for wallet operations.
//!
//! Errors fall into four groups:
//!
//! | Group | Variants | Retryable |
//! |-------|----------|-----------|
//! | Validation | `InvalidArgument`, `MissingParameter` | no |
//! | Business | `InsufficientFunds`, `InsufficientInventory`, `AlreadyUnlocked`, ... | no |
//! | Concurrency | `TransactionConflict` | retried internally |
//! | Infrastructure | `StoreUnavailable`, `Timeout` | yes |

use serde::Serialize;
use thiserror::Error;

/// Wallet engine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// An argument was present but malformed (e.g. empty idempotency key)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A parameter required by the requested operation was not supplied
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    /// Debit would exceed the current balance
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    /// Consuming an asset would take its quantity below zero
    #[error("insufficient inventory: required {required}, available {available}")]
    InsufficientInventory { required: u64, available: u64 },

    /// The character is already permanently unlocked for this user
    #[error("character already unlocked")]
    AlreadyUnlocked,

    /// The ledger entry has already been refunded
    #[error("transaction already refunded")]
    AlreadyRefunded,

    /// The refund window for the ledger entry has passed
    #[error("refund window of {window_days} days expired ({elapsed_days} days elapsed)")]
    RefundWindowExpired { window_days: u32, elapsed_days: i64 },

    /// Only debits of a refundable type can be refunded
    #[error("transaction type does not support refunds")]
    UnsupportedTransactionType,

    /// Referenced ledger entry, user, or catalog item does not exist
    #[error("{0} not found")]
    NotFound(&'static str),

    /// User does not own the referenced ledger entry
    #[error("user does not own this transaction")]
    OwnerMismatch,

    /// The catalog item exists but is not on sale
    #[error("catalog item is not active")]
    InactiveSku,

    /// Optimistic concurrency conflict on commit
    #[error("transaction conflict")]
    TransactionConflict,

    /// The persistent store could not be reached
    #[error("store unavailable")]
    StoreUnavailable,

    /// The operation did not complete in time
    #[error("operation timed out")]
    Timeout,
}

impl EngineError {
    /// Stable error code exposed to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::MissingParameter(_) => "MISSING_PARAMETER",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_BALANCE",
            Self::InsufficientInventory { .. } => "INSUFFICIENT_INVENTORY",
            Self::AlreadyUnlocked => "ALREADY_UNLOCKED",
            Self::AlreadyRefunded => "ALREADY_REFUNDED",
            Self::RefundWindowExpired { .. } => "REFUND_WINDOW_EXPIRED",
            Self::UnsupportedTransactionType => "UNSUPPORTED_TRANSACTION_TYPE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::OwnerMismatch => "OWNER_MISMATCH",
            Self::InactiveSku => "INACTIVE_SKU",
            Self::TransactionConflict => "TRANSACTION_CONFLICT",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
        }
    }

    /// Infrastructure failures are safe to retry with the same idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable | Self::Timeout)
    }

    /// Caller-facing representation without internal details.
    pub fn to_response(&self) -> ErrorResponse {
        let message = match self {
            Self::TransactionConflict | Self::StoreUnavailable => {
                "service temporarily unavailable, please retry".to_string()
            }
            other => other.to_string(),
        };
        ErrorResponse {
            code: self.code(),
            message,
            retryable: self.is_retryable(),
        }
    }
}

/// Serializable error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::EngineError;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            EngineError::InsufficientFunds {
                required: 300,
                available: 200
            }
            .to_string(),
            "insufficient balance: required 300, available 200"
        );
        assert_eq!(EngineError::AlreadyUnlocked.to_string(), "character already unlocked");
        assert_eq!(EngineError::AlreadyRefunded.to_string(), "transaction already refunded");
        assert_eq!(
            EngineError::RefundWindowExpired {
                window_days: 7,
                elapsed_days: 8
            }
            .to_string(),
            "refund window of 7 days expired (8 days elapsed)"
        );
        assert_eq!(EngineError::NotFound("transaction").to_string(), "transaction not found");
        assert_eq!(
            EngineError::OwnerMismatch.to_string(),
            "user does not own this transaction"
        );
    }

    #[test]
    fn only_infrastructure_errors_are_retryable() {
        assert!(EngineError::StoreUnavailable.is_retryable());
        assert!(EngineError::Timeout.is_retryable());
        assert!(!EngineError::AlreadyRefunded.is_retryable());
        assert!(!EngineError::TransactionConflict.is_retryable());
        assert!(!EngineError::InvalidArgument("key".into()).is_retryable());
    }

    #[test]
    fn response_hides_store_details() {
        let response = EngineError::StoreUnavailable.to_response();
        assert_eq!(response.code, "STORE_UNAVAILABLE");
        assert!(response.retryable);
        assert!(!response.message.contains("store"));

        let response = EngineError::AlreadyUnlocked.to_response();
        assert_eq!(response.code, "ALREADY_UNLOCKED");
        assert!(!response.retryable);
    }

    #[test]
    fn errors_are_cloneable() {
        let error = EngineError::InsufficientInventory {
            required: 1,
            available: 0,
        };
        let cloned = error.clone();
        assert_eq!(error, cloned);
    }
}
