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

//! Engine configuration.
//!
//! Every setting has a built-in default. [`EngineConfig::from_env`] overrides
//! them from `WALLET_*` environment variables; values that are absent or fail
//! to parse keep the default.

use serde::Deserialize;
use std::time::Duration;

/// Exponential backoff applied when an optimistic commit loses a race.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(200),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Idempotency TTL for purchases.
    #[serde(with = "millis")]
    pub purchase_ttl: Duration,
    /// Idempotency TTL for refunds.
    #[serde(with = "millis")]
    pub refund_ttl: Duration,
    /// In-process cache TTL, never longer than the persistent TTL it fronts.
    #[serde(with = "millis")]
    pub local_cache_ttl: Duration,
    pub local_cache_capacity: usize,
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
    /// How long a pending record blocks other processes before it is considered abandoned.
    #[serde(with = "millis")]
    pub pending_lease: Duration,
    #[serde(with = "millis")]
    pub pending_poll: Duration,
    pub refund_window_days: u32,
    #[serde(with = "millis")]
    pub price_cache_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            purchase_ttl: Duration::from_secs(15 * 60),
            refund_ttl: Duration::from_secs(24 * 60 * 60),
            local_cache_ttl: Duration::from_secs(60),
            local_cache_capacity: 10_000,
            sweep_interval: Duration::from_secs(5 * 60),
            pending_lease: Duration::from_secs(30),
            pending_poll: Duration::from_millis(25),
            refund_window_days: 7,
            price_cache_ttl: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            purchase_ttl: env_millis("WALLET_PURCHASE_TTL_MS").unwrap_or(defaults.purchase_ttl),
            refund_ttl: env_millis("WALLET_REFUND_TTL_MS").unwrap_or(defaults.refund_ttl),
            local_cache_ttl: env_millis("WALLET_LOCAL_CACHE_TTL_MS")
                .unwrap_or(defaults.local_cache_ttl),
            local_cache_capacity: env_parse("WALLET_LOCAL_CACHE_CAPACITY")
                .unwrap_or(defaults.local_cache_capacity),
            sweep_interval: env_millis("WALLET_SWEEP_INTERVAL_MS")
                .unwrap_or(defaults.sweep_interval),
            pending_lease: env_millis("WALLET_PENDING_LEASE_MS").unwrap_or(defaults.pending_lease),
            pending_poll: env_millis("WALLET_PENDING_POLL_MS").unwrap_or(defaults.pending_poll),
            refund_window_days: env_parse("WALLET_REFUND_WINDOW_DAYS")
                .unwrap_or(defaults.refund_window_days),
            price_cache_ttl: env_millis("WALLET_PRICE_CACHE_TTL_MS")
                .unwrap_or(defaults.price_cache_ttl),
            retry: RetryPolicy {
                max_retries: env_parse("WALLET_MAX_RETRIES").unwrap_or(defaults.retry.max_retries),
                ..defaults.retry
            },
        }
    }

    /// Local cache TTL for a record persisted with `ttl`.
    pub fn local_ttl_for(&self, ttl: Duration) -> Duration {
        self.local_cache_ttl.min(ttl)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ttl_never_exceeds_persistent_ttl() {
        let config = EngineConfig::default();
        assert_eq!(
            config.local_ttl_for(Duration::from_secs(2)),
            Duration::from_secs(2)
        );
        assert_eq!(
            config.local_ttl_for(config.refund_ttl),
            config.local_cache_ttl
        );
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(200));
    }

    #[test]
    fn deserializes_partial_json_over_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"refund_window_days": 14, "purchase_ttl": 2000}"#).unwrap();
        assert_eq!(config.refund_window_days, 14);
        assert_eq!(config.purchase_ttl, Duration::from_secs(2));
        assert_eq!(config.local_cache_capacity, 10_000);
    }
}
