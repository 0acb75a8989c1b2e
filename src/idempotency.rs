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

//! Idempotency gate.
//!
//! [`IdempotencyGate::execute`] runs an operation at most once per key within
//! the key's TTL, across concurrent callers in this process and in other
//! processes sharing the same [`Store`].
//!
//! Lookup order for a key:
//!
//! 1. local result cache (short TTL) → [`Provenance::CachedLocal`]
//! 2. local in-flight call → wait for it → [`Provenance::CachedConcurrent`]
//! 3. persistent record, claimed with insert-if-absent:
//!    - claimed: run the operation → [`Provenance::Fresh`]
//!    - held by a success record → [`Provenance::CachedRemote`]
//!    - held by another process's pending claim → poll until it completes
//!      → [`Provenance::CachedConcurrent`]
//!
//! Failures are never cached: the pending claim is removed and the local
//! in-flight slot released, so a retry with the same key runs again.
//!
//! Once a caller takes the lead, the claim, the operation and the completion
//! run on a spawned task. Dropping the caller's future does not abandon the
//! key: the task still persists the result, and other callers keep waiting
//! on it. The pending claim is renewed every third of `pending_lease` while
//! the operation runs.
//!
//! Per key: `NONE → LOCKED → PERSISTED → EXPIRED → NONE`.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::store::{IdempotencyRecord, InsertOutcome, RecordStatus, Store};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where a result handed out by the gate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// The operation ran for this call.
    Fresh,
    /// Served from this process's result cache.
    CachedLocal,
    /// Served from a success record another call persisted earlier.
    CachedRemote,
    /// Another call was running the operation; this one waited for its result.
    CachedConcurrent,
}

impl Provenance {
    pub fn is_cached(&self) -> bool {
        *self != Self::Fresh
    }
}

/// A result returned through the gate, tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Idempotent<T> {
    pub value: T,
    pub provenance: Provenance,
}

/// Snapshot of the local cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GateStats {
    /// Entries held, expired ones included until the next sweep.
    pub cached: usize,
    /// Entries that can still be served.
    pub valid: usize,
    /// Entries past their TTL and waiting for the sweep.
    pub expired: usize,
    /// Keys whose operation is running in this process.
    pub in_flight: usize,
}

#[derive(Debug, Clone)]
struct CachedResult {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

type Outcome = Result<serde_json::Value, EngineError>;

const MIN_RENEWAL: Duration = Duration::from_millis(10);

struct GateInner {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    cache: DashMap<String, CachedResult>,
    in_flight: DashMap<String, watch::Receiver<Option<Outcome>>>,
}

/// Releases the local in-flight slot when the leader task ends, however it ends.
struct InFlightSlot {
    inner: Arc<GateInner>,
    key: String,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.key);
    }
}

/// Runs operations at most once per key.
///
/// Cheap to share by reference; the background sweep holds its own handle to
/// the caches.
pub struct IdempotencyGate {
    inner: Arc<GateInner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl IdempotencyGate {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(GateInner {
                store,
                clock,
                config,
                cache: DashMap::new(),
                in_flight: DashMap::new(),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Runs `operation` at most once for `key` within `ttl`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidArgument`] - `key` is blank; no store is touched.
    /// - Whatever `operation` returns, uncached.
    /// - [`EngineError::StoreUnavailable`] - the record store could not be reached.
    /// - [`EngineError::Timeout`] - another process held the key for the whole `ttl`.
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        operation: F,
    ) -> Result<Idempotent<T>, EngineError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        if key.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "idempotency key must be a non-empty string".into(),
            ));
        }
        if ttl.is_zero() {
            return Err(EngineError::InvalidArgument(
                "idempotency ttl must be positive".into(),
            ));
        }

        let sender = loop {
            if let Some(value) = self.inner.cached_local(key) {
                debug!(key, "idempotent result served from local cache");
                return decode(value, Provenance::CachedLocal);
            }

            let mut receiver = match self.inner.in_flight.entry(key.to_string()) {
                Entry::Occupied(occupied) => occupied.get().clone(),
                Entry::Vacant(vacant) => {
                    let (sender, receiver) = watch::channel(None);
                    vacant.insert(receiver);
                    break sender;
                }
            };

            info!(key, "request already in flight, waiting for its result");
            let outcome = match receiver.wait_for(Option::is_some).await {
                Ok(outcome) => outcome.clone(),
                // Leader task died without a result; contend again.
                Err(_) => continue,
            };
            if let Some(outcome) = outcome {
                return decode(outcome?, Provenance::CachedConcurrent);
            }
        };

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        let leader = tokio::spawn(async move {
            let _slot = InFlightSlot {
                inner: Arc::clone(&inner),
                key: key.clone(),
            };
            let outcome = inner.lead(&key, ttl, operation).await;
            let _ = sender.send(Some(outcome.clone().map(|(value, _)| value)));
            outcome
        });

        let (value, provenance) = match leader.await {
            Ok(outcome) => outcome?,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            // Runtime shutting down.
            Err(_) => return Err(EngineError::Timeout),
        };
        decode(value, provenance)
    }

    /// Starts the periodic sweep of expired local and persistent records.
    ///
    /// Must be called from within a Tokio runtime. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let period = inner.config.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                inner.sweep().await;
            }
        }));
        info!(?period, "idempotency sweep started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("idempotency sweep stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    /// Runs one sweep immediately.
    pub async fn sweep(&self) {
        self.inner.sweep().await;
    }

    /// Drops the local cache for `key`, or all of it when `None`.
    pub fn clear(&self, key: Option<&str>) {
        match key {
            Some(key) => {
                self.inner.cache.remove(key);
            }
            None => self.inner.cache.clear(),
        }
    }

    pub fn stats(&self) -> GateStats {
        let now = self.inner.clock.now();
        let mut stats = GateStats {
            in_flight: self.inner.in_flight.len(),
            ..GateStats::default()
        };
        for entry in self.inner.cache.iter() {
            stats.cached += 1;
            if entry.expires_at > now {
                stats.valid += 1;
            } else {
                stats.expired += 1;
            }
        }
        stats
    }
}

impl Drop for IdempotencyGate {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

impl GateInner {
    fn cached_local(&self, key: &str) -> Option<serde_json::Value> {
        let now = self.clock.now();
        let cached = self.cache.get(key)?.clone();
        if cached.expires_at > now {
            return Some(cached.value);
        }
        self.cache.remove_if(key, |_, c| c.expires_at <= now);
        None
    }

    fn remember(&self, key: &str, value: &serde_json::Value, ttl: Duration) {
        let local_ttl = self.config.local_ttl_for(ttl);
        self.cache.insert(
            key.to_string(),
            CachedResult {
                value: value.clone(),
                expires_at: self.clock.now() + to_chrono(local_ttl),
            },
        );
    }

    /// Claims the key in the store and runs the operation, or observes the
    /// result of whoever holds the claim.
    async fn lead<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        operation: F,
    ) -> Result<(serde_json::Value, Provenance), EngineError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let started = self.clock.now();
        let mut waited = false;
        loop {
            let now = self.clock.now();
            let claim =
                IdempotencyRecord::pending(key, now, now + to_chrono(self.config.pending_lease));
            match self.store.insert_record_if_absent(claim, now).await? {
                InsertOutcome::Inserted => break,
                InsertOutcome::Existing(record) => match (record.status, record.result) {
                    (RecordStatus::Success, Some(value)) => {
                        let provenance = if waited {
                            Provenance::CachedConcurrent
                        } else {
                            Provenance::CachedRemote
                        };
                        info!(key, ?provenance, "idempotent result served from store");
                        self.remember(key, &value, remaining(record.expires_at, now));
                        return Ok((value, provenance));
                    }
                    _ => {
                        if now - started >= to_chrono(ttl) {
                            warn!(key, "key stayed claimed by another process, giving up");
                            return Err(EngineError::Timeout);
                        }
                        if !waited {
                            info!(key, "key claimed by another process, waiting");
                        }
                        waited = true;
                        tokio::time::sleep(self.config.pending_poll).await;
                    }
                },
            }
        }

        info!(key, "processing idempotent request");
        let operation = operation();
        tokio::pin!(operation);
        let renew_every = (self.config.pending_lease / 3).max(MIN_RENEWAL);
        let result = loop {
            tokio::select! {
                result = &mut operation => break result,
                () = tokio::time::sleep(renew_every) => self.renew_claim(key).await,
            }
        };
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "idempotent request failed, not caching");
                if let Err(release) = self.store.remove_record(key.to_string()).await {
                    error!(key, error = %release, "failed to release idempotency claim");
                }
                return Err(e);
            }
        };

        let value = serde_json::to_value(&value)
            .map_err(|e| EngineError::InvalidArgument(format!("unserializable result: {e}")))?;
        self.complete(key, &value, ttl).await;
        self.remember(key, &value, ttl);
        info!(key, "idempotent request succeeded, result cached");
        Ok((value, Provenance::Fresh))
    }

    async fn renew_claim(&self, key: &str) {
        let until = self.clock.now() + to_chrono(self.config.pending_lease);
        match self.store.renew_record(key.to_string(), until).await {
            Ok(true) => debug!(key, "idempotency claim renewed"),
            Ok(false) => warn!(key, "idempotency claim is no longer pending"),
            Err(e) => warn!(key, error = %e, "failed to renew idempotency claim"),
        }
    }

    /// Persists the success record, retrying with the configured backoff.
    ///
    /// If every attempt fails the pending claim is stretched to the full `ttl`,
    /// so the committed operation cannot run again under the same key.
    async fn complete(&self, key: &str, value: &serde_json::Value, ttl: Duration) {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            let expires_at = self.clock.now() + to_chrono(ttl);
            let e = match self
                .store
                .complete_record(key.to_string(), value.clone(), expires_at)
                .await
            {
                Ok(()) => return,
                Err(e) => e,
            };
            if attempt >= retry.max_retries {
                error!(key, error = %e, "failed to persist idempotent result, holding claim until ttl");
                if let Err(e) = self.store.renew_record(key.to_string(), expires_at).await {
                    error!(key, error = %e, "failed to hold idempotency claim");
                }
                return;
            }
            let delay = retry.delay_for_attempt(attempt);
            warn!(key, attempt, ?delay, error = %e, "failed to persist idempotent result, retrying");
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }

    async fn sweep(&self) {
        let now = self.clock.now();
        let before = self.cache.len();
        self.cache.retain(|_, cached| cached.expires_at > now);
        let expired = before.saturating_sub(self.cache.len());

        let capacity = self.config.local_cache_capacity;
        let mut evicted = 0;
        if self.cache.len() > capacity {
            let mut by_expiry: Vec<_> = self
                .cache
                .iter()
                .map(|e| (e.expires_at, e.key().clone()))
                .collect();
            by_expiry.sort();
            for (_, key) in by_expiry.into_iter().take(self.cache.len() - capacity) {
                self.cache.remove(&key);
                evicted += 1;
            }
        }

        let purged = match self.store.purge_expired_records(now).await {
            Ok(purged) => purged,
            Err(e) => {
                warn!(error = %e, "failed to purge expired idempotency records");
                0
            }
        };

        if expired + evicted + purged > 0 {
            info!(
                expired,
                evicted,
                purged,
                remaining = self.cache.len(),
                "idempotency sweep"
            );
        }
    }
}

fn decode<T: DeserializeOwned>(
    value: serde_json::Value,
    provenance: Provenance,
) -> Result<Idempotent<T>, EngineError> {
    let value = serde_json::from_value(value).map_err(|_| {
        EngineError::InvalidArgument("idempotency key reused for a different operation".into())
    })?;
    Ok(Idempotent { value, provenance })
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

fn remaining(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (expires_at - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::store::MemoryStore;
    use futures::future::{Ready, ready};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn gate_with(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> IdempotencyGate {
        IdempotencyGate::new(store, clock, EngineConfig::default())
    }

    fn setup() -> (IdempotencyGate, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (gate_with(store.clone(), clock.clone()), store, clock)
    }

    const TTL: Duration = Duration::from_secs(15 * 60);

    fn counted(
        calls: &Arc<AtomicU32>,
        value: u32,
    ) -> impl FnOnce() -> Ready<Result<u32, EngineError>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            ready(Ok(value))
        }
    }

    #[tokio::test]
    async fn blank_key_fails_before_touching_store() {
        let (gate, store, _) = setup();
        store.set_unavailable(true);
        let result = gate.execute("  ", TTL, || async { Ok(1u32) }).await;
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn second_call_is_served_from_local_cache() {
        let (gate, _, _) = setup();
        let calls = Arc::new(AtomicU32::new(0));

        let first = gate.execute("k", TTL, counted(&calls, 7)).await.unwrap();
        let second = gate.execute("k", TTL, counted(&calls, 8)).await.unwrap();

        assert_eq!(first.provenance, Provenance::Fresh);
        assert_eq!(second.provenance, Provenance::CachedLocal);
        assert_eq!(second.value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn store_record_serves_after_local_cache_expires() {
        let (gate, _, clock) = setup();
        gate.execute("k", TTL, || async { Ok(1u32) }).await.unwrap();

        // Past the local TTL, inside the persistent TTL.
        clock.advance(chrono::Duration::minutes(2));
        let result = gate.execute("k", TTL, || async { Ok(2u32) }).await.unwrap();
        assert_eq!(result.provenance, Provenance::CachedRemote);
        assert_eq!(result.value, 1);
    }

    #[tokio::test]
    async fn expired_key_runs_again() {
        let (gate, _, clock) = setup();
        gate.execute("k", TTL, || async { Ok(1u32) }).await.unwrap();

        clock.advance(chrono::Duration::minutes(16));
        let result = gate.execute("k", TTL, || async { Ok(2u32) }).await.unwrap();
        assert_eq!(result.provenance, Provenance::Fresh);
        assert_eq!(result.value, 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let (gate, store, _) = setup();
        let result: Result<Idempotent<u32>, _> = gate
            .execute("k", TTL, || async { Err(EngineError::Timeout) })
            .await;
        assert_eq!(result, Err(EngineError::Timeout));
        assert_eq!(store.record_count(), 0);
        assert_eq!(gate.stats().in_flight, 0);

        let retry = gate.execute("k", TTL, || async { Ok(3u32) }).await.unwrap();
        assert_eq!(retry.provenance, Provenance::Fresh);
        assert_eq!(retry.value, 3);
    }

    #[tokio::test]
    async fn reusing_key_for_other_result_type_is_rejected() {
        let (gate, _, _) = setup();
        gate.execute("k", TTL, || async { Ok(1u32) }).await.unwrap();
        let result = gate
            .execute("k", TTL, || async { Ok("text".to_string()) })
            .await;
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn sweep_drops_expired_and_enforces_capacity() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = EngineConfig {
            local_cache_capacity: 2,
            ..EngineConfig::default()
        };
        let gate = IdempotencyGate::new(store.clone(), clock.clone(), config);

        for key in ["a", "b", "c"] {
            gate.execute(key, TTL, || async { Ok(0u32) }).await.unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }
        gate.sweep().await;
        assert_eq!(gate.stats().cached, 2);

        clock.advance(chrono::Duration::hours(1));
        gate.sweep().await;
        assert_eq!(gate.stats().cached, 0);
        assert_eq!(store.record_count(), 0);
    }

    #[tokio::test]
    async fn start_and_stop_lifecycle() {
        let (gate, _, _) = setup();
        assert!(!gate.is_running());
        gate.start();
        gate.start();
        assert!(gate.is_running());
        gate.stop();
        assert!(!gate.is_running());
    }

    #[tokio::test]
    async fn clear_removes_local_entries() {
        let (gate, _, _) = setup();
        gate.execute("k", TTL, || async { Ok(1u32) }).await.unwrap();
        gate.clear(Some("k"));
        let again = gate.execute("k", TTL, || async { Ok(2u32) }).await.unwrap();
        assert_eq!(again.provenance, Provenance::CachedRemote);
        assert_eq!(again.value, 1);
    }

    #[tokio::test]
    async fn cancelled_leader_still_completes_its_key() {
        let (gate, store, clock) = setup();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let slow = move || async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(1u32)
        };

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), gate.execute("k", TTL, slow)).await;
        assert!(cancelled.is_err());

        let retry = gate.execute("k", TTL, counted(&calls, 2)).await.unwrap();
        assert_eq!(retry.provenance, Provenance::CachedConcurrent);
        assert_eq!(retry.value, 1);

        // Another process, after the local cache has lapsed.
        clock.advance(chrono::Duration::minutes(2));
        let other = gate_with(store, clock);
        let remote = other.execute("k", TTL, counted(&calls, 3)).await.unwrap();
        assert_eq!(remote.provenance, Provenance::CachedRemote);
        assert_eq!(remote.value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn long_operation_keeps_its_claim_past_the_lease() {
        let store = Arc::new(MemoryStore::new());
        let config = EngineConfig {
            pending_lease: Duration::from_millis(60),
            pending_poll: Duration::from_millis(5),
            ..EngineConfig::default()
        };
        let first = IdempotencyGate::new(store.clone(), Arc::new(SystemClock), config.clone());
        let second = IdempotencyGate::new(store, Arc::new(SystemClock), config);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let (a, b) = tokio::join!(
            first.execute("k", TTL, move || async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(1u32)
            }),
            async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                second.execute("k", TTL, counted(&calls, 2)).await
            }
        );
        assert_eq!(a.unwrap().provenance, Provenance::Fresh);
        let b = b.unwrap();
        assert_eq!(b.provenance, Provenance::CachedConcurrent);
        assert_eq!(b.value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn completion_is_retried_until_the_store_recovers() {
        let (gate, store, clock) = setup();
        let flaky = store.clone();
        let result = gate
            .execute("k", TTL, move || async move {
                flaky.set_unavailable(true);
                let healer = Arc::clone(&flaky);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    healer.set_unavailable(false);
                });
                Ok(5u32)
            })
            .await
            .unwrap();
        assert_eq!(result.provenance, Provenance::Fresh);

        clock.advance(chrono::Duration::minutes(2));
        let other = gate_with(store, clock);
        let remote = other.execute("k", TTL, || async { Ok(6u32) }).await.unwrap();
        assert_eq!(remote.provenance, Provenance::CachedRemote);
        assert_eq!(remote.value, 5);
    }
}
