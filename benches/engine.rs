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

//! Benchmarks for the wallet engine.
//!
//! Run with: cargo bench
//!
//! Benchmarks include:
//! - Single credits and purchases
//! - Cached replays through the idempotency gate
//! - Purchase and refund round trips
//! - Concurrent purchases on one user and across users

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Runtime;
use wallet_engine_rs::{
    Engine, EngineConfig, MemoryStore, PurchaseRequest, RefundOptions, RetryPolicy, UserId,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn funded_engine(users: usize, coins: u64) -> Arc<Engine> {
    let config = EngineConfig {
        retry: RetryPolicy {
            max_retries: 10_000,
            ..RetryPolicy::default()
        },
        ..EngineConfig::default()
    };
    let engine = Arc::new(Engine::new(Arc::new(MemoryStore::new()), config));
    if coins > 0 {
        for u in 0..users {
            engine
                .credit(&UserId::new(format!("user-{u}")), coins, "bench", None)
                .await
                .unwrap();
        }
    }
    engine
}

// =============================================================================
// Single-Operation Benchmarks
// =============================================================================

fn bench_single_credit(c: &mut Criterion) {
    let rt = runtime();
    let engine = rt.block_on(funded_engine(1, 0));
    let (engine, user) = (&engine, &UserId::new("user-0"));

    c.bench_function("single_credit", |b| {
        b.to_async(&rt).iter(move || async move {
            engine
                .credit(black_box(user), 10, "bench", None)
                .await
                .unwrap();
        })
    });
}

fn bench_single_purchase(c: &mut Criterion) {
    let rt = runtime();
    let engine = rt.block_on(funded_engine(1, u64::MAX / 2));
    let (engine, user) = (&engine, &UserId::new("user-0"));
    let request = &PurchaseRequest::new("video-unlock-5");
    let keys = &AtomicU64::new(0);

    c.bench_function("single_purchase", |b| {
        b.to_async(&rt).iter(move || async move {
            let key = format!("k{}", keys.fetch_add(1, Ordering::Relaxed));
            engine.purchase(user, request, &key).await.unwrap();
        })
    });
}

fn bench_cached_replay(c: &mut Criterion) {
    let rt = runtime();
    let engine = rt.block_on(funded_engine(1, 1_000));
    let user = UserId::new("user-0");
    let request = PurchaseRequest::new("video-unlock-5");
    rt.block_on(engine.purchase(&user, &request, "replayed"))
        .unwrap();

    let (engine, user, request) = (&engine, &user, &request);

    c.bench_function("cached_replay", |b| {
        b.to_async(&rt).iter(move || async move {
            black_box(engine.purchase(user, request, "replayed").await.unwrap());
        })
    });
}

fn bench_purchase_refund(c: &mut Criterion) {
    let rt = runtime();
    let engine = rt.block_on(funded_engine(1, 100));
    let (engine, user) = (&engine, &UserId::new("user-0"));
    let request = &PurchaseRequest::new("video-unlock-5");
    let keys = &AtomicU64::new(0);

    c.bench_function("purchase_refund", |b| {
        b.to_async(&rt).iter(move || async move {
            let key = format!("k{}", keys.fetch_add(1, Ordering::Relaxed));
            let purchase = engine.purchase(user, request, &key).await.unwrap();
            engine
                .refund(
                    user,
                    purchase.value.transaction_id,
                    "bench",
                    &RefundOptions::default(),
                )
                .await
                .unwrap();
        })
    });
}

// =============================================================================
// Concurrent Benchmarks
// =============================================================================

fn bench_concurrent_purchases(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("concurrent_purchases");

    for users in [1usize, 8, 64].iter() {
        let engine = rt.block_on(funded_engine(*users, u64::MAX / 2));
        let keys = Arc::new(AtomicU64::new(0));
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(BenchmarkId::from_parameter(users), users, |b, &users| {
            b.to_async(&rt).iter(|| {
                let (engine, keys) = (engine.clone(), keys.clone());
                async move {
                    let tasks: Vec<_> = (0..256)
                        .map(|i| {
                            let (engine, keys) = (engine.clone(), keys.clone());
                            tokio::spawn(async move {
                                let user = UserId::new(format!("user-{}", i % users));
                                let key = format!("k{}", keys.fetch_add(1, Ordering::Relaxed));
                                let request = PurchaseRequest::new("photo-unlock-1");
                                engine.purchase(&user, &request, &key).await
                            })
                        })
                        .collect();
                    for joined in join_all(tasks).await {
                        joined.unwrap().unwrap();
                    }
                }
            })
        });
    }
    group.finish();
}

criterion_group!(
    single,
    bench_single_credit,
    bench_single_purchase,
    bench_cached_replay,
    bench_purchase_refund,
);

criterion_group!(concurrent, bench_concurrent_purchases,);

criterion_main!(single, concurrent);
