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

//! Deadlock detection tests using parking_lot's built-in deadlock detector.
//!
//! These tests drive the engine from many tasks on a multi-threaded runtime
//! and verify that the locking in the store, the idempotency gate, and the
//! price cache never forms a cycle, and that the final state is consistent.

use futures::future::join_all;
use parking_lot::deadlock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use wallet_engine_rs::{
    Engine, EngineConfig, EngineError, MemoryStore, PurchaseRequest, RefundOptions, RetryPolicy,
    TransactionId, UserId,
};

// === Deadlock Detection Infrastructure ===

/// Starts a background thread that checks for deadlocks.
/// Returns a handle to stop the detector.
fn start_deadlock_detector() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    thread::spawn(move || {
        while running_clone.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            let deadlocks = deadlock::check_deadlock();
            if !deadlocks.is_empty() {
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                panic!("Deadlock detected! See output above for details.");
            }
        }
    });

    running
}

/// Stops the deadlock detector.
fn stop_deadlock_detector(running: Arc<AtomicBool>) {
    running.store(false, Ordering::SeqCst);
    thread::sleep(Duration::from_millis(150)); // Let detector thread exit
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(8)
        .enable_all()
        .build()
        .expect("runtime")
}

fn contended_engine(store: Arc<MemoryStore>) -> Arc<Engine> {
    let config = EngineConfig {
        sweep_interval: Duration::from_millis(20),
        retry: RetryPolicy {
            max_retries: 1_000,
            max_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        },
        ..EngineConfig::default()
    };
    Arc::new(Engine::new(store, config))
}

// === Tests ===

/// Test high contention on a single user with many tasks.
#[test]
fn no_deadlock_high_contention_single_user() {
    let detector = start_deadlock_detector();
    let engine = contended_engine(Arc::new(MemoryStore::new()));
    let user = UserId::new("hot");

    const NUM_TASKS: usize = 50;
    const OPS_PER_TASK: usize = 20;

    runtime().block_on(async {
        engine.start();
        let tasks: Vec<_> = (0..NUM_TASKS)
            .map(|t| {
                let (engine, user) = (engine.clone(), user.clone());
                tokio::spawn(async move {
                    for i in 0..OPS_PER_TASK {
                        match i % 4 {
                            0 => {
                                engine.credit(&user, 10, "load", None).await.expect("credit");
                            }
                            1 => {
                                let _ = engine.deduct(&user, 3, "load", None).await;
                            }
                            2 => {
                                let request = PurchaseRequest::new("photo-unlock-1");
                                let _ = engine.purchase(&user, &request, &format!("{t}-{i}")).await;
                            }
                            _ => {
                                let _ = engine.balance(&user).await.expect("balance");
                                let _ = engine.gate().stats();
                            }
                        }
                    }
                })
            })
            .collect();
        for joined in join_all(tasks).await {
            joined.expect("Task panicked");
        }
        engine.stop();

        assert!(
            engine
                .ledger()
                .verify_balance_invariant(&user)
                .await
                .unwrap()
        );
    });

    stop_deadlock_detector(detector);
    println!(
        "High contention test passed: {} tasks × {} ops",
        NUM_TASKS, OPS_PER_TASK
    );
}

/// Test operations spread over many users.
#[test]
fn no_deadlock_cross_user_operations() {
    let detector = start_deadlock_detector();
    let store = Arc::new(MemoryStore::new());
    let engine = contended_engine(store.clone());

    const NUM_TASKS: usize = 40;
    const NUM_USERS: usize = 8;

    runtime().block_on(async {
        let tasks: Vec<_> = (0..NUM_TASKS)
            .map(|t| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let user = UserId::new(format!("user-{}", t % NUM_USERS));
                    engine.credit(&user, 100, "load", None).await.expect("credit");
                    let request = PurchaseRequest::new("video-unlock-5");
                    engine
                        .purchase(&user, &request, &format!("order-{t}"))
                        .await
                        .expect("purchase");
                })
            })
            .collect();
        for joined in join_all(tasks).await {
            joined.expect("Task panicked");
        }

        for user in store.user_ids() {
            // Five tasks per user, each +100 then -50.
            assert_eq!(engine.balance(&user).await.unwrap(), 250);
            assert!(engine.ledger().verify_balance_invariant(&user).await.unwrap());
        }
    });

    stop_deadlock_detector(detector);
}

/// Many processes sharing one store race on the same idempotency key.
#[test]
fn no_deadlock_same_key_across_engines() {
    let detector = start_deadlock_detector();
    let store = Arc::new(MemoryStore::new());
    let engines: Vec<_> = (0..4).map(|_| contended_engine(store.clone())).collect();
    let user = UserId::new("u");

    const CALLERS_PER_ENGINE: usize = 10;

    runtime().block_on(async {
        engines[0].credit(&user, 500, "seed", None).await.unwrap();
        for engine in &engines {
            engine.start();
        }

        let mut tasks = Vec::new();
        for engine in &engines {
            for _ in 0..CALLERS_PER_ENGINE {
                let (engine, user) = (engine.clone(), user.clone());
                tasks.push(tokio::spawn(async move {
                    let request = PurchaseRequest::new("video-unlock-5");
                    engine.purchase(&user, &request, "order-1").await
                }));
            }
        }
        let results: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.expect("Task panicked").expect("purchase"))
            .collect();

        for engine in &engines {
            engine.stop();
        }
        let first = &results[0].value;
        assert!(results.iter().all(|r| r.value == *first));
        assert_eq!(engines[0].balance(&user).await.unwrap(), 450);
    });

    stop_deadlock_detector(detector);
}

/// Test concurrent refund races on the same ledger entry.
#[test]
fn no_deadlock_concurrent_refund_same_tx() {
    let detector = start_deadlock_detector();
    let engine = contended_engine(Arc::new(MemoryStore::new()));
    let user = UserId::new("u");

    const NUM_TASKS: usize = 20;

    runtime().block_on(async {
        engine.credit(&user, 100, "seed", None).await.unwrap();
        let purchase = engine
            .purchase(&user, &PurchaseRequest::new("video-unlock-5"), "order-1")
            .await
            .unwrap()
            .value;

        let tasks: Vec<_> = (0..NUM_TASKS)
            .map(|_| {
                let (engine, user) = (engine.clone(), user.clone());
                let id: TransactionId = purchase.transaction_id;
                tokio::spawn(async move {
                    engine
                        .refund(&user, id, "race", &RefundOptions::default())
                        .await
                })
            })
            .collect();
        let results: Vec<_> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.expect("Task panicked"))
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| *e == EngineError::AlreadyRefunded)
        );
        assert_eq!(engine.balance(&user).await.unwrap(), 100);
    });

    stop_deadlock_detector(detector);
}
