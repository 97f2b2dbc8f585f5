/*
 * Copyright (C) 2024 The Readygate Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Concurrency properties of the controller work queue.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use readygate::readygate::controller::queue::WorkQueue;
use tokio::time::{sleep, timeout, Instant};

fn queue() -> WorkQueue<u32> {
    WorkQueue::new(Duration::from_millis(5), Duration::from_secs(1000))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_adds_keep_one_entry_per_key() {
    let queue = queue();
    let mut adders = Vec::new();
    for _ in 0..16 {
        let queue = queue.clone();
        adders.push(tokio::spawn(async move {
            for key in 0..100 {
                queue.add(key);
            }
        }));
    }
    for adder in adders {
        adder.await.expect("adder");
    }
    assert_eq!(queue.len(), 100);

    let mut seen = HashSet::new();
    while !queue.is_empty() {
        let key = queue.get().await.expect("key");
        assert!(seen.insert(key), "key {key} delivered twice");
    }
    assert_eq!(seen.len(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_key_is_never_held_by_two_workers() {
    let queue = queue();
    let held: Arc<Mutex<HashSet<u32>>> = Arc::new(Mutex::new(HashSet::new()));
    let violations = Arc::new(Mutex::new(Vec::new()));

    let mut workers = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        let held = Arc::clone(&held);
        let violations = Arc::clone(&violations);
        workers.push(tokio::spawn(async move {
            while let Some(key) = queue.get().await {
                if !held.lock().unwrap().insert(key) {
                    violations.lock().unwrap().push(key);
                }
                tokio::task::yield_now().await;
                held.lock().unwrap().remove(&key);
                queue.done(&key);
            }
        }));
    }

    let mut adders = Vec::new();
    for offset in 0..4u32 {
        let queue = queue.clone();
        adders.push(tokio::spawn(async move {
            for round in 0..500u32 {
                queue.add((round + offset) % 10);
                if round % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for adder in adders {
        adder.await.expect("adder");
    }

    timeout(Duration::from_secs(5), async {
        while !(queue.is_empty() && queue.in_flight() == 0) {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("queue drained");
    queue.shut_down();
    for worker in workers {
        timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker exits")
            .expect("worker join");
    }
    assert!(violations.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_releases_every_waiter() {
    let queue = queue();
    let mut waiters = Vec::new();
    for _ in 0..32 {
        let queue = queue.clone();
        waiters.push(tokio::spawn(async move { queue.get().await }));
    }
    sleep(Duration::from_millis(20)).await;

    queue.shut_down();
    queue.shut_down();
    for waiter in waiters {
        let result = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .expect("join");
        assert_eq!(result, None);
    }

    queue.add(7);
    assert!(queue.is_empty());
    assert_eq!(queue.get().await, None);
}

#[tokio::test(start_paused = true)]
async fn forget_resets_the_backoff() {
    let queue = queue();
    for _ in 0..3 {
        queue.add_rate_limited(1);
    }
    assert_eq!(queue.num_requeues(&1), 3);

    let key = queue.get().await.expect("first delayed add");
    queue.done(&key);
    queue.forget(&1);
    assert_eq!(queue.num_requeues(&1), 0);

    sleep(Duration::from_secs(1)).await;
    while !queue.is_empty() {
        let key = queue.get().await.expect("drain");
        queue.done(&key);
    }

    let started = Instant::now();
    queue.add_rate_limited(1);
    assert_eq!(queue.get().await, Some(1));
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(5) && waited < Duration::from_millis(10));
}
