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

//! Deduplicating, rate-limited work queue shared by the controller workers.
//!
//! A key is in one of three places: `queue` (ready, waiting for a worker),
//! `processing` (handed out by [`WorkQueue::get`] and not yet released with
//! [`WorkQueue::done`]), or nowhere. `dirty` tracks keys that must be
//! delivered again; a key that is both dirty and processing is re-queued when
//! its worker calls `done`, which keeps a key with at most one pending entry
//! and at most one worker at any time.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::readygate::controller::backoff::ExponentialBackoff;
use crate::readygate::observability::metrics;

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<K> {
    state: Mutex<QueueState<K>>,
    ready: Notify,
    shutdown: CancellationToken,
    limiter: ExponentialBackoff<K>,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                ready: Notify::new(),
                shutdown: CancellationToken::new(),
                limiter: ExponentialBackoff::new(backoff_base, backoff_cap),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Marks `key` as needing work. Keys already pending are ignored; keys
    /// currently being processed are re-delivered after `done`.
    pub fn add(&self, key: K) {
        let depth = {
            let mut state = self.lock();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
            state.queue.len()
        };
        metrics::set_workqueue_depth(depth);
        self.inner.ready.notify_one();
    }

    /// Adds `key` once `delay` has elapsed. Pending timers are dropped when
    /// the queue shuts down. Must be called from within a tokio runtime when
    /// `delay` is non-zero.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = sleep(delay) => queue.add(key),
            }
        });
    }

    /// Re-adds `key` after its current backoff delay and escalates the delay
    /// for the next failure.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        metrics::record_workqueue_retry();
        self.add_after(key, delay);
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.inner.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Waits for the next ready key and marks it in flight. Returns `None`
    /// once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                state.queue.pop_front().map(|key| {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    (key, state.queue.len())
                })
            };
            if let Some((key, depth)) = popped {
                metrics::set_workqueue_depth(depth);
                return Some(key);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.inner.shutdown.cancelled() => return None,
            }
        }
    }

    /// Releases the in-flight mark of `key`. Calling `done` for a key that was
    /// never handed out is a no-op.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            if !state.processing.remove(key) {
                return;
            }
            if state.shutting_down || !state.dirty.contains(key) {
                return;
            }
            state.queue.push_back(key.clone());
            state.queue.len()
        };
        metrics::set_workqueue_depth(requeued);
        self.inner.ready.notify_one();
    }

    /// Stops the queue: pending keys are discarded, further adds are dropped
    /// and every waiting `get` returns `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
        }
        metrics::set_workqueue_depth(0);
        self.inner.shutdown.cancel();
        self.inner.ready.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys ready for a worker.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently held by workers.
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }
}
