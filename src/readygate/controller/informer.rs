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

//! In-memory pod cache fed by list/watch against the API server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::readygate::controller::reconcile::{ApiFuture, PodLister};
use crate::readygate::controller::PodKey;
use crate::readygate::k8s::pod::{Pod, PodList};
use crate::readygate::k8s::watch::{WatchEvent, EVENT_BOOKMARK, EVENT_DELETED, EVENT_MODIFIED};
use crate::readygate::logger::{log_info, log_warn};
use crate::readygate::util::ApiError;

const COMPONENT: &str = "informer";
const EVENT_BUFFER_SIZE: usize = 1024;
const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(300);

pub type WatchStream = BoxStream<'static, Result<WatchEvent<Pod>, ApiError>>;

/// Cluster-wide pod list/watch endpoints.
pub trait PodSource: Send + Sync {
    fn list_pods(&self) -> ApiFuture<PodList>;

    fn watch_pods(&self, resource_version: String) -> ApiFuture<WatchStream>;
}

#[derive(Clone)]
pub struct PodInformer {
    inner: Arc<PodInformerInner>,
}

struct PodInformerInner {
    cache: RwLock<HashMap<PodKey, Pod>>,
    events: broadcast::Sender<WatchEvent<Pod>>,
    synced: AtomicBool,
}

impl Default for PodInformer {
    fn default() -> Self {
        Self::new()
    }
}

impl PodInformer {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            inner: Arc::new(PodInformerInner {
                cache: RwLock::new(HashMap::new()),
                events,
                synced: AtomicBool::new(false),
            }),
        }
    }

    /// Applies one watch event to the cache and fans it out to subscribers.
    pub fn publish(&self, event_type: &str, pod: Pod) {
        let Some(key) = PodKey::from_pod(&pod) else {
            return;
        };

        {
            let mut cache = self
                .inner
                .cache
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if event_type.eq_ignore_ascii_case(EVENT_DELETED) {
                cache.remove(&key);
            } else {
                cache.insert(key, pod.clone());
            }
        }

        let _ = self.inner.events.send(WatchEvent::new(event_type, pod));
    }

    /// Replaces the cache with a fresh listing. Pods missing from `pods` are
    /// published as deleted and every listed pod as modified, so subscribers
    /// see a full resync.
    pub fn replace(&self, pods: Vec<Pod>) {
        let listed: HashMap<PodKey, Pod> = pods
            .into_iter()
            .filter_map(|pod| PodKey::from_pod(&pod).map(|key| (key, pod)))
            .collect();

        let removed: Vec<Pod> = {
            let mut cache = self
                .inner
                .cache
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let stale: Vec<PodKey> = cache
                .keys()
                .filter(|key| !listed.contains_key(*key))
                .cloned()
                .collect();
            let removed = stale.iter().filter_map(|key| cache.remove(key)).collect();
            cache.extend(listed.iter().map(|(key, pod)| (key.clone(), pod.clone())));
            removed
        };

        for pod in removed {
            let _ = self.inner.events.send(WatchEvent::new(EVENT_DELETED, pod));
        }
        for pod in listed.into_values() {
            let _ = self.inner.events.send(WatchEvent::new(EVENT_MODIFIED, pod));
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent<Pod>> {
        self.inner.events.subscribe()
    }

    pub fn get(&self, key: &PodKey) -> Option<Pod> {
        self.inner
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_synced(&self) {
        self.inner.synced.store(true, Ordering::SeqCst);
    }

    /// True once the first full listing has been applied.
    pub fn has_synced(&self) -> bool {
        self.inner.synced.load(Ordering::SeqCst)
    }
}

impl PodLister for PodInformer {
    fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ApiError> {
        PodKey::new(namespace, name)
            .and_then(|key| self.get(&key))
            .ok_or_else(|| ApiError::pod_not_found(namespace, name))
    }
}

/// Keeps `informer` in sync with `source` until `cancel` fires. Pods are
/// listed once and then watched from the last seen resource version; a
/// full relist happens on `410 Gone` and every `resync`.
pub async fn run_list_watch(
    source: Arc<dyn PodSource>,
    informer: PodInformer,
    cancel: CancellationToken,
    resync: Duration,
) {
    let mut backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
    let max_backoff = Duration::from_millis(BACKOFF_MAX_MS);
    let mut position = WatchPosition::default();

    while !cancel.is_cancelled() {
        match list_and_watch(source.as_ref(), &informer, &cancel, resync, &mut position).await {
            Ok(()) => backoff = Duration::from_millis(BACKOFF_INITIAL_MS),
            Err(err) => {
                let delay_ms = backoff.as_millis().to_string();
                log_warn(
                    COMPONENT,
                    "Pod list/watch failed; retrying",
                    &[("error", &err.to_string()), ("backoff_ms", &delay_ms)],
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
    log_info(COMPONENT, "Pod list/watch stopped", &[]);
}

/// Where the next watch resumes. No resource version means a relist.
#[derive(Debug, Default)]
struct WatchPosition {
    resource_version: Option<String>,
    relist_at: Option<Instant>,
}

impl WatchPosition {
    fn needs_list(&self) -> bool {
        self.resource_version.is_none()
            || self.relist_at.map_or(true, |at| Instant::now() >= at)
    }

    fn observe(&mut self, pod: &Pod) {
        if let Some(version) = pod
            .metadata
            .resource_version
            .as_ref()
            .filter(|version| !version.is_empty())
        {
            self.resource_version = Some(version.clone());
        }
    }
}

fn is_gone(err: &ApiError) -> bool {
    matches!(err, ApiError::Status { code: 410, .. })
}

async fn list_and_watch(
    source: &dyn PodSource,
    informer: &PodInformer,
    cancel: &CancellationToken,
    resync: Duration,
    position: &mut WatchPosition,
) -> Result<(), ApiError> {
    if position.needs_list() {
        let list = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            list = source.list_pods() => list?,
        };
        position.resource_version = Some(list.metadata.resource_version.clone().unwrap_or_default());
        position.relist_at = Some(Instant::now() + resync);
        let count = list.items.len().to_string();
        informer.replace(list.items);
        if !informer.has_synced() {
            log_info(COMPONENT, "Initial pod list synced", &[("pods", &count)]);
        }
        informer.mark_synced();
    }

    let version = position.resource_version.clone().unwrap_or_default();
    let relist_at = position.relist_at.unwrap_or_else(Instant::now);
    let watch = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        watch = source.watch_pods(version) => watch,
    };
    let mut stream = match watch {
        Ok(stream) => stream,
        Err(err) => {
            if is_gone(&err) {
                position.resource_version = None;
            }
            return Err(err);
        }
    };

    let resync_timer = sleep_until(relist_at);
    tokio::pin!(resync_timer);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = &mut resync_timer => return Ok(()),
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    position.observe(&event.object);
                    if event.event_type.eq_ignore_ascii_case(EVENT_BOOKMARK) {
                        continue;
                    }
                    informer.publish(&event.event_type, event.object);
                }
                Some(Err(err)) => {
                    if is_gone(&err) {
                        position.resource_version = None;
                    }
                    return Err(err);
                }
                None => return Ok(()),
            },
        }
    }
}
