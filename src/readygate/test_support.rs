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

//! In-memory collaborators and pod builders shared by unit and integration
//! tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::readygate::controller::probe::ProxyRequest;
use crate::readygate::controller::reconcile::{
    ApiFuture, PodLister, PodProxyClient, PodStatusUpdater,
};
use crate::readygate::controller::PodKey;
use crate::readygate::k8s::pod::{
    ContainerPort, ContainerProbe, ContainerSpec, HttpGetAction, ObjectMeta, Pod,
    PodReadinessGate, PodSpec,
};
use crate::readygate::util::ApiError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pod declaring `gate` with a single container and no probe.
pub fn gated_pod(namespace: &str, name: &str, gate: &str) -> Pod {
    Pod::new(
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        PodSpec {
            containers: vec![ContainerSpec {
                name: "app".to_string(),
                ..Default::default()
            }],
            readiness_gates: vec![PodReadinessGate {
                condition_type: gate.to_string(),
            }],
            ..Default::default()
        },
    )
}

/// Pod declaring `gate` whose first container exposes `port` and an HTTP
/// readiness probe on `path` with `timeout_seconds`.
pub fn gated_pod_with_probe(
    namespace: &str,
    name: &str,
    gate: &str,
    port: i32,
    path: &str,
    timeout_seconds: i32,
) -> Pod {
    let mut pod = gated_pod(namespace, name, gate);
    let container = &mut pod.spec.containers[0];
    container.ports.push(ContainerPort {
        container_port: port,
        ..Default::default()
    });
    container.readiness_probe = Some(ContainerProbe {
        http_get: Some(HttpGetAction {
            path: Some(path.to_string()),
            ..Default::default()
        }),
        timeout_seconds: Some(timeout_seconds),
        ..Default::default()
    });
    pod
}

/// Lister backed by a map. `fail_with` makes every lookup return an error.
#[derive(Default)]
pub struct FakePodLister {
    pods: Mutex<HashMap<PodKey, Pod>>,
    failure: Mutex<Option<ApiError>>,
}

impl FakePodLister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pod: Pod) {
        if let Some(key) = PodKey::from_pod(&pod) {
            lock(&self.pods).insert(key, pod);
        }
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        if let Some(key) = PodKey::new(namespace, name) {
            lock(&self.pods).remove(&key);
        }
    }

    pub fn fail_with(&self, error: ApiError) {
        *lock(&self.failure) = Some(error);
    }
}

impl PodLister for FakePodLister {
    fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ApiError> {
        if let Some(error) = lock(&self.failure).clone() {
            return Err(error);
        }
        PodKey::new(namespace, name)
            .and_then(|key| lock(&self.pods).get(&key).cloned())
            .ok_or_else(|| ApiError::pod_not_found(namespace, name))
    }
}

/// Records every status update. Scripted failures are consumed first.
#[derive(Default)]
pub struct FakeStatusUpdater {
    updates: Mutex<Vec<Pod>>,
    failures: Mutex<VecDeque<ApiError>>,
    attempts: AtomicUsize,
    changed: Arc<Notify>,
}

impl FakeStatusUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: ApiError) {
        lock(&self.failures).push_back(error);
    }

    /// Update calls made so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> Vec<Pod> {
        lock(&self.updates).clone()
    }

    pub fn last_update(&self) -> Option<Pod> {
        lock(&self.updates).last().cloned()
    }

    /// Resolves once at least `count` updates have succeeded.
    pub async fn wait_for_updates(&self, count: usize) -> Vec<Pod> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let updates = lock(&self.updates);
                if updates.len() >= count {
                    return updates.clone();
                }
            }
            notified.await;
        }
    }
}

impl PodStatusUpdater for FakeStatusUpdater {
    fn update_pod_status(&self, pod: Pod) -> ApiFuture<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let result = match lock(&self.failures).pop_front() {
            Some(error) => Err(error),
            None => {
                lock(&self.updates).push(pod);
                self.changed.notify_waiters();
                Ok(())
            }
        };
        Box::pin(async move { result })
    }
}

/// Proxy that answers with scripted responses, falling back to a fixed
/// status code. An optional delay simulates a slow pod.
pub struct FakeProxyClient {
    status: u16,
    delay: Option<Duration>,
    responses: Mutex<VecDeque<Result<u16, ApiError>>>,
    requests: Mutex<Vec<(ProxyRequest, Duration)>>,
    calls: AtomicUsize,
}

impl FakeProxyClient {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            delay: None,
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_response(&self, response: Result<u16, ApiError>) {
        lock(&self.responses).push_back(response);
    }

    pub fn requests(&self) -> Vec<(ProxyRequest, Duration)> {
        lock(&self.requests).clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PodProxyClient for FakeProxyClient {
    fn proxy_get(&self, request: ProxyRequest, timeout: Duration) -> ApiFuture<u16> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push((request, timeout));
        let response = lock(&self.responses)
            .pop_front()
            .unwrap_or(Ok(self.status));
        let delay = self.delay;
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            response
        })
    }
}
