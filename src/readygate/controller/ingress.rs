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

//! Filters informer events down to pods that still need their gate probed.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::readygate::controller::queue::WorkQueue;
use crate::readygate::controller::PodKey;
use crate::readygate::k8s::pod::{ConditionStatus, Pod};
use crate::readygate::k8s::watch::WatchEvent;
use crate::readygate::logger::{log_debug, log_warn};

const COMPONENT: &str = "ingress";

/// Returns `true` when `pod` declares the gate and the gate is not yet
/// satisfied.
pub fn needs_probe(pod: &Pod, condition_type: &str) -> bool {
    if pod.spec.readiness_gates.is_empty() {
        return false;
    }
    if pod
        .condition(condition_type)
        .is_some_and(|condition| condition.status == ConditionStatus::True)
    {
        return false;
    }
    pod.declares_readiness_gate(condition_type)
}

#[derive(Clone)]
pub struct EventIngress {
    queue: WorkQueue<PodKey>,
    condition_type: Arc<str>,
}

impl EventIngress {
    pub fn new(queue: WorkQueue<PodKey>, condition_type: &str) -> Self {
        Self {
            queue,
            condition_type: Arc::from(condition_type),
        }
    }

    /// Enqueues `pod` when it needs a probe. Returns whether it was enqueued.
    pub fn on_pod_event(&self, pod: &Pod) -> bool {
        if !needs_probe(pod, &self.condition_type) {
            return false;
        }
        let Some(key) = PodKey::from_pod(pod) else {
            return false;
        };
        log_debug(COMPONENT, "Enqueue pod", &[("pod", &key.to_string())]);
        self.queue.add(key);
        true
    }

    /// Forwards add/update events from `events` until `cancel` fires or the
    /// channel closes. Deletions are ignored; the reconciler sees the pod
    /// vanish on its own.
    pub fn spawn_pump(
        &self,
        mut events: broadcast::Receiver<WatchEvent<Pod>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let ingress = self.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = events.recv() => received,
                };
                match received {
                    Ok(event) if event.is_deleted() => {}
                    Ok(event) => {
                        ingress.on_pod_event(&event.object);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log_warn(
                            COMPONENT,
                            "Pod event receiver lagged; waiting for resync",
                            &[("skipped", &skipped.to_string())],
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }
}
