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

//! Reconciliation of a single pod key and the collaborator traits the
//! reconciler depends on.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;

use crate::readygate::config::ControllerSettings;
use crate::readygate::controller::condition::{ConditionWriter, WriteOutcome};
use crate::readygate::controller::probe::{PodProbe, ProxyRequest};
use crate::readygate::controller::queue::WorkQueue;
use crate::readygate::controller::{PodKey, ReconcileError};
use crate::readygate::k8s::pod::{ConditionStatus, Pod};
use crate::readygate::logger::{log_debug, log_error, log_info};
use crate::readygate::observability::metrics::{self, ReconcileResult};
use crate::readygate::observability::tracing::with_span;
use crate::readygate::util::ApiError;

const COMPONENT: &str = "reconciler";

pub type ApiFuture<T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send>>;

/// Read access to the informer cache. Lookups never reach the network.
pub trait PodLister: Send + Sync {
    /// Returns [`ApiError::NotFound`] when the pod is not cached.
    fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ApiError>;
}

/// Writes the `status` subresource of a pod.
pub trait PodStatusUpdater: Send + Sync {
    fn update_pod_status(&self, pod: Pod) -> ApiFuture<()>;
}

/// Issues GET requests through the API server's pod proxy and reports the
/// HTTP status returned by the pod.
pub trait PodProxyClient: Send + Sync {
    fn proxy_get(&self, request: ProxyRequest, timeout: Duration) -> ApiFuture<u16>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The pod no longer exists; nothing was written.
    Vanished,
    Probed {
        status: ConditionStatus,
        transitioned: bool,
    },
}

/// Probes one pod and records the result as its gate condition.
pub struct PodReconciler {
    lister: Arc<dyn PodLister>,
    probe: PodProbe,
    writer: ConditionWriter,
}

impl PodReconciler {
    pub fn new(
        settings: Arc<ControllerSettings>,
        lister: Arc<dyn PodLister>,
        updater: Arc<dyn PodStatusUpdater>,
        proxy: Arc<dyn PodProxyClient>,
    ) -> Self {
        let condition_type = settings.condition_type.clone();
        Self {
            lister,
            writer: ConditionWriter::new(updater, condition_type),
            probe: PodProbe::new(proxy, settings),
        }
    }

    pub async fn reconcile(&self, key: &PodKey) -> Result<ReconcileOutcome, ReconcileError> {
        let pod = match self.lister.get_pod(key.namespace(), key.name()) {
            Ok(pod) => pod,
            Err(err) if err.is_not_found() => return Ok(ReconcileOutcome::Vanished),
            Err(source) => {
                return Err(ReconcileError::Lookup {
                    key: key.clone(),
                    source,
                })
            }
        };

        let outcome = self.probe.probe(&pod).await;

        match self.writer.write(&pod, &outcome).await {
            Ok(WriteOutcome::Vanished) => Ok(ReconcileOutcome::Vanished),
            Ok(WriteOutcome::Written {
                status,
                transitioned,
            }) => Ok(ReconcileOutcome::Probed {
                status,
                transitioned,
            }),
            Err(source) => Err(ReconcileError::StatusUpdate {
                key: key.clone(),
                source,
            }),
        }
    }
}

/// Takes one key from `queue`, reconciles it and settles its queue state.
/// Returns `false` once the queue has shut down.
pub async fn process_next_work_item(queue: &WorkQueue<PodKey>, reconciler: &PodReconciler) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    let result = with_span(
        COMPONENT,
        "reconcile",
        AssertUnwindSafe(reconciler.reconcile(&key)).catch_unwind(),
    )
    .await;

    let pod = key.to_string();
    match result {
        Ok(Ok(ReconcileOutcome::Vanished)) => {
            queue.forget(&key);
            metrics::record_reconcile(ReconcileResult::Vanished);
            log_debug(COMPONENT, "Pod no longer exists; skipping", &[("pod", &pod)]);
        }
        Ok(Ok(ReconcileOutcome::Probed {
            status,
            transitioned,
        })) => {
            queue.forget(&key);
            metrics::record_reconcile(ReconcileResult::Success);
            if transitioned {
                log_info(
                    COMPONENT,
                    "Readiness gate changed",
                    &[("pod", &pod), ("status", status.as_str())],
                );
            } else {
                log_debug(
                    COMPONENT,
                    "Readiness gate refreshed",
                    &[("pod", &pod), ("status", status.as_str())],
                );
            }
        }
        Ok(Err(err)) => {
            metrics::record_reconcile(ReconcileResult::Error);
            let retries = (queue.num_requeues(&key) + 1).to_string();
            log_error(
                COMPONENT,
                "Reconcile failed; retrying with backoff",
                &[("pod", &pod), ("error", &err.to_string()), ("retry", &retries)],
            );
            queue.add_rate_limited(key.clone());
        }
        Err(_) => {
            metrics::record_reconcile(ReconcileResult::Error);
            log_error(
                COMPONENT,
                "Reconcile panicked; retrying with backoff",
                &[("pod", &pod)],
            );
            queue.add_rate_limited(key.clone());
        }
    }

    queue.done(&key);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readygate::logger::{captured_logs, LogLevel};
    use crate::readygate::test_support::{
        gated_pod, FakePodLister, FakeProxyClient, FakeStatusUpdater,
    };

    struct Harness {
        lister: Arc<FakePodLister>,
        updater: Arc<FakeStatusUpdater>,
        proxy: Arc<FakeProxyClient>,
        reconciler: PodReconciler,
        queue: WorkQueue<PodKey>,
    }

    fn harness(status: u16) -> Harness {
        let settings = Arc::new(ControllerSettings::default());
        let lister = Arc::new(FakePodLister::new());
        let updater = Arc::new(FakeStatusUpdater::new());
        let proxy = Arc::new(FakeProxyClient::with_status(status));
        let reconciler = PodReconciler::new(
            Arc::clone(&settings),
            lister.clone(),
            updater.clone(),
            proxy.clone(),
        );
        Harness {
            lister,
            updater,
            proxy,
            reconciler,
            queue: WorkQueue::new(settings.backoff_base, settings.backoff_cap),
        }
    }

    fn key(namespace: &str, name: &str) -> PodKey {
        PodKey::new(namespace, name).expect("valid key")
    }

    #[tokio::test]
    async fn probes_and_writes_true_for_200() {
        let h = harness(200);
        let gate = ControllerSettings::default().condition_type;
        h.lister.insert(gated_pod("a", "ok", &gate));

        let outcome = h.reconciler.reconcile(&key("a", "ok")).await.expect("reconcile");
        assert_eq!(
            outcome,
            ReconcileOutcome::Probed {
                status: ConditionStatus::True,
                transitioned: true,
            }
        );
        let written = h.updater.last_update().expect("status written");
        assert_eq!(
            written.condition(&gate).map(|c| c.status),
            Some(ConditionStatus::True)
        );
    }

    #[tokio::test]
    async fn deletion_race_is_quiet_and_forgotten() {
        let h = harness(200);
        let gone = key("race-ns", "gone-pod");
        h.queue.add(gone.clone());
        h.queue.add_rate_limited(gone.clone());

        assert!(process_next_work_item(&h.queue, &h.reconciler).await);
        assert_eq!(h.queue.num_requeues(&gone), 0);
        assert!(h.updater.updates().is_empty());
        assert_eq!(h.proxy.requests().len(), 0);
        let errors: Vec<_> = captured_logs("pod=race-ns/gone-pod")
            .into_iter()
            .filter(|(level, _)| *level >= LogLevel::Warn)
            .collect();
        assert!(errors.is_empty(), "unexpected error logs: {errors:?}");
    }

    #[tokio::test]
    async fn vanished_during_update_is_success() {
        let h = harness(200);
        let gate = ControllerSettings::default().condition_type;
        h.lister.insert(gated_pod("a", "late", &gate));
        h.updater.fail_next(ApiError::pod_not_found("a", "late"));

        let outcome = h
            .reconciler
            .reconcile(&key("a", "late"))
            .await
            .expect("reconcile");
        assert_eq!(outcome, ReconcileOutcome::Vanished);
    }

    #[tokio::test]
    async fn update_failure_requeues_with_backoff() {
        let h = harness(200);
        let gate = ControllerSettings::default().condition_type;
        h.lister.insert(gated_pod("retry-ns", "flaky", &gate));
        h.updater.fail_next(ApiError::Transport("connection reset".to_string()));
        let flaky = key("retry-ns", "flaky");
        h.queue.add(flaky.clone());

        assert!(process_next_work_item(&h.queue, &h.reconciler).await);
        assert_eq!(h.queue.num_requeues(&flaky), 1);
        assert_eq!(h.queue.in_flight(), 0);

        let logs = captured_logs("pod=retry-ns/flaky");
        assert!(logs.iter().any(|(level, _)| *level == LogLevel::Error));
    }

    #[tokio::test]
    async fn proxy_errors_are_written_as_failed_and_forgotten() {
        let h = harness(200);
        let gate = ControllerSettings::default().condition_type;
        let cases = [
            (
                "refused",
                ApiError::Transport("dial tcp 10.0.0.7:8888: connection refused".to_string()),
                "transport error: dial tcp 10.0.0.7:8888: connection refused",
            ),
            (
                "stalled",
                ApiError::Timeout(Duration::from_secs(5)),
                "request timed out after 5s",
            ),
        ];

        for (name, error, message) in cases {
            h.lister.insert(gated_pod("probe-ns", name, &gate));
            h.proxy.push_response(Err(error));
            let pod_key = key("probe-ns", name);
            h.queue.add(pod_key.clone());

            assert!(process_next_work_item(&h.queue, &h.reconciler).await);
            assert_eq!(h.queue.num_requeues(&pod_key), 0);
            assert!(h.queue.is_empty());

            let written = h.updater.last_update().expect("status written");
            assert_eq!(written.name(), Some(name));
            let condition = written.condition(&gate).expect("gate condition");
            assert_eq!(condition.status, ConditionStatus::False);
            assert_eq!(condition.reason, "Failed");
            assert_eq!(condition.message, message);
        }
        assert_eq!(h.proxy.calls(), 2);
    }

    #[tokio::test]
    async fn lister_errors_other_than_not_found_fail() {
        let h = harness(200);
        h.lister.fail_with(ApiError::Transport("cache unavailable".to_string()));

        let err = h
            .reconciler
            .reconcile(&key("a", "p"))
            .await
            .expect_err("lookup failure");
        assert_eq!(
            err,
            ReconcileError::Lookup {
                key: key("a", "p"),
                source: ApiError::Transport("cache unavailable".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn shut_down_queue_stops_processing() {
        let h = harness(200);
        h.queue.shut_down();
        assert!(!process_next_work_item(&h.queue, &h.reconciler).await);
    }
}
