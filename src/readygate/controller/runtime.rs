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

//! Worker pool lifecycle for the readiness-gate controller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::readygate::config::ControllerSettings;
use crate::readygate::controller::ingress::EventIngress;
use crate::readygate::controller::queue::WorkQueue;
use crate::readygate::controller::reconcile::{
    process_next_work_item, PodLister, PodProxyClient, PodReconciler, PodStatusUpdater,
};
use crate::readygate::controller::PodKey;
use crate::readygate::k8s::pod::Pod;
use crate::readygate::logger::{log_info, log_warn};

const COMPONENT: &str = "controller";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShutdownError {
    #[error("workers still running after {}ms", .0.as_millis())]
    Timeout(Duration),
}

/// Owns the work queue, the event ingress and the worker pool.
pub struct ReadinessGateController {
    settings: Arc<ControllerSettings>,
    queue: WorkQueue<PodKey>,
    ingress: EventIngress,
    reconciler: Arc<PodReconciler>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<WorkerCount>,
}

impl ReadinessGateController {
    pub fn new(
        settings: ControllerSettings,
        lister: Arc<dyn PodLister>,
        updater: Arc<dyn PodStatusUpdater>,
        proxy: Arc<dyn PodProxyClient>,
    ) -> Self {
        let settings = Arc::new(settings);
        let reconciler = PodReconciler::new(Arc::clone(&settings), lister, updater, proxy);
        Self::with_reconciler(settings, reconciler)
    }

    /// Builds a controller around a preconfigured reconciler.
    pub fn with_reconciler(settings: Arc<ControllerSettings>, reconciler: PodReconciler) -> Self {
        let queue = WorkQueue::new(settings.backoff_base, settings.backoff_cap);
        let ingress = EventIngress::new(queue.clone(), &settings.condition_type);
        Self {
            settings,
            queue,
            ingress,
            reconciler: Arc::new(reconciler),
            workers: Mutex::new(Vec::new()),
            running: Arc::new(WorkerCount::default()),
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn queue(&self) -> &WorkQueue<PodKey> {
        &self.queue
    }

    pub fn ingress(&self) -> &EventIngress {
        &self.ingress
    }

    /// Entry point for informer add/update notifications.
    pub fn on_pod_event(&self, pod: &Pod) -> bool {
        self.ingress.on_pod_event(pod)
    }

    /// Spawns the configured number of workers. Repeated calls are no-ops
    /// while workers exist.
    pub fn start(&self) {
        let mut workers = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !workers.is_empty() || self.queue.is_shutting_down() {
            return;
        }

        for _ in 0..self.settings.workers {
            let queue = self.queue.clone();
            let reconciler = Arc::clone(&self.reconciler);
            let running = Arc::clone(&self.running);
            running.count.fetch_add(1, Ordering::SeqCst);
            workers.push(tokio::spawn(async move {
                let _guard = RunningGuard(running);
                while process_next_work_item(&queue, &reconciler).await {}
            }));
        }

        let count = self.settings.workers.to_string();
        log_info(COMPONENT, "Started readiness gate workers", &[("workers", &count)]);
    }

    /// Stops the queue and waits up to `deadline` for every worker to exit.
    /// On timeout the workers keep finishing their current item in the
    /// background and a later call waits for them again.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        self.queue.shut_down();

        match tokio::time::timeout(deadline, self.running.wait_idle()).await {
            Ok(()) => {
                let handles = std::mem::take(
                    &mut *self
                        .workers
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()),
                );
                let results = join_all(handles).await;
                let panicked = results.iter().filter(|result| result.is_err()).count();
                if panicked > 0 {
                    log_warn(
                        COMPONENT,
                        "Workers exited abnormally",
                        &[("count", &panicked.to_string())],
                    );
                }
                log_info(COMPONENT, "Readiness gate workers stopped", &[]);
                Ok(())
            }
            Err(_) => {
                let remaining = self.running_workers().to_string();
                log_warn(
                    COMPONENT,
                    "Shutdown deadline elapsed with workers running",
                    &[("remaining", &remaining)],
                );
                Err(ShutdownError::Timeout(deadline))
            }
        }
    }

    /// Number of worker tasks that have not exited yet.
    pub fn running_workers(&self) -> usize {
        self.running.count.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }
}

#[derive(Default)]
struct WorkerCount {
    count: AtomicUsize,
    idle: Notify,
}

impl WorkerCount {
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct RunningGuard(Arc<WorkerCount>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readygate::k8s::pod::ConditionStatus;
    use crate::readygate::test_support::{
        gated_pod, FakePodLister, FakeProxyClient, FakeStatusUpdater,
    };
    use tokio::time::{sleep, timeout};

    fn controller(
        proxy: FakeProxyClient,
        workers: usize,
    ) -> (ReadinessGateController, Arc<FakePodLister>, Arc<FakeStatusUpdater>, Arc<FakeProxyClient>) {
        let lister = Arc::new(FakePodLister::new());
        let updater = Arc::new(FakeStatusUpdater::new());
        let proxy = Arc::new(proxy);
        let controller = ReadinessGateController::new(
            ControllerSettings::default().with_workers(workers),
            lister.clone(),
            updater.clone(),
            proxy.clone(),
        );
        (controller, lister, updater, proxy)
    }

    #[tokio::test]
    async fn workers_reconcile_enqueued_pods() {
        let (controller, lister, updater, _) = controller(FakeProxyClient::with_status(200), 2);
        let gate = controller.settings().condition_type.clone();
        let pod = gated_pod("a", "web", &gate);
        lister.insert(pod.clone());

        controller.start();
        assert_eq!(controller.running_workers(), 2);
        assert!(controller.on_pod_event(&pod));

        let written = timeout(Duration::from_secs(2), updater.wait_for_updates(1))
            .await
            .expect("status written in time");
        assert_eq!(
            written[0].condition(&gate).map(|c| c.status),
            Some(ConditionStatus::True)
        );

        controller
            .shutdown(Duration::from_secs(1))
            .await
            .expect("clean shutdown");
        assert_eq!(controller.running_workers(), 0);
        assert!(controller.is_shutting_down());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (controller, _, _, _) = controller(FakeProxyClient::with_status(200), 3);
        controller.start();
        controller.start();
        assert_eq!(controller.running_workers(), 3);
        controller
            .shutdown(Duration::from_secs(1))
            .await
            .expect("clean shutdown");
    }

    #[tokio::test]
    async fn shutdown_without_start_returns_immediately() {
        let (controller, _, _, _) = controller(FakeProxyClient::with_status(200), 1);
        controller
            .shutdown(Duration::from_millis(10))
            .await
            .expect("nothing to wait for");
        controller.start();
        assert_eq!(controller.running_workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_times_out_while_a_probe_is_in_flight() {
        let slow = FakeProxyClient::with_status(200).with_delay(Duration::from_secs(5));
        let (controller, lister, _, proxy) = controller(slow, 1);
        let gate = controller.settings().condition_type.clone();
        let pod = gated_pod("a", "slow", &gate);
        lister.insert(pod.clone());

        controller.start();
        controller.on_pod_event(&pod);
        while proxy.requests().is_empty() {
            sleep(Duration::from_millis(1)).await;
        }

        let err = controller
            .shutdown(Duration::from_millis(100))
            .await
            .expect_err("worker still probing");
        assert_eq!(err, ShutdownError::Timeout(Duration::from_millis(100)));
        assert_eq!(controller.running_workers(), 1);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(controller.running_workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_shutdown_keeps_waiting_for_busy_workers() {
        let slow = FakeProxyClient::with_status(200).with_delay(Duration::from_secs(5));
        let (controller, lister, updater, proxy) = controller(slow, 1);
        let gate = controller.settings().condition_type.clone();
        let pod = gated_pod("a", "slow", &gate);
        lister.insert(pod.clone());

        controller.start();
        controller.on_pod_event(&pod);
        while proxy.requests().is_empty() {
            sleep(Duration::from_millis(1)).await;
        }

        for _ in 0..2 {
            let err = controller
                .shutdown(Duration::from_millis(100))
                .await
                .expect_err("worker still probing");
            assert_eq!(err, ShutdownError::Timeout(Duration::from_millis(100)));
            assert_eq!(controller.running_workers(), 1);
        }

        controller
            .shutdown(Duration::from_secs(10))
            .await
            .expect("worker finishes its probe");
        assert_eq!(controller.running_workers(), 0);
        assert_eq!(updater.updates().len(), 1);
    }
}
