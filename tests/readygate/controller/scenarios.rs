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

//! End-to-end controller scenarios against in-memory collaborators.

use std::sync::Arc;
use std::time::{Duration, Instant};

use readygate::readygate::config::ControllerSettings;
use readygate::readygate::controller::{PodKey, ReadinessGateController};
use readygate::readygate::k8s::pod::{ConditionStatus, PodCondition, PodStatus};
use readygate::readygate::test_support::{
    gated_pod, gated_pod_with_probe, FakePodLister, FakeProxyClient, FakeStatusUpdater,
};
use readygate::readygate::util::ApiError;
use tokio::time::{sleep, timeout};

struct Fixture {
    controller: ReadinessGateController,
    lister: Arc<FakePodLister>,
    updater: Arc<FakeStatusUpdater>,
    proxy: Arc<FakeProxyClient>,
    gate: String,
}

fn fixture(proxy: FakeProxyClient, workers: usize) -> Fixture {
    let lister = Arc::new(FakePodLister::new());
    let updater = Arc::new(FakeStatusUpdater::new());
    let proxy = Arc::new(proxy);
    let settings = ControllerSettings::default().with_workers(workers);
    let gate = settings.condition_type.clone();
    let controller =
        ReadinessGateController::new(settings, lister.clone(), updater.clone(), proxy.clone());
    Fixture {
        controller,
        lister,
        updater,
        proxy,
        gate,
    }
}

async fn wait_until_idle(controller: &ReadinessGateController) {
    timeout(Duration::from_secs(5), async {
        loop {
            let queue = controller.queue();
            if queue.is_empty() && queue.in_flight() == 0 {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue drained in time");
}

fn key(namespace: &str, name: &str) -> PodKey {
    PodKey::new(namespace, name).expect("valid key")
}

#[tokio::test]
async fn happy_path_writes_true_condition() {
    let f = fixture(FakeProxyClient::with_status(200), 2);
    let pod = gated_pod_with_probe("a", "p1", &f.gate, 8080, "/healthz", 5);
    f.lister.insert(pod.clone());

    f.controller.start();
    assert!(f.controller.on_pod_event(&pod));

    let updates = timeout(Duration::from_secs(5), f.updater.wait_for_updates(1))
        .await
        .expect("status written");
    let condition = updates[0].condition(&f.gate).expect("gate condition");
    assert_eq!(condition.status, ConditionStatus::True);
    assert!(condition.reason.is_empty());
    assert!(condition.message.is_empty());
    assert!(condition.last_probe_time.is_some());
    assert_eq!(condition.last_probe_time, condition.last_transition_time);

    let requests = f.proxy.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0.namespace, "a");
    assert_eq!(requests[0].0.proxy_name(), "http:p1:8080");
    assert_eq!(requests[0].0.path, "/healthz");
    assert_eq!(requests[0].1, Duration::from_secs(5));

    wait_until_idle(&f.controller).await;
    assert_eq!(f.controller.queue().num_requeues(&key("a", "p1")), 0);
    f.controller
        .shutdown(Duration::from_secs(1))
        .await
        .expect("shutdown");
}

#[tokio::test]
async fn non_200_status_writes_failed_condition() {
    let f = fixture(FakeProxyClient::with_status(500), 2);
    let pod = gated_pod("a", "p2", &f.gate);
    f.lister.insert(pod.clone());

    f.controller.start();
    f.controller.on_pod_event(&pod);

    let updates = timeout(Duration::from_secs(5), f.updater.wait_for_updates(1))
        .await
        .expect("status written");
    let condition = updates[0].condition(&f.gate).expect("gate condition");
    assert_eq!(condition.status, ConditionStatus::False);
    assert_eq!(condition.reason, "Failed");
    assert_eq!(condition.message, "unexpected status code 500");
    assert_eq!(f.proxy.requests()[0].0.port, 8888);

    wait_until_idle(&f.controller).await;
    assert_eq!(f.controller.queue().num_requeues(&key("a", "p2")), 0);
    f.controller
        .shutdown(Duration::from_secs(1))
        .await
        .expect("shutdown");
}

#[tokio::test]
async fn satisfied_gate_is_never_enqueued() {
    let f = fixture(FakeProxyClient::with_status(200), 1);
    let mut pod = gated_pod("a", "p3", &f.gate);
    pod.status = Some(PodStatus {
        conditions: vec![PodCondition {
            condition_type: f.gate.clone(),
            status: ConditionStatus::True,
            ..Default::default()
        }],
        ..Default::default()
    });
    f.lister.insert(pod.clone());

    f.controller.start();
    assert!(!f.controller.on_pod_event(&pod));
    assert!(f.controller.queue().is_empty());

    sleep(Duration::from_millis(50)).await;
    assert_eq!(f.proxy.calls(), 0);
    assert!(f.updater.updates().is_empty());
    f.controller
        .shutdown(Duration::from_secs(1))
        .await
        .expect("shutdown");
}

#[tokio::test]
async fn pod_deleted_before_processing_is_skipped() {
    let f = fixture(FakeProxyClient::with_status(200), 1);
    let pod = gated_pod("a", "p4", &f.gate);
    f.lister.insert(pod.clone());

    assert!(f.controller.on_pod_event(&pod));
    f.lister.remove("a", "p4");
    f.controller.start();

    wait_until_idle(&f.controller).await;
    assert_eq!(f.proxy.calls(), 0);
    assert!(f.updater.updates().is_empty());
    assert_eq!(f.controller.queue().num_requeues(&key("a", "p4")), 0);
    f.controller
        .shutdown(Duration::from_secs(1))
        .await
        .expect("shutdown");
}

#[tokio::test]
async fn transient_update_failure_is_retried_once() {
    let f = fixture(FakeProxyClient::with_status(200), 1);
    let pod = gated_pod("a", "p5", &f.gate);
    f.lister.insert(pod.clone());
    f.updater
        .fail_next(ApiError::Transport("connection reset".to_string()));

    f.controller.start();
    f.controller.on_pod_event(&pod);

    let updates = timeout(Duration::from_secs(5), f.updater.wait_for_updates(1))
        .await
        .expect("status eventually written");
    assert_eq!(updates.len(), 1);
    assert_eq!(
        updates[0].condition(&f.gate).map(|c| c.status),
        Some(ConditionStatus::True)
    );

    wait_until_idle(&f.controller).await;
    assert_eq!(f.updater.attempts(), 2);
    assert_eq!(f.proxy.calls(), 2);
    assert_eq!(f.controller.queue().num_requeues(&key("a", "p5")), 0);
    f.controller
        .shutdown(Duration::from_secs(1))
        .await
        .expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_under_load_finishes_before_deadline() {
    let f = fixture(
        FakeProxyClient::with_status(200).with_delay(Duration::from_millis(5)),
        10,
    );
    for index in 0..10_000 {
        let pod = gated_pod("load", &format!("pod-{index}"), &f.gate);
        f.lister.insert(pod.clone());
        f.controller.on_pod_event(&pod);
    }
    assert_eq!(f.controller.queue().len(), 10_000);

    f.controller.start();
    sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    f.controller
        .shutdown(Duration::from_secs(1))
        .await
        .expect("workers exit before the deadline");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(f.controller.running_workers(), 0);
    assert!(f.proxy.calls() < 10_000);
}
