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

use serde::Serialize;

use crate::readygate::controller::informer::PodInformer;
use crate::readygate::controller::ReadinessGateController;

const ERROR_MAX_LEN: usize = 240;

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn healthy(name: &'static str) -> Self {
        ComponentHealth {
            name,
            healthy: true,
            error: None,
        }
    }

    fn unhealthy(name: &'static str, err: impl ToString) -> Self {
        let mut message = err.to_string();
        if message.len() > ERROR_MAX_LEN {
            message.truncate(ERROR_MAX_LEN);
        }
        ComponentHealth {
            name,
            healthy: false,
            error: Some(message),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }
}

/// Returns a readiness assessment used by `/readyz`.
pub fn readiness_report(controller: &ReadinessGateController, informer: &PodInformer) -> HealthReport {
    let mut components = Vec::with_capacity(3);

    let expected = controller.settings().workers;
    let running = controller.running_workers();
    if running == expected {
        components.push(ComponentHealth::healthy("workers"));
    } else {
        components.push(ComponentHealth::unhealthy(
            "workers",
            format!("{running} of {expected} workers running"),
        ));
    }

    if controller.is_shutting_down() {
        components.push(ComponentHealth::unhealthy("workqueue", "shutting down"));
    } else {
        components.push(ComponentHealth::healthy("workqueue"));
    }

    if informer.has_synced() {
        components.push(ComponentHealth::healthy("pod_informer"));
    } else {
        components.push(ComponentHealth::unhealthy(
            "pod_informer",
            "waiting for initial pod list",
        ));
    }

    let status = if components.iter().all(|component| component.healthy) {
        HealthStatus::Ready
    } else {
        HealthStatus::Degraded
    };

    HealthReport { status, components }
}

/// Liveness probes check that the process is servicing requests. They do not
/// perform dependency checks to remain lightweight.
pub fn liveness_report() -> HealthReport {
    HealthReport {
        status: HealthStatus::Ready,
        components: vec![ComponentHealth::healthy("process")],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readygate::config::ControllerSettings;
    use crate::readygate::test_support::{FakePodLister, FakeProxyClient, FakeStatusUpdater};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn ready_once_workers_run_and_informer_synced() {
        let controller = ReadinessGateController::new(
            ControllerSettings::default().with_workers(2),
            Arc::new(FakePodLister::new()),
            Arc::new(FakeStatusUpdater::new()),
            Arc::new(FakeProxyClient::with_status(200)),
        );
        let informer = PodInformer::new();

        let report = readiness_report(&controller, &informer);
        assert!(!report.is_ready());
        assert_eq!(report.components.iter().filter(|c| !c.healthy).count(), 2);

        controller.start();
        informer.mark_synced();
        assert!(readiness_report(&controller, &informer).is_ready());

        controller
            .shutdown(Duration::from_secs(1))
            .await
            .expect("shutdown");
        let report = readiness_report(&controller, &informer);
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn liveness_is_always_ready() {
        assert!(liveness_report().is_ready());
    }
}
