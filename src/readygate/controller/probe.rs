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

//! Pod probe: resolves the probe target from the pod spec and issues one
//! HTTP GET through the API server's pod proxy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::readygate::config::ControllerSettings;
use crate::readygate::controller::reconcile::PodProxyClient;
use crate::readygate::k8s::pod::{ContainerProbe, Pod};
use crate::readygate::observability::metrics;
use crate::readygate::util::ApiError;

/// Endpoint selected for a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub port: u16,
    pub path: String,
    pub timeout: Duration,
}

/// A GET routed through `pods/<name>/proxy`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub namespace: String,
    pub pod: String,
    pub port: u16,
    pub path: String,
}

impl ProxyRequest {
    /// Proxy resource name, `http:<pod>:<port>`.
    pub fn proxy_name(&self) -> String {
        format!("http:{}:{}", self.pod, self.port)
    }

    /// Splits the probe path into the segments below `proxy/` and an
    /// optional query string. Dot segments, literal or percent-encoded, and
    /// backslashes are rejected so the request stays on the proxy subresource.
    pub fn proxy_path(&self) -> Result<(Vec<&str>, Option<&str>), ApiError> {
        let (path, query) = match self.path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (self.path.as_str(), None),
        };
        let path = path.strip_prefix('/').unwrap_or(path);
        let segments: Vec<&str> = path.split('/').collect();
        if segments.iter().any(|segment| is_unsafe_segment(segment)) {
            return Err(ApiError::InvalidProbePath(self.path.clone()));
        }
        Ok((segments, query))
    }
}

fn is_unsafe_segment(segment: &str) -> bool {
    if segment.contains('\\') {
        return true;
    }
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failure(String),
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success)
    }

    pub fn message(&self) -> &str {
        match self {
            ProbeOutcome::Success => "",
            ProbeOutcome::Failure(message) => message,
        }
    }

    /// Classifies a proxy response. Only an exact 200 counts as ready.
    pub fn from_response(response: Result<u16, ApiError>) -> Self {
        match response {
            Ok(200) => ProbeOutcome::Success,
            Ok(code) => ProbeOutcome::Failure(format!("unexpected status code {code}")),
            Err(err) => ProbeOutcome::Failure(single_line(&err.to_string())),
        }
    }
}

fn single_line(message: &str) -> String {
    message.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolves port, path and timeout from the first container.
pub fn probe_target(pod: &Pod, settings: &ControllerSettings) -> ProbeTarget {
    let container = pod.spec.containers.first();

    let port = container
        .and_then(|container| container.ports.first())
        .and_then(|port| u16::try_from(port.container_port).ok())
        .filter(|port| *port > 0)
        .unwrap_or(settings.default_port);

    let probe: Option<&ContainerProbe> = container.and_then(|container| {
        container
            .readiness_probe
            .as_ref()
            .or(container.liveness_probe.as_ref())
    });

    let path = probe
        .and_then(|probe| probe.http_get.as_ref())
        .and_then(|action| action.path.as_deref())
        .filter(|path| !path.is_empty())
        .unwrap_or(settings.default_path.as_str())
        .to_string();

    let timeout = probe
        .and_then(|probe| probe.timeout_seconds)
        .filter(|seconds| *seconds > 0)
        .map(|seconds| Duration::from_secs(seconds as u64))
        .unwrap_or(settings.default_timeout);

    ProbeTarget {
        port,
        path,
        timeout,
    }
}

/// Issues probes through a [`PodProxyClient`].
#[derive(Clone)]
pub struct PodProbe {
    client: Arc<dyn PodProxyClient>,
    settings: Arc<ControllerSettings>,
}

impl PodProbe {
    pub fn new(client: Arc<dyn PodProxyClient>, settings: Arc<ControllerSettings>) -> Self {
        Self { client, settings }
    }

    pub fn target(&self, pod: &Pod) -> ProbeTarget {
        probe_target(pod, &self.settings)
    }

    /// Probes `pod` once. The call never exceeds the resolved timeout.
    pub async fn probe(&self, pod: &Pod) -> ProbeOutcome {
        let target = self.target(pod);
        let request = ProxyRequest {
            namespace: pod.namespace().to_string(),
            pod: pod.name().unwrap_or_default().to_string(),
            port: target.port,
            path: target.path,
        };

        let started = Instant::now();
        if let Err(err) = request.proxy_path() {
            let outcome = ProbeOutcome::from_response(Err(err));
            metrics::record_probe(false, started.elapsed());
            return outcome;
        }
        let response = match tokio::time::timeout(
            target.timeout,
            self.client.proxy_get(request, target.timeout),
        )
        .await
        {
            Ok(response) => response,
            Err(_) => Err(ApiError::Timeout(target.timeout)),
        };
        let outcome = ProbeOutcome::from_response(response);
        metrics::record_probe(outcome.is_success(), started.elapsed());
        outcome
    }
}
