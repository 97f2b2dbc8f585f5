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

use std::error::Error;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static PROBES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static PROBE_DURATION: OnceLock<Histogram> = OnceLock::new();
static STATUS_UPDATES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static WORKQUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static WORKQUEUE_RETRIES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("readygate".to_string()), None)
            .expect("failed to initialise readygate metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register readygate metric collector");
    collector
}

fn reconciles_total() -> &'static IntCounterVec {
    RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "reconciles_total",
            "Readiness-gate reconciliations grouped by result",
        );
        let counter =
            IntCounterVec::new(opts, &["result"]).expect("failed to build reconcile counter");
        register_collector(counter)
    })
}

fn probes_total() -> &'static IntCounterVec {
    PROBES_TOTAL.get_or_init(|| {
        let opts = Opts::new("probes_total", "Pod proxy probes grouped by outcome");
        let counter = IntCounterVec::new(opts, &["result"]).expect("failed to build probe counter");
        register_collector(counter)
    })
}

fn probe_duration() -> &'static Histogram {
    PROBE_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "probe_duration_seconds",
            "Latency distribution for pod proxy probes",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]);
        let histogram = Histogram::with_opts(opts).expect("failed to build probe histogram");
        register_collector(histogram)
    })
}

fn status_updates_total() -> &'static IntCounterVec {
    STATUS_UPDATES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "status_updates_total",
            "Pod status writes grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("failed to build status update counter");
        register_collector(counter)
    })
}

fn workqueue_depth() -> &'static IntGauge {
    WORKQUEUE_DEPTH.get_or_init(|| {
        let opts = Opts::new("depth", "Keys waiting in the work queue").subsystem("workqueue");
        let gauge = IntGauge::with_opts(opts).expect("failed to build work queue depth gauge");
        register_collector(gauge)
    })
}

fn workqueue_retries_total() -> &'static IntCounter {
    WORKQUEUE_RETRIES_TOTAL.get_or_init(|| {
        let opts = Opts::new("retries_total", "Rate-limited re-adds issued by workers")
            .subsystem("workqueue");
        let counter = IntCounter::with_opts(opts).expect("failed to build retries counter");
        register_collector(counter)
    })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconcileResult {
    Success,
    Vanished,
    Error,
}

impl ReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ReconcileResult::Success => "success",
            ReconcileResult::Vanished => "vanished",
            ReconcileResult::Error => "error",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusUpdateResult {
    Success,
    NotFound,
    Error,
}

impl StatusUpdateResult {
    fn as_label(self) -> &'static str {
        match self {
            StatusUpdateResult::Success => "success",
            StatusUpdateResult::NotFound => "not_found",
            StatusUpdateResult::Error => "error",
        }
    }
}

pub fn record_reconcile(result: ReconcileResult) {
    reconciles_total()
        .with_label_values(&[result.as_label()])
        .inc();
}

pub fn record_probe(success: bool, duration: Duration) {
    let label = if success { "success" } else { "failure" };
    probes_total().with_label_values(&[label]).inc();
    probe_duration().observe(duration.as_secs_f64());
}

pub fn record_status_update(result: StatusUpdateResult) {
    status_updates_total()
        .with_label_values(&[result.as_label()])
        .inc();
}

pub fn set_workqueue_depth(depth: usize) {
    workqueue_depth().set(i64::try_from(depth).unwrap_or(i64::MAX));
}

pub fn record_workqueue_retry() {
    workqueue_retries_total().inc();
}

/// Encodes the registry in the Prometheus text exposition format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}
