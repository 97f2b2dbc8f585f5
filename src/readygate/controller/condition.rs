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

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::readygate::controller::probe::ProbeOutcome;
use crate::readygate::controller::reconcile::PodStatusUpdater;
use crate::readygate::k8s::pod::{ConditionStatus, Pod, PodCondition};
use crate::readygate::observability::metrics::{self, StatusUpdateResult};
use crate::readygate::util::ApiError;

pub const REASON_FAILED: &str = "Failed";

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Formats `at` the way the API server stores condition timestamps.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Builds the gate condition reflecting `outcome`, stamped with `now`.
pub fn gate_condition(condition_type: &str, outcome: &ProbeOutcome, now: &str) -> PodCondition {
    let (status, reason) = match outcome {
        ProbeOutcome::Success => (ConditionStatus::True, String::new()),
        ProbeOutcome::Failure(_) => (ConditionStatus::False, REASON_FAILED.to_string()),
    };
    PodCondition {
        condition_type: condition_type.to_string(),
        status,
        last_probe_time: Some(now.to_string()),
        last_transition_time: Some(now.to_string()),
        reason,
        message: outcome.message().to_string(),
    }
}

/// Merges `condition` into the pod status, collapsing duplicates of its type.
/// An existing condition with the same status keeps its `lastTransitionTime`. Returns `true` when the status
/// changed or the condition was added.
pub fn merge_condition(pod: &mut Pod, mut condition: PodCondition) -> bool {
    let status = pod.status.get_or_insert_with(Default::default);
    let mut seen = false;
    status.conditions.retain(|existing| {
        if existing.condition_type != condition.condition_type {
            return true;
        }
        let first = !seen;
        seen = true;
        first
    });

    match status
        .conditions
        .iter_mut()
        .find(|existing| existing.condition_type == condition.condition_type)
    {
        Some(existing) => {
            let transitioned = existing.status != condition.status;
            if !transitioned {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
            transitioned
        }
        None => {
            status.conditions.push(condition);
            true
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written {
        status: ConditionStatus,
        transitioned: bool,
    },
    /// The pod disappeared before the update landed.
    Vanished,
}

/// Writes the gate condition for a probed pod.
#[derive(Clone)]
pub struct ConditionWriter {
    updater: Arc<dyn PodStatusUpdater>,
    condition_type: String,
    clock: Clock,
}

impl ConditionWriter {
    pub fn new(updater: Arc<dyn PodStatusUpdater>, condition_type: impl Into<String>) -> Self {
        Self {
            updater,
            condition_type: condition_type.into(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Sends the status update even when only `lastProbeTime` moved, so the
    /// condition doubles as a heartbeat.
    pub async fn write(&self, pod: &Pod, outcome: &ProbeOutcome) -> Result<WriteOutcome, ApiError> {
        let now = format_timestamp((self.clock)());
        let condition = gate_condition(&self.condition_type, outcome, &now);
        let status = condition.status;

        let mut updated = pod.clone();
        let transitioned = merge_condition(&mut updated, condition);

        match self.updater.update_pod_status(updated).await {
            Ok(()) => {
                metrics::record_status_update(StatusUpdateResult::Success);
                Ok(WriteOutcome::Written {
                    status,
                    transitioned,
                })
            }
            Err(err) if err.is_not_found() => {
                metrics::record_status_update(StatusUpdateResult::NotFound);
                Ok(WriteOutcome::Vanished)
            }
            Err(err) => {
                metrics::record_status_update(StatusUpdateResult::Error);
                Err(err)
            }
        }
    }
}
