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

//! Readiness-gate reconciliation core.
//!
//! Pod events enter through [`ingress`], are deduplicated by the
//! [`queue::WorkQueue`], and are processed by the worker pool owned by
//! [`runtime::ReadinessGateController`]. Each worker runs
//! [`reconcile::PodReconciler`], which probes the pod through the API proxy
//! ([`probe`]) and writes the gate condition back ([`condition`]).

pub mod backoff;
pub mod condition;
pub mod informer;
pub mod ingress;
pub mod key;
pub mod probe;
pub mod queue;
pub mod reconcile;
pub mod runtime;

use crate::readygate::util::ApiError;

pub use key::PodKey;
pub use reconcile::{ApiFuture, PodLister, PodProxyClient, PodStatusUpdater};
pub use runtime::{ReadinessGateController, ShutdownError};

/// Failure of a single reconciliation. The key is retried with backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to look up pod {key}: {source}")]
    Lookup { key: PodKey, source: ApiError },
    #[error("failed to update status of pod {key}: {source}")]
    StatusUpdate { key: PodKey, source: ApiError },
}
