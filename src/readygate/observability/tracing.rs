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

//! Span plumbing for the controller. Every reconciliation runs inside a
//! `tracing` span and a task-local [`TraceContext`]; the logger reads the
//! context so all lines emitted for one key share a `trace_id`.

use std::future::Future;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::task_local;
use tracing::Instrument;
use tracing_subscriber::registry::Registry;

#[derive(Clone, Debug)]
pub struct TraceContext {
    trace_id: Arc<str>,
    span_id: Arc<str>,
}

impl TraceContext {
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }
}

task_local! {
    static ACTIVE_TRACE: TraceContext;
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber once. A subscriber installed by an
/// embedding process wins.
pub fn init() {
    TRACING_INIT.get_or_init(|| {
        let _ = tracing::subscriber::set_global_default(Registry::default());
    });
}

pub fn current_context() -> Option<TraceContext> {
    ACTIVE_TRACE.try_with(|ctx| ctx.clone()).ok()
}

/// Runs `fut` inside a span named `span_name`. Nested calls keep the parent
/// trace id and mint a fresh span id.
pub async fn with_span<T>(
    component: &'static str,
    span_name: &'static str,
    fut: impl Future<Output = T>,
) -> T {
    let trace_id = current_context()
        .map(|ctx| ctx.trace_id)
        .unwrap_or_else(|| Arc::from(format!("{:032x}", rand::random::<u128>())));
    let span_id: Arc<str> = Arc::from(format!("{:016x}", rand::random::<u64>()));
    let context = TraceContext {
        trace_id: trace_id.clone(),
        span_id: span_id.clone(),
    };
    let span = tracing::info_span!(
        "readygate",
        component = component,
        span = span_name,
        trace_id = trace_id.as_ref(),
        span_id = span_id.as_ref(),
    );

    ACTIVE_TRACE.scope(context, fut.instrument(span)).await
}
