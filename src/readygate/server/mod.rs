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

//! Plain-HTTP endpoint serving metrics and health probes for the controller
//! process.

mod handlers;

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::readygate::controller::informer::PodInformer;
use crate::readygate::controller::ReadinessGateController;
use crate::readygate::logger::log_info;
use crate::readygate::util::with_context;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ReadinessGateController>,
    pub informer: PodInformer,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/readyz", get(handlers::readiness))
        .route("/livez", get(handlers::liveness))
        .route("/healthz", get(handlers::liveness))
        .with_state(state)
}

/// Serves the router on `addr` until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    cancel: CancellationToken,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| with_context(e, format!("Failed to bind server listener at {addr}")))?;

    let listen_addr_text = addr.to_string();
    log_info(
        "server",
        "HTTP server listening",
        &[("addr", listen_addr_text.as_str())],
    );

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| with_context(e, "HTTP server failed"))?;
    Ok(())
}
