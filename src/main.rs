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
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use readygate::readygate::config::{Config, ControllerSettings};
use readygate::readygate::controller::informer::{run_list_watch, PodInformer};
use readygate::readygate::controller::ReadinessGateController;
use readygate::readygate::k8s::client::ClusterClient;
use readygate::readygate::logger::{log_error, log_info, log_warn, set_log_format, LogFormat};
use readygate::readygate::observability::tracing;
use readygate::readygate::server::{self, AppState};
use readygate::readygate::util::{new_error, with_context};

/// Flags override the `READYGATE_*` environment variables.
#[derive(Parser, Debug)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
struct Args {
    /// Number of reconcile workers
    #[arg(long)]
    workers: Option<usize>,

    /// Log output format (text or json)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Address for the metrics and health endpoint
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Seconds to wait for workers to finish on shutdown
    #[arg(long, default_value_t = 30)]
    shutdown_timeout: u64,

    /// Seconds between full pod relists
    #[arg(long, default_value_t = 300)]
    resync_period: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log_error("main", "Controller exited with error", &[("error", &err.to_string())]);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let log_format = match args.log_format {
        Some(format) => format,
        None => Config::LogFormat.get().parse().map_err(new_error)?,
    };
    set_log_format(log_format);
    tracing::init();

    let mut settings = ControllerSettings::from_env().map_err(new_error)?;
    if let Some(workers) = args.workers {
        settings = settings.with_workers(workers);
    }
    let listen: SocketAddr = match args.listen {
        Some(addr) => addr,
        None => Config::Listen
            .get()
            .parse()
            .map_err(|e| with_context(e, format!("invalid {}", Config::Listen.env_var())))?,
    };

    let client = Arc::new(ClusterClient::from_config()?);
    let server_url = client.base_url().to_string();
    let workers = settings.workers.to_string();
    log_info(
        "main",
        "Starting readiness gate controller",
        &[
            ("server", &server_url),
            ("condition_type", &settings.condition_type),
            ("workers", &workers),
        ],
    );

    let informer = PodInformer::new();
    let controller = Arc::new(ReadinessGateController::new(
        settings,
        Arc::new(informer.clone()),
        client.clone(),
        client.clone(),
    ));
    let cancel = CancellationToken::new();

    let pump = controller
        .ingress()
        .spawn_pump(informer.subscribe(), cancel.clone());
    let list_watch = tokio::spawn(run_list_watch(
        client.clone(),
        informer.clone(),
        cancel.clone(),
        Duration::from_secs(args.resync_period.max(1)),
    ));
    controller.start();

    let state = AppState {
        controller: Arc::clone(&controller),
        informer: informer.clone(),
    };
    let mut server_task = tokio::spawn(server::serve(listen, state, cancel.clone()));

    let server_result = tokio::select! {
        signal = shutdown_signal() => {
            signal?;
            None
        }
        result = &mut server_task => Some(result),
    };

    log_info("main", "Shutting down", &[]);
    cancel.cancel();
    let shutdown = controller
        .shutdown(Duration::from_secs(args.shutdown_timeout))
        .await;
    let _ = pump.await;
    let _ = list_watch.await;

    let server_result = match server_result {
        Some(result) => result,
        None => server_task.await,
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(err),
        Err(err) => return Err(with_context(err, "HTTP server task failed")),
    }

    if let Err(err) = &shutdown {
        log_warn("main", "Workers did not stop in time", &[("error", &err.to_string())]);
    }
    shutdown.map_err(|err| err.into())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<(), Box<dyn Error + Send + Sync>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())
        .map_err(|e| with_context(e, "failed to install SIGTERM handler"))?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| with_context(e, "failed to listen for SIGINT"))?;
        }
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<(), Box<dyn Error + Send + Sync>> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| with_context(e, "failed to listen for Ctrl-C"))
}
