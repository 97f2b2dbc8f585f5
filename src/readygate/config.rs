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

use std::env;
use std::time::Duration;

/// Condition type written by the controller. Fixed per build; override with
/// `READYGATE_CONDITION_TYPE` at compile time.
pub const GATE_CONDITION_TYPE: &str = match option_env!("READYGATE_CONDITION_TYPE") {
    Some(value) => value,
    None => "app.example/probe-200-only",
};

pub const DEFAULT_TARGET_PORT: u16 = 8888;
pub const DEFAULT_PROBE_PATH: &str = "/";
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(5);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(1000);

/// Environment-driven parameters for the controller process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    Server,
    TokenFile,
    CaFile,
    Workers,
    LogFormat,
    Listen,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Server => "READYGATE_SERVER",
            Config::TokenFile => "READYGATE_TOKEN_FILE",
            Config::CaFile => "READYGATE_CA_FILE",
            Config::Workers => "READYGATE_WORKERS",
            Config::LogFormat => "READYGATE_LOG_FORMAT",
            Config::Listen => "READYGATE_LISTEN",
        }
    }

    /// In-cluster defaults used when the environment variable is unset.
    pub fn default_value(&self) -> &'static str {
        match self {
            Config::Server => "https://kubernetes.default.svc",
            Config::TokenFile => "/var/run/secrets/kubernetes.io/serviceaccount/token",
            Config::CaFile => "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt",
            Config::Workers => "10",
            Config::LogFormat => "text",
            Config::Listen => "0.0.0.0:8080",
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get(&self) -> String {
        env::var(self.env_var())
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| self.default_value().to_string())
    }
}

/// Tunables for the reconciler core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub condition_type: String,
    pub workers: usize,
    pub default_port: u16,
    pub default_path: String,
    pub default_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            condition_type: GATE_CONDITION_TYPE.to_string(),
            workers: DEFAULT_WORKERS,
            default_port: DEFAULT_TARGET_PORT,
            default_path: DEFAULT_PROBE_PATH.to_string(),
            default_timeout: DEFAULT_PROBE_TIMEOUT,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl ControllerSettings {
    /// Defaults with the worker count taken from `READYGATE_WORKERS`.
    pub fn from_env() -> Result<Self, String> {
        let raw = Config::Workers.get();
        let workers = raw
            .parse::<usize>()
            .map_err(|err| format!("invalid {} '{}': {}", Config::Workers.env_var(), raw, err))?;
        Ok(Self::default().with_workers(workers))
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}
