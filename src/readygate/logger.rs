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

use crate::readygate::observability::tracing;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
#[cfg(not(test))]
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

const SERVICE_NAME: &str = "readygate";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text = 0,
    Json = 1,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

fn encode_field_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\\' | '='));

    if !needs_quotes {
        return value.to_string();
    }

    let mut encoded = String::with_capacity(value.len() + 2);
    encoded.push('"');
    for ch in value.chars() {
        match ch {
            '"' => encoded.push_str("\\\""),
            '\\' => encoded.push_str("\\\\"),
            '\n' => encoded.push_str("\\n"),
            '\r' => encoded.push_str("\\r"),
            '\t' => encoded.push_str("\\t"),
            _ => encoded.push(ch),
        }
    }
    encoded.push('"');
    encoded
}

fn log_event(level: LogLevel, component: &str, message: &str, metadata: &[(&str, &str)]) {
    let mut fields: Vec<(&str, String)> = vec![
        ("ts", Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        ("level", level.as_str().to_string()),
        ("service", SERVICE_NAME.to_string()),
        ("component", component.to_string()),
        ("msg", message.to_string()),
    ];
    if let Some(ctx) = tracing::current_context() {
        fields.push(("trace_id", ctx.trace_id().to_string()));
        fields.push(("span_id", ctx.span_id().to_string()));
    }
    fields.extend(
        metadata
            .iter()
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (*key, (*value).to_string())),
    );

    let line = match current_log_format() {
        LogFormat::Text => fields
            .iter()
            .map(|(key, value)| format!("{key}={}", encode_field_value(value)))
            .collect::<Vec<_>>()
            .join(" "),
        LogFormat::Json => Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key.to_string(), Value::String(value)))
                .collect(),
        )
        .to_string(),
    };

    write_line(level, &line);
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, metadata);
}

/// Warnings and errors go to stderr, everything else to stdout.
#[cfg(not(test))]
fn write_line(level: LogLevel, line: &str) {
    let _ = match level {
        LogLevel::Warn | LogLevel::Error => writeln!(io::stderr().lock(), "{line}"),
        LogLevel::Debug | LogLevel::Info => writeln!(io::stdout().lock(), "{line}"),
    };
}

#[cfg(test)]
fn write_line(level: LogLevel, line: &str) {
    let mut guard = test_log_store()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.push((level, line.to_string()));
}

#[cfg(test)]
fn test_log_store() -> &'static Mutex<Vec<(LogLevel, String)>> {
    static STORE: OnceLock<Mutex<Vec<(LogLevel, String)>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Captured lines containing `needle`. Tests run in parallel and share the
/// store, so callers filter on something unique to their own test.
#[cfg(test)]
pub(crate) fn captured_logs(needle: &str) -> Vec<(LogLevel, String)> {
    let guard = test_log_store()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    guard
        .iter()
        .filter(|(_, line)| line.contains(needle))
        .cloned()
        .collect()
}
