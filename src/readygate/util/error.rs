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
use std::fmt;
use std::time::Duration;

/// Failures reported by the cluster API collaborators (lister, status
/// updater, pod proxy).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The addressed object does not exist (HTTP 404 or a cache miss).
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    /// The API server answered with a non-success status.
    #[error("api server returned {code}: {message}")]
    Status { code: u16, message: String },
    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(String),
    /// The request did not complete within its deadline.
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    /// The response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),
    /// A pod-supplied probe path would leave the proxy subresource.
    #[error("invalid probe path {0:?}")]
    InvalidProbePath(String),
}

impl ApiError {
    pub fn pod_not_found(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ApiError::NotFound {
            kind: "pod",
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

#[derive(Debug)]
struct ContextError {
    context: String,
    source: Box<dyn Error + Send + Sync>,
}

impl ContextError {
    fn new(context: impl Into<String>, source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self {
            context: context.into(),
            source: source.into(),
        }
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.source)
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[derive(Debug)]
struct SimpleError(String);

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for SimpleError {}

pub fn with_context<E>(error: E, context: impl Into<String>) -> Box<dyn Error + Send + Sync>
where
    E: Into<Box<dyn Error + Send + Sync>>,
{
    Box::new(ContextError::new(context, error))
}

pub fn new_error(message: impl Into<String>) -> Box<dyn Error + Send + Sync> {
    Box::new(SimpleError(message.into()))
}
