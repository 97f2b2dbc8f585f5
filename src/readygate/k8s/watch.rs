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

use serde::{Deserialize, Serialize};

pub const EVENT_ADDED: &str = "ADDED";
pub const EVENT_MODIFIED: &str = "MODIFIED";
pub const EVENT_DELETED: &str = "DELETED";
pub const EVENT_BOOKMARK: &str = "BOOKMARK";
pub const EVENT_ERROR: &str = "ERROR";

/// One frame of a Kubernetes watch stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: String,
    pub object: T,
}

impl<T> WatchEvent<T> {
    pub fn new(event_type: &str, object: T) -> Self {
        Self {
            event_type: event_type.to_string(),
            object,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.event_type.eq_ignore_ascii_case(EVENT_DELETED)
    }
}

/// `meta.v1.Status` carried by `ERROR` watch frames and failed requests.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiStatus {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
}
