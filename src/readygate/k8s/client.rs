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

//! HTTP client for the handful of core/v1 pod endpoints the controller uses.

use std::error::Error;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::stream::{self, Stream, StreamExt};
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::readygate::config::Config;
use crate::readygate::controller::informer::{PodSource, WatchStream};
use crate::readygate::controller::probe::ProxyRequest;
use crate::readygate::controller::reconcile::{ApiFuture, PodProxyClient, PodStatusUpdater};
use crate::readygate::k8s::pod::{Pod, PodList};
use crate::readygate::k8s::watch::{ApiStatus, WatchEvent, EVENT_ERROR};
use crate::readygate::util::{with_context, ApiError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_TIMEOUT: Duration = Duration::from_secs(120);
const WATCH_TIMEOUT_SECONDS: u64 = 290;

#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
    token_file: Option<PathBuf>,
}

impl ClusterClient {
    /// Builds a client for `server`, trusting `ca_pem` in addition to the
    /// system roots when provided.
    pub fn new(
        server: &str,
        token: Option<String>,
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let base_url = Url::parse(server).map_err(|err| with_context(err, "invalid API server URL"))?;
        let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(pem) = ca_pem {
            let certificate =
                Certificate::from_pem(pem).map_err(|err| with_context(err, "invalid CA bundle"))?;
            builder = builder.add_root_certificate(certificate);
        }
        let client = builder.build().map_err(|err| {
            io::Error::other(format!("failed to construct API server HTTP client: {err}"))
        })?;

        Ok(ClusterClient {
            client,
            base_url,
            token: token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
            token_file: None,
        })
    }

    /// Builds a client from `READYGATE_SERVER`, `READYGATE_TOKEN_FILE` and
    /// `READYGATE_CA_FILE`. Missing token or CA files are skipped; the token
    /// file is re-read on every request so projected tokens can rotate.
    pub fn from_config() -> Result<Self, Box<dyn Error + Send + Sync>> {
        let server = Config::Server.get();
        let token_path = PathBuf::from(Config::TokenFile.get());
        let ca_path = PathBuf::from(Config::CaFile.get());

        let token = read_optional(&token_path)?.map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        let ca = read_optional(&ca_path)?;

        let mut client = Self::new(&server, token, ca.as_deref())?;
        if client.token.is_some() {
            client.token_file = Some(token_path);
        }
        Ok(client)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn bearer_token(&self) -> Option<String> {
        self.token_file
            .as_ref()
            .and_then(|path| fs::read_to_string(path).ok())
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .or_else(|| self.token.clone())
    }

    fn apply_auth(&self, request: RequestBuilder) -> RequestBuilder {
        match self.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub fn url_from_segments(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        {
            let mut parts = url
                .path_segments_mut()
                .map_err(|_| ApiError::Transport("base URL cannot be base for segments".into()))?;
            parts.clear();
            for segment in segments {
                if !segment.is_empty() {
                    parts.push(segment);
                }
            }
        }
        Ok(url)
    }

    /// `pods/http:<pod>:<port>/proxy/<path>` under the API server root.
    pub fn proxy_url(&self, request: &ProxyRequest) -> Result<Url, ApiError> {
        let (path, query) = request.proxy_path()?;
        let proxy_name = request.proxy_name();
        let mut url = self.url_from_segments(&[
            "api",
            "v1",
            "namespaces",
            request.namespace.as_str(),
            "pods",
            proxy_name.as_str(),
            "proxy",
        ])?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Transport("base URL cannot be base for segments".into()))?
            .extend(path);
        url.set_query(query);
        Ok(url)
    }

    /// Sends `request` through the pod proxy and returns the pod's HTTP status.
    pub async fn proxy_status(&self, request: &ProxyRequest, timeout: Duration) -> Result<u16, ApiError> {
        let url = self.proxy_url(request)?;
        let response = self
            .apply_auth(self.client.get(url).timeout(timeout))
            .send()
            .await
            .map_err(|err| request_error(err, timeout))?;
        Ok(response.status().as_u16())
    }

    /// Replaces the status subresource of `pod`.
    pub async fn replace_pod_status(&self, pod: &Pod) -> Result<(), ApiError> {
        let name = pod.name().unwrap_or_default();
        let namespace = pod.namespace();
        let url = self.url_from_segments(&["api", "v1", "namespaces", namespace, "pods", name, "status"])?;
        let response = self
            .apply_auth(self.client.put(url).timeout(REQUEST_TIMEOUT).json(pod))
            .send()
            .await
            .map_err(|err| request_error(err, REQUEST_TIMEOUT))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ApiError::pod_not_found(namespace, name));
        }
        check_status(response).await.map(|_| ())
    }

    /// Lists pods across all namespaces.
    pub async fn list_pods(&self) -> Result<PodList, ApiError> {
        let url = self.url_from_segments(&["api", "v1", "pods"])?;
        let response = self
            .apply_auth(self.client.get(url).timeout(LIST_TIMEOUT))
            .send()
            .await
            .map_err(|err| request_error(err, LIST_TIMEOUT))?;
        decode_json(check_status(response).await?).await
    }

    /// Opens a cluster-wide pod watch starting after `resource_version`.
    pub async fn watch_pods(&self, resource_version: &str) -> Result<WatchStream, ApiError> {
        let mut url = self.url_from_segments(&["api", "v1", "pods"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("watch", "true");
            query.append_pair("allowWatchBookmarks", "true");
            query.append_pair("timeoutSeconds", &WATCH_TIMEOUT_SECONDS.to_string());
            if !resource_version.is_empty() {
                query.append_pair("resourceVersion", resource_version);
            }
        }
        let response = self
            .apply_auth(self.client.get(url))
            .send()
            .await
            .map_err(ApiError::from)?;
        let response = check_status(response).await?;
        Ok(watch_frames(Box::pin(response.bytes_stream())))
    }
}

impl PodProxyClient for ClusterClient {
    fn proxy_get(&self, request: ProxyRequest, timeout: Duration) -> ApiFuture<u16> {
        let client = self.clone();
        Box::pin(async move { client.proxy_status(&request, timeout).await })
    }
}

impl PodStatusUpdater for ClusterClient {
    fn update_pod_status(&self, pod: Pod) -> ApiFuture<()> {
        let client = self.clone();
        Box::pin(async move { client.replace_pod_status(&pod).await })
    }
}

impl PodSource for ClusterClient {
    fn list_pods(&self) -> ApiFuture<PodList> {
        let client = self.clone();
        Box::pin(async move { ClusterClient::list_pods(&client).await })
    }

    fn watch_pods(&self, resource_version: String) -> ApiFuture<WatchStream> {
        let client = self.clone();
        Box::pin(async move { ClusterClient::watch_pods(&client, &resource_version).await })
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, Box<dyn Error + Send + Sync>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(with_context(err, format!("failed to read {}", path.display()))),
    }
}

fn request_error(err: reqwest::Error, timeout: Duration) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout(timeout)
    } else {
        ApiError::from(err)
    }
}

async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiStatus>(&body)
        .ok()
        .map(|status| status.message)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| body.trim().to_string());
    Err(ApiError::Status {
        code: status.as_u16(),
        message,
    })
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let bytes = response.bytes().await.map_err(ApiError::from)?;
    serde_json::from_slice(&bytes).map_err(|err| ApiError::Decode(err.to_string()))
}

/// Decodes one newline-delimited watch frame. `ERROR` frames become
/// [`ApiError::Status`].
pub fn decode_watch_frame(line: &[u8]) -> Result<WatchEvent<Pod>, ApiError> {
    let event: WatchEvent<Value> =
        serde_json::from_slice(line).map_err(|err| ApiError::Decode(err.to_string()))?;
    if event.event_type.eq_ignore_ascii_case(EVENT_ERROR) {
        let status: ApiStatus = serde_json::from_value(event.object).unwrap_or_default();
        return Err(ApiError::Status {
            code: status.code,
            message: status.message,
        });
    }
    let pod = serde_json::from_value(event.object).map_err(|err| ApiError::Decode(err.to_string()))?;
    Ok(WatchEvent {
        event_type: event.event_type,
        object: pod,
    })
}

struct FrameState<S> {
    body: S,
    buffer: Vec<u8>,
    done: bool,
}

/// Splits a chunked response body into watch frames.
pub fn watch_frames<S, B, E>(body: S) -> WatchStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    let state = FrameState {
        body,
        buffer: Vec::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|byte| *byte == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some((decode_watch_frame(&line), state));
            }
            if state.done {
                if state.buffer.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                let line = std::mem::take(&mut state.buffer);
                return Some((decode_watch_frame(&line), state));
            }
            match state.body.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(err)) => {
                    state.done = true;
                    state.buffer.clear();
                    return Some((Err(err.into()), state));
                }
                None => state.done = true,
            }
        }
    })
    .boxed()
}
