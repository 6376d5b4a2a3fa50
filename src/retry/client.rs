// Copyright 2017 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! retry
//!
//! this is an abstraction over the regular http request. it allows you to
//! have a request retry until it succeeds, with a configurable number of
//! of attempts and a backoff strategy. It also takes care of automatically
//! deserializing JSON responses and handles headers in a sane way.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::{self, blocking, header, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use slog_scope::debug;

use crate::retry::Retry;

/// A non-success HTTP status returned by the remote side.
#[derive(Debug, thiserror::Error)]
#[error("unexpected HTTP status {0}")]
pub struct StatusError(pub StatusCode);

/// Find the HTTP status that caused a request failure, if any.
pub fn failed_status(err: &anyhow::Error) -> Option<StatusCode> {
    err.chain()
        .find_map(|e| e.downcast_ref::<StatusError>())
        .map(|e| e.0)
}

/// Settings applied to the underlying connection pool.
#[derive(Clone, Debug, Default)]
pub struct ClientSettings {
    /// Overall timeout for a single request.
    pub timeout: Option<Duration>,
    /// Idle connections kept alive per remote host.
    pub max_idle_per_host: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Client {
    client: blocking::Client,
    headers: header::HeaderMap,
    retry: Retry,
    return_on_404: bool,
}

impl Client {
    #[cfg(test)]
    pub fn try_new() -> Result<Self> {
        Self::try_with_settings(&ClientSettings::default())
    }

    pub fn try_with_settings(settings: &ClientSettings) -> Result<Self> {
        let mut builder = blocking::Client::builder();
        if let Some(timeout) = settings.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(max_idle) = settings.max_idle_per_host {
            builder = builder.pool_max_idle_per_host(max_idle);
        }
        let client = builder.build().context("failed to initialize client")?;
        Ok(Client {
            client,
            headers: header::HeaderMap::new(),
            retry: Retry::new(),
            return_on_404: false,
        })
    }

    pub fn header(mut self, k: header::HeaderName, v: header::HeaderValue) -> Self {
        self.headers.append(k, v);
        self
    }

    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.retry = self.retry.initial_backoff(initial_backoff);
        self
    }

    /// Maximum number of retries to attempt.
    ///
    /// If zero, only the initial request will be performed, with no
    /// additional retries.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.retry = self.retry.max_retries(retries);
        self
    }

    pub fn return_on_404(mut self, return_on_404: bool) -> Self {
        self.return_on_404 = return_on_404;
        self
    }

    pub fn get(&self, url: String) -> RequestBuilder {
        self.request(Method::GET, url, None)
    }

    pub fn post_json<B>(&self, url: String, body: &B) -> Result<RequestBuilder>
    where
        B: Serialize,
    {
        let body = serde_json::to_string(body).context("failed to serialize request body")?;
        Ok(self.request(Method::POST, url, Some(body)))
    }

    fn request(&self, method: Method, url: String, body: Option<String>) -> RequestBuilder {
        RequestBuilder {
            method,
            url,
            body,
            client: self.client.clone(),
            headers: self.headers.clone(),
            retry: self.retry.clone(),
            return_on_404: self.return_on_404,
            timeout: None,
        }
    }
}

pub struct RequestBuilder {
    method: Method,
    url: String,
    body: Option<String>,
    client: blocking::Client,
    headers: header::HeaderMap,
    retry: Retry,
    return_on_404: bool,
    /// Overrides the client-wide timeout for each attempt.
    timeout: Option<Duration>,
}

impl RequestBuilder {
    pub fn header(mut self, k: header::HeaderName, v: header::HeaderValue) -> Self {
        self.headers.insert(k, v);
        self
    }

    /// Limit each attempt of this request to the given duration.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Maximum number of retries for this request only.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.retry = self.retry.max_retries(retries);
        self
    }

    /// Send the request with retries and deserialize a JSON response body.
    pub fn send<T>(self) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let url = self.parse_url()?;

        self.retry.clone().retry(|attempt| {
            debug!("Fetching {}: Attempt #{}", url, attempt + 1);
            self.dispatch_request(url.clone())
        })
    }

    /// Send the request with retries and return the raw successful response.
    pub fn dispatch(self) -> Result<blocking::Response> {
        let url = self.parse_url()?;

        self.retry.clone().retry(|attempt| {
            debug!("Sending {} {}: Attempt #{}", self.method, url, attempt + 1);
            let response = self
                .client
                .execute(self.build(url.clone())?)
                .with_context(|| format!("failed to {} request", self.method))?;
            let status = response.status();
            if status.is_success() {
                Ok(response)
            } else {
                Err(anyhow!(StatusError(status)).context(format!("{} failed", self.method)))
            }
        })
    }

    /// Send the request exactly once, without retries, and report the status.
    pub fn probe(self) -> Result<StatusCode> {
        let url = self.parse_url()?;
        let response = self
            .client
            .execute(self.build(url)?)
            .context("failed to probe")?;
        Ok(response.status())
    }

    fn dispatch_request<T>(&self, url: reqwest::Url) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.client.execute(self.build(url)?) {
            Ok(resp) => match (resp.status(), self.return_on_404) {
                (s, _) if s.is_success() => {
                    debug!("Fetch successful");
                    resp.json::<T>()
                        .map(Some)
                        .context("failed json deserialization")
                }
                (StatusCode::NOT_FOUND, true) => {
                    debug!("Fetch failed with 404: resource not found");
                    Ok(None)
                }
                (s, _) => {
                    debug!("Failed to fetch: {}", s);
                    Err(anyhow!(StatusError(s)).context("failed to fetch"))
                }
            },
            Err(e) => {
                debug!("Failed to fetch: {}", e);
                Err(anyhow!(e).context("failed to fetch"))
            }
        }
    }

    /// Reqwest's blocking Request isn't `Clone`, so build a fresh one per attempt.
    fn build(&self, url: reqwest::Url) -> Result<blocking::Request> {
        let mut builder = self
            .client
            .request(self.method.clone(), url)
            .headers(self.headers.clone());
        if let Some(ref content) = self.body {
            builder = builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(content.clone());
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        builder
            .build()
            .with_context(|| format!("failed to build {} request", self.method))
    }

    fn parse_url(&self) -> Result<reqwest::Url> {
        reqwest::Url::parse(self.url.as_str())
            .with_context(|| format!("failed to parse uri '{}'", self.url))
    }
}
