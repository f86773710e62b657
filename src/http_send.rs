// Copyright 2020 The Matrix.org Foundation C.I.C.
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

//! Abstraction around the HTTP layer, allowing implementors to use
//! different HTTP libraries.

use std::fmt::Debug;

use async_trait::async_trait;
use http::Method as HttpMethod;
use reqwest::{
    header::{HeaderMap, HeaderValue, USER_AGENT},
    ClientBuilder,
};
use thiserror::Error;

use crate::config::ClientConfig;

/// How urgently the transport should treat a request.
///
/// Background requests (the sync long-poll, thumbnails) yield network
/// priority to any in-flight foreground request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestPriority {
    /// A request the user is waiting on.
    Foreground,
    /// A request that can yield to foreground traffic.
    Background,
}

/// A failure below the HTTP status-code level.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// The request could not be sent or the response not received.
    #[error("network error: {0}")]
    Network(String),
    /// The request timed out.
    #[error("request timed out")]
    Timeout,
}

/// Abstraction around the HTTP transport.
#[async_trait]
pub trait HttpSend: Send + Sync + Debug {
    /// Send a fully built request and return the raw response.
    ///
    /// This is called by a job every time it wants to send anything to a
    /// homeserver; retries and status interpretation happen in the job, not
    /// here. The priority is a hint; transports are free to ignore it.
    async fn send_request(
        &self,
        request: http::Request<Vec<u8>>,
        priority: RequestPriority,
    ) -> Result<http::Response<Vec<u8>>, TransportError>;
}

/// Default transport, backed by reqwest.
#[derive(Clone, Debug)]
pub struct DefaultTransport {
    inner: reqwest::Client,
}

impl Default for DefaultTransport {
    fn default() -> Self {
        Self::with_config(&ClientConfig::default()).unwrap()
    }
}

impl DefaultTransport {
    /// Build a transport with the specified configuration.
    pub fn with_config(config: &ClientConfig) -> crate::Result<Self> {
        let user_agent = config.user_agent.clone().unwrap_or_else(|| {
            HeaderValue::from_static(concat!("quadrant ", env!("CARGO_PKG_VERSION")))
        });
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, user_agent);

        // The optional knobs of the config, applied in one pass.
        type Tweak = Box<dyn FnOnce(ClientBuilder) -> ClientBuilder>;
        let tweaks = vec![
            config
                .timeout
                .map(|timeout| -> Tweak { Box::new(move |b: ClientBuilder| b.timeout(timeout)) }),
            config
                .proxy
                .clone()
                .map(|proxy| -> Tweak { Box::new(move |b: ClientBuilder| b.proxy(proxy)) }),
            config.disable_ssl_verification.then(|| -> Tweak {
                Box::new(|b: ClientBuilder| b.danger_accept_invalid_certs(true))
            }),
        ];

        let builder = tweaks.into_iter().flatten().fold(
            reqwest::Client::builder().default_headers(headers),
            |builder, tweak| tweak(builder),
        );

        Ok(Self {
            inner: builder.build()?,
        })
    }
}

#[async_trait]
impl HttpSend for DefaultTransport {
    async fn send_request(
        &self,
        request: http::Request<Vec<u8>>,
        _priority: RequestPriority,
    ) -> Result<http::Response<Vec<u8>>, TransportError> {
        let (parts, body) = request.into_parts();
        let url = parts.uri.to_string();

        let mut builder = match parts.method {
            HttpMethod::GET => self.inner.get(&url),
            HttpMethod::POST => self.inner.post(&url),
            HttpMethod::PUT => self.inner.put(&url),
            HttpMethod::DELETE => self.inner.delete(&url),
            method => {
                return Err(TransportError::Network(format!(
                    "unsupported method {}",
                    method
                )))
            }
        };

        for (name, value) in &parts.headers {
            builder = builder.header(name, value);
        }

        let response = builder.body(body).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(e.to_string())
            }
        })?;

        eprintln!("DEBUG status={} headers={:?}", response.status(), response.headers());
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let mut http_response = http::Response::builder()
            .status(status)
            .body(bytes.to_vec())
            .map_err(|e| TransportError::Network(e.to_string()))?;
        *http_response.headers_mut() = headers;

        Ok(http_response)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mockito::mock;
    use url::Url;

    use super::*;
    use crate::job::{requests::GetVersions, Job, SendContext};

    #[tokio::test]
    async fn default_transport_round_trips_against_a_server() {
        let _m = mock("GET", "/_matrix/client/versions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"versions": ["r0.6.0"]}"#)
            .create();

        let ctx = SendContext {
            homeserver: Url::parse(&mockito::server_url()).unwrap(),
            access_token: None,
            transport: Arc::new(DefaultTransport::default()),
        };

        let job = Job::new(GetVersions);
        job.start(ctx, RequestPriority::Foreground);
        let response = job.await_response().await.unwrap();

        assert_eq!(response.versions, vec!["r0.6.0"]);
    }
}
