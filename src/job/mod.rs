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

//! The job subsystem.
//!
//! A [`Job`] models one HTTP request/response cycle with typed input and
//! typed parsed output. Jobs are the only abstraction that touches the
//! network: every higher-level API is expressed in terms of starting and
//! observing a job. Network and timeout failures retry with exponential
//! backoff; all other failures are terminal.

pub mod requests;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use http::{header::AUTHORIZATION, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::{
    sync::{watch, Notify},
    time::sleep,
};
use tracing::{trace, warn};
use url::Url;

use crate::{
    http_send::{HttpSend, RequestPriority, TransportError},
    signals::{Signal, SignalHub},
};

/// Base path of the stable client-server API.
pub const BASE_PATH: &str = "/_matrix/client/r0";
/// Base path for draft endpoints.
pub const UNSTABLE_PATH: &str = "/_matrix/client/unstable";
/// Base path of the media repository API.
pub const MEDIA_BASE_PATH: &str = "/_matrix/media/r0";

pub(crate) const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(5);
pub(crate) const RETRY_MAX_DELAY: Duration = Duration::from_secs(5 * 60);
pub(crate) const MAX_RETRIES: u32 = 7;

/// What went wrong with a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request could not reach the server.
    Network,
    /// The request or its response timed out.
    Timeout,
    /// A response body could not be parsed as JSON.
    JsonParse,
    /// The server denied access to the requested content (HTTP 403).
    ContentAccess,
    /// The requested resource does not exist (HTTP 404).
    NotFound,
    /// The server rejected the request (other HTTP 4xx).
    IncorrectRequest,
    /// The response did not have the promised shape.
    IncorrectResponse,
    /// The uploaded content exceeds the server's size limit (HTTP 413).
    TooLargeForUpload,
    /// A failure outside the well-known categories, e.g. HTTP 5xx.
    UserDefined,
    /// The job was abandoned before it completed.
    Abandoned,
}

/// A terminal job failure.
#[derive(Clone, Debug, PartialEq, Error)]
#[error("{message}")]
pub struct JobError {
    /// The category of the failure.
    pub kind: ErrorKind,
    /// A human-readable message.
    pub message: String,
    /// Raw error details, e.g. the server's error body, if any.
    pub details: String,
}

impl JobError {
    /// Create an error with empty details.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: String::new(),
        }
    }

    pub(crate) fn with_details(
        kind: ErrorKind,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            details: details.into(),
        }
    }

    pub(crate) fn incorrect_response(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::IncorrectResponse, message)
    }

    fn abandoned() -> Self {
        Self::new(ErrorKind::Abandoned, "the job was abandoned")
    }
}

/// The lifecycle status of a job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobStatus {
    /// The job was constructed but not started.
    Pending,
    /// The job is on the wire (or waiting out a retry backoff).
    InProgress,
    /// The job completed and its response parsed.
    Success,
    /// The job failed terminally.
    Failure(JobError),
}

impl JobStatus {
    /// Whether the job has reached a final status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure(_))
    }

    /// Whether the job succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Success)
    }
}

/// Observable events of a job.
#[derive(Clone, Debug)]
pub enum JobSignal {
    /// The job hit a network problem and will retry on its own.
    NetworkError {
        /// How many retries have already been taken.
        retries_taken: u32,
        /// When the job will retry again.
        next_retry_in_ms: u64,
    },
    /// The job completed and its response parsed.
    Success,
    /// The job failed terminally; no retry will follow.
    Failure(JobError),
    /// The job reached any terminal status. Fires exactly once, after
    /// `Success`/`Failure`, unless the job was abandoned.
    Result(JobStatus),
}

/// Payload-free discriminants of [`JobSignal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobSignalKind {
    /// See [`JobSignal::NetworkError`].
    NetworkError,
    /// See [`JobSignal::Success`].
    Success,
    /// See [`JobSignal::Failure`].
    Failure,
    /// See [`JobSignal::Result`].
    Result,
}

impl Signal for JobSignal {
    type Kind = JobSignalKind;

    fn kind(&self) -> JobSignalKind {
        match self {
            JobSignal::NetworkError { .. } => JobSignalKind::NetworkError,
            JobSignal::Success => JobSignalKind::Success,
            JobSignal::Failure(_) => JobSignalKind::Failure,
            JobSignal::Result(_) => JobSignalKind::Result,
        }
    }
}

/// The request body of a job.
#[derive(Clone, Debug)]
pub enum Body {
    /// No body.
    Empty,
    /// A JSON body, sent with `Content-Type: application/json`.
    Json(JsonValue),
    /// Raw bytes with an explicit content type, e.g. a media upload.
    Raw {
        /// The value for the `Content-Type` header.
        content_type: String,
        /// The payload.
        data: Vec<u8>,
    },
}

/// A typed description of one endpoint call.
///
/// Implementations live in [`requests`]; the job machinery is the same for
/// all of them.
pub trait Request: Send + Sync + 'static {
    /// The parsed response type.
    type Response: Send + 'static;

    /// The HTTP verb.
    fn method(&self) -> Method;

    /// The endpoint path, starting with `/`.
    fn path(&self) -> String;

    /// The query parameters.
    fn query(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// The request body.
    fn body(&self) -> Body {
        Body::Empty
    }

    /// Whether the endpoint requires the access token.
    fn needs_token(&self) -> bool {
        true
    }

    /// Parse a 2xx response. A parse failure makes the job fail with
    /// [`ErrorKind::IncorrectResponse`].
    fn parse_response(&self, response: http::Response<Vec<u8>>)
        -> Result<Self::Response, JobError>;
}

/// Parse a JSON response body into the given type.
pub(crate) fn json_response<T: DeserializeOwned>(
    response: &http::Response<Vec<u8>>,
) -> Result<T, JobError> {
    if response.body().is_empty() {
        return Err(JobError::incorrect_response("response body is empty"));
    }
    serde_json::from_slice(response.body())
        .map_err(|e| JobError::incorrect_response(format!("malformed response body: {}", e)))
}

/// Accept an empty or `{}`-shaped response body.
pub(crate) fn expect_empty(response: &http::Response<Vec<u8>>) -> Result<(), JobError> {
    if response.body().is_empty() {
        return Ok(());
    }
    serde_json::from_slice::<JsonValue>(response.body())
        .map(|_| ())
        .map_err(|e| JobError::incorrect_response(format!("malformed response body: {}", e)))
}

/// Everything a job needs to put a request on the wire.
#[derive(Clone)]
pub struct SendContext {
    /// The homeserver base URL.
    pub homeserver: Url,
    /// The access token, if the connection is logged in.
    pub access_token: Option<String>,
    /// The transport that executes requests.
    pub transport: Arc<dyn HttpSend>,
}

impl fmt::Debug for SendContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendContext")
            .field("homeserver", &self.homeserver)
            .finish()
    }
}

pub(crate) struct JobShared {
    status_tx: watch::Sender<JobStatus>,
    signals: SignalHub<JobSignal>,
    abandoned: AtomicBool,
    abandon_notify: Notify,
    started: AtomicBool,
}

impl JobShared {
    fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    pub(crate) fn abandon(&self) {
        if self.status_tx.borrow().is_terminal() {
            return;
        }
        self.abandoned.store(true, Ordering::SeqCst);
        let _ = self
            .status_tx
            .send(JobStatus::Failure(JobError::abandoned()));
        self.abandon_notify.notify_waiters();
    }

    fn finish(&self, result: Result<(), JobError>) {
        if self.is_abandoned() {
            return;
        }

        let status = match result {
            Ok(()) => JobStatus::Success,
            Err(e) => JobStatus::Failure(e),
        };
        let _ = self.status_tx.send(status.clone());

        match &status {
            JobStatus::Success => self.signals.emit(&JobSignal::Success),
            JobStatus::Failure(e) => self.signals.emit(&JobSignal::Failure(e.clone())),
            _ => unreachable!("finish is only called with terminal statuses"),
        }
        self.signals.emit(&JobSignal::Result(status));
    }
}

/// One typed HTTP request/response cycle.
pub struct Job<R: Request> {
    request: Arc<R>,
    shared: Arc<JobShared>,
    response: Arc<Mutex<Option<R::Response>>>,
    status_rx: watch::Receiver<JobStatus>,
}

impl<R: Request> Clone for Job<R> {
    fn clone(&self) -> Self {
        Self {
            request: self.request.clone(),
            shared: self.shared.clone(),
            response: self.response.clone(),
            status_rx: self.status_rx.clone(),
        }
    }
}

impl<R: Request> fmt::Debug for Job<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("status", &self.status()).finish()
    }
}

impl<R: Request> Job<R> {
    /// Construct a job for a request. The request goes on the wire once
    /// [`start`](Self::start) is called.
    pub fn new(request: R) -> Self {
        let (status_tx, status_rx) = watch::channel(JobStatus::Pending);
        Self {
            request: Arc::new(request),
            shared: Arc::new(JobShared {
                status_tx,
                signals: SignalHub::new(),
                abandoned: AtomicBool::new(false),
                abandon_notify: Notify::new(),
                started: AtomicBool::new(false),
            }),
            response: Arc::new(Mutex::new(None)),
            status_rx,
        }
    }

    /// The request this job was built from.
    pub fn request(&self) -> &R {
        &self.request
    }

    /// The current status.
    pub fn status(&self) -> JobStatus {
        self.status_rx.borrow().clone()
    }

    /// The hub for this job's observable events.
    pub fn signals(&self) -> &SignalHub<JobSignal> {
        &self.shared.signals
    }

    pub(crate) fn shared_handle(&self) -> Arc<JobShared> {
        self.shared.clone()
    }

    /// Cancel the job if it has not completed; a completed job is
    /// unaffected. After abandoning, no further signals fire and the status
    /// reports [`ErrorKind::Abandoned`].
    pub fn abandon(&self) {
        self.shared.abandon();
    }

    /// Fail the job without putting anything on the wire, e.g. when the
    /// prerequisites for building the request are missing.
    pub(crate) fn fail_now(&self, error: JobError) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.finish(Err(error));
    }

    /// Enqueue the request through the given transport.
    ///
    /// Starting a job twice is a no-op.
    pub fn start(&self, ctx: SendContext, priority: RequestPriority) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            warn!("job started twice, ignoring");
            return;
        }

        let request = self.request.clone();
        let shared = self.shared.clone();
        let response_slot = self.response.clone();

        tokio::spawn(async move {
            if shared.is_abandoned() {
                return;
            }
            let _ = shared.status_tx.send(JobStatus::InProgress);

            let mut retries_taken: u32 = 0;
            let mut next_delay = RETRY_INITIAL_DELAY;

            loop {
                if shared.is_abandoned() {
                    return;
                }

                let http_request = match build_request(&*request, &ctx) {
                    Ok(r) => r,
                    Err(e) => return shared.finish(Err(e)),
                };
                trace!(
                    "sending {} {}",
                    http_request.method(),
                    http_request.uri().path()
                );

                let outcome = tokio::select! {
                    _ = shared.abandon_notify.notified() => return,
                    outcome = ctx.transport.send_request(http_request, priority) => outcome,
                };

                let retryable = match outcome {
                    Ok(response) if response.status().is_success() => {
                        let result = request.parse_response(response).map(|parsed| {
                            *response_slot.lock().unwrap() = Some(parsed);
                        });
                        return shared.finish(result);
                    }
                    Ok(response) => match response.status() {
                        StatusCode::BAD_GATEWAY
                        | StatusCode::SERVICE_UNAVAILABLE
                        | StatusCode::GATEWAY_TIMEOUT => JobError::new(
                            ErrorKind::Network,
                            format!("server unavailable ({})", response.status()),
                        ),
                        _ => return shared.finish(Err(error_from_response(&response))),
                    },
                    Err(TransportError::Timeout) => {
                        JobError::new(ErrorKind::Timeout, "request timed out")
                    }
                    Err(TransportError::Network(message)) => {
                        JobError::new(ErrorKind::Network, message)
                    }
                };

                if retries_taken >= MAX_RETRIES {
                    return shared.finish(Err(retryable));
                }
                retries_taken += 1;
                warn!(
                    "job hit a network error ({}), retry {} in {:?}",
                    retryable.message, retries_taken, next_delay
                );
                shared.signals.emit(&JobSignal::NetworkError {
                    retries_taken,
                    next_retry_in_ms: next_delay.as_millis() as u64,
                });

                tokio::select! {
                    _ = shared.abandon_notify.notified() => return,
                    _ = sleep(next_delay) => {}
                }
                next_delay = std::cmp::min(next_delay * 2, RETRY_MAX_DELAY);
            }
        });
    }

    /// Wait until the job reaches a terminal status and return it.
    pub async fn await_result(&self) -> JobStatus {
        let mut rx = self.status_rx.clone();
        loop {
            let status = rx.borrow_and_update().clone();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    /// Wait for the terminal status and take the parsed response out of
    /// the job.
    pub async fn await_response(&self) -> Result<R::Response, JobError> {
        match self.await_result().await {
            JobStatus::Success => self
                .response
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| JobError::incorrect_response("response already taken")),
            JobStatus::Failure(e) => Err(e),
            _ => unreachable!("await_result only returns terminal statuses"),
        }
    }
}

fn error_from_response(response: &http::Response<Vec<u8>>) -> JobError {
    let kind = match response.status() {
        StatusCode::FORBIDDEN => ErrorKind::ContentAccess,
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::PAYLOAD_TOO_LARGE => ErrorKind::TooLargeForUpload,
        s if s.is_client_error() => ErrorKind::IncorrectRequest,
        _ => ErrorKind::UserDefined,
    };

    let details = String::from_utf8_lossy(response.body()).into_owned();
    let message = serde_json::from_slice::<JsonValue>(response.body())
        .ok()
        .and_then(|v| v.get("error").and_then(JsonValue::as_str).map(ToOwned::to_owned))
        .unwrap_or_else(|| format!("the server returned {}", response.status()));

    JobError::with_details(kind, message, details)
}

fn build_request<R: Request>(
    request: &R,
    ctx: &SendContext,
) -> Result<http::Request<Vec<u8>>, JobError> {
    let mut url = ctx
        .homeserver
        .join(&request.path())
        .map_err(|e| JobError::new(ErrorKind::IncorrectRequest, format!("bad url: {}", e)))?;
    eprintln!("DEBUG url={}", url);

    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in request.query() {
            pairs.append_pair(&key, &value);
        }
    }

    let mut builder = http::Request::builder()
        .method(request.method())
        .uri(url.as_str());

    if request.needs_token() {
        match &ctx.access_token {
            Some(token) => {
                builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
            }
            None => {
                return Err(JobError::new(
                    ErrorKind::ContentAccess,
                    "the endpoint requires authentication but no access token is set",
                ))
            }
        }
    }

    let (builder, body) = match request.body() {
        Body::Empty => (builder, Vec::new()),
        Body::Json(value) => (
            builder.header(http::header::CONTENT_TYPE, "application/json"),
            serde_json::to_vec(&value).map_err(|e| {
                JobError::new(ErrorKind::JsonParse, format!("unserializable body: {}", e))
            })?,
        ),
        Body::Raw { content_type, data } => (
            builder.header(http::header::CONTENT_TYPE, content_type),
            data,
        ),
    };

    builder
        .body(body)
        .map_err(|e| JobError::new(ErrorKind::IncorrectRequest, format!("bad request: {}", e)))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::json;

    use super::{requests::PasswordLogin, *};
    use crate::http_send::{HttpSend, RequestPriority, TransportError};

    /// A transport that replays a scripted list of outcomes.
    #[derive(Debug)]
    struct ScriptedTransport {
        script: Mutex<Vec<Result<(u16, JsonValue), TransportError>>>,
    }

    impl ScriptedTransport {
        fn new(mut script: Vec<Result<(u16, JsonValue), TransportError>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
            })
        }
    }

    #[async_trait]
    impl HttpSend for ScriptedTransport {
        async fn send_request(
            &self,
            _request: http::Request<Vec<u8>>,
            _priority: RequestPriority,
        ) -> Result<http::Response<Vec<u8>>, TransportError> {
            let outcome = self
                .script
                .lock()
                .unwrap()
                .pop()
                .expect("transport called more often than scripted");
            outcome.map(|(status, body)| {
                http::Response::builder()
                    .status(status)
                    .body(serde_json::to_vec(&body).unwrap())
                    .unwrap()
            })
        }
    }

    fn login_request() -> PasswordLogin {
        PasswordLogin {
            user: "example".to_owned(),
            password: "wordpass".to_owned(),
            device_name: "quadrant".to_owned(),
            device_id: None,
        }
    }

    fn context(transport: Arc<dyn HttpSend>) -> SendContext {
        SendContext {
            homeserver: Url::parse("https://example.com").unwrap(),
            access_token: None,
            transport,
        }
    }

    fn login_body() -> JsonValue {
        json!({
            "user_id": "@example:localhost",
            "access_token": "abc123",
            "device_id": "GHTYAJCE"
        })
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_retry_then_succeed() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Network("connection refused".to_owned())),
            Err(TransportError::Network("connection refused".to_owned())),
            Ok((200, login_body())),
        ]);

        let job = Job::new(login_request());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen2 = seen.clone();
        job.signals().subscribe_all(move |signal| {
            seen2.lock().unwrap().push(match signal {
                JobSignal::NetworkError { retries_taken, .. } => {
                    format!("network:{}", retries_taken)
                }
                JobSignal::Success => "success".to_owned(),
                JobSignal::Failure(_) => "failure".to_owned(),
                JobSignal::Result(_) => "result".to_owned(),
            });
        });

        job.start(context(transport), RequestPriority::Foreground);
        let response = job.await_response().await.unwrap();

        assert_eq!(response.access_token, "abc123");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["network:1", "network:2", "success", "result"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_give_up_after_the_cap() {
        let transport = ScriptedTransport::new(
            std::iter::repeat_with(|| Err(TransportError::Timeout))
                .take(1 + MAX_RETRIES as usize)
                .collect(),
        );

        let job = Job::new(login_request());
        job.start(context(transport), RequestPriority::Foreground);

        match job.await_result().await {
            JobStatus::Failure(e) => assert_eq!(e.kind, ErrorKind::Timeout),
            status => panic!("unexpected status {:?}", status),
        }
    }

    #[tokio::test]
    async fn http_errors_do_not_retry() {
        let transport = ScriptedTransport::new(vec![Ok((
            403,
            json!({ "errcode": "M_FORBIDDEN", "error": "Invalid password" }),
        ))]);

        let job = Job::new(login_request());
        job.start(context(transport), RequestPriority::Foreground);

        match job.await_result().await {
            JobStatus::Failure(e) => {
                assert_eq!(e.kind, ErrorKind::ContentAccess);
                assert_eq!(e.message, "Invalid password");
            }
            status => panic!("unexpected status {:?}", status),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_suppresses_all_signals() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Network("down".to_owned())),
            Ok((200, login_body())),
        ]);

        let job = Job::new(login_request());
        let fired = Arc::new(Mutex::new(0));

        let fired2 = fired.clone();
        job.signals().subscribe(JobSignalKind::Result, move |_| {
            *fired2.lock().unwrap() += 1;
        });

        job.start(context(transport), RequestPriority::Background);
        // Let the first attempt fail and the backoff start.
        tokio::task::yield_now().await;
        job.abandon();

        match job.status() {
            JobStatus::Failure(e) => assert_eq!(e.kind, ErrorKind::Abandoned),
            status => panic!("unexpected status {:?}", status),
        }

        sleep(RETRY_MAX_DELAY).await;
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_token_fails_authenticated_requests() {
        let transport = ScriptedTransport::new(vec![]);
        let job = Job::new(requests::Logout);
        job.start(context(transport), RequestPriority::Foreground);

        match job.await_result().await {
            JobStatus::Failure(e) => assert_eq!(e.kind, ErrorKind::ContentAccess),
            status => panic!("unexpected status {:?}", status),
        }
    }

    #[test]
    fn bearer_token_is_attached() {
        let request = requests::Logout;
        let ctx = SendContext {
            homeserver: Url::parse("https://example.com").unwrap(),
            access_token: Some("tok".to_owned()),
            transport: ScriptedTransport::new(vec![]),
        };

        let http_request = build_request(&request, &ctx).unwrap();
        assert_eq!(
            http_request.headers().get(AUTHORIZATION).unwrap(),
            "Bearer tok"
        );
        assert_eq!(
            http_request.uri().path(),
            format!("{}/logout", BASE_PATH)
        );
    }

    #[test]
    fn abandoned_job_reports_abandoned_to_late_observers() {
        let job = Job::new(login_request());
        job.abandon();

        match job.status() {
            JobStatus::Failure(e) => assert_eq!(e.kind, ErrorKind::Abandoned),
            status => panic!("unexpected status {:?}", status),
        }
    }
}
