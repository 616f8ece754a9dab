//! In-memory transport for tests.
//!
//! [`MockTransport`] answers from a queue of scripted outcomes and records
//! every request it receives. Enabled with the `test-util` feature.
//!
//! ```ignore
//! let transport = Arc::new(MockTransport::new());
//! transport.append_response(MockResponse::new(StatusCode::SERVICE_UNAVAILABLE));
//! transport.append_response(MockResponse::new(StatusCode::OK).with_body("done"));
//!
//! let pipeline = Pipeline::builder()
//!     .transport(transport.clone())
//!     .retry(RetryOptions::fast())
//!     .build()?;
//! ```

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use parking_lot::Mutex;
use url::Url;

use crate::context::Context;
use crate::error::HttpError;
use crate::request::{BytesBody, Request, SeekableBody};
use crate::response::Response;
use crate::transport::Transport;

type ErrorFactory = Arc<dyn Fn() -> HttpError + Send + Sync>;

/// Scripted response
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    delay: Option<Duration>,
}

impl MockResponse {
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            delay: None,
        }
    }

    /// Add a header. Invalid names or values are ignored.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            self.headers.append(name, value);
        }
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// JSON body with a matching `Content-Type`
    #[must_use]
    pub fn with_json(self, value: &serde_json::Value) -> Self {
        self.with_header("content-type", "application/json")
            .with_body(value.to_string())
    }

    /// Hold the response back for `delay`, still honoring cancellation
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Request as the mock received it
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

enum Outcome {
    Response(MockResponse),
    Error(ErrorFactory),
}

/// Scriptable [`Transport`]
#[derive(Default)]
pub struct MockTransport {
    queue: Mutex<VecDeque<Outcome>>,
    fallback: Mutex<Option<Outcome>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next unanswered request
    pub fn append_response(&self, response: MockResponse) {
        self.queue.lock().push_back(Outcome::Response(response));
    }

    /// Queue a connection failure for the next unanswered request
    pub fn append_error<F>(&self, make: F)
    where
        F: Fn() -> HttpError + Send + Sync + 'static,
    {
        self.queue.lock().push_back(Outcome::Error(Arc::new(make)));
    }

    /// Answer every request with `response` once the queue is empty
    pub fn set_response(&self, response: MockResponse) {
        *self.fallback.lock() = Some(Outcome::Response(response));
    }

    /// Fail every request once the queue is empty
    pub fn set_error<F>(&self, make: F)
    where
        F: Fn() -> HttpError + Send + Sync + 'static,
    {
        *self.fallback.lock() = Some(Outcome::Error(Arc::new(make)));
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    fn next_outcome(&self) -> Option<Outcome> {
        if let Some(outcome) = self.queue.lock().pop_front() {
            return Some(outcome);
        }
        match &*self.fallback.lock() {
            Some(Outcome::Response(r)) => Some(Outcome::Response(r.clone())),
            Some(Outcome::Error(make)) => Some(Outcome::Error(Arc::clone(make))),
            None => None,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, ctx: &Context, request: &mut Request) -> Result<Response, HttpError> {
        let body = request.read_body()?;
        self.requests.lock().push(RecordedRequest {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            body,
        });

        let response = match self.next_outcome() {
            Some(Outcome::Response(response)) => response,
            Some(Outcome::Error(make)) => return Err(make()),
            None => {
                return Err(HttpError::Transport(
                    "mock transport has no response configured".into(),
                ));
            }
        };

        if let Some(delay) = response.delay {
            ctx.sleep(delay).await?;
        }

        let body = Full::new(response.body)
            .map_err(|never| match never {})
            .boxed();
        Ok(Response::streaming(
            response.status,
            response.headers,
            body,
            request.method().clone(),
            request.url().clone(),
        ))
    }
}

/// Counters shared between a test and a [`TrackedBody`]
#[derive(Debug, Default)]
pub struct BodyStats {
    rewinds: AtomicUsize,
    closes: AtomicUsize,
}

impl BodyStats {
    #[must_use]
    pub fn rewinds(&self) -> usize {
        self.rewinds.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// In-memory body that counts rewinds and closes
pub struct TrackedBody {
    inner: BytesBody,
    stats: Arc<BodyStats>,
    fail_rewind: bool,
}

impl TrackedBody {
    pub fn new(data: impl Into<Bytes>) -> (Self, Arc<BodyStats>) {
        let stats = Arc::new(BodyStats::default());
        let body = Self {
            inner: BytesBody::new(data),
            stats: Arc::clone(&stats),
            fail_rewind: false,
        };
        (body, stats)
    }

    /// Make every rewind fail
    #[must_use]
    pub fn failing_rewind(mut self) -> Self {
        self.fail_rewind = true;
        self
    }
}

impl SeekableBody for TrackedBody {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn read_to_end(&mut self) -> io::Result<Bytes> {
        self.inner.read_to_end()
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.stats.rewinds.fetch_add(1, Ordering::SeqCst);
        if self.fail_rewind {
            return Err(io::Error::other("rewind failed"));
        }
        self.inner.rewind()
    }

    fn close(&mut self) -> io::Result<()> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
