use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RetryOptions;
use crate::error::HttpError;
use crate::response::Response;
use crate::unmarshal::Unmarshaler;

/// Slot the retry policy fills with a copy of the final response.
///
/// Useful when a convenience method swallows the response, e.g. to read
/// headers of a call that returned a deserialized model.
#[derive(Clone, Default)]
pub struct ResponseCapture(Arc<Mutex<Option<Response>>>);

impl ResponseCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the captured response, leaving the slot empty
    #[must_use]
    pub fn take(&self) -> Option<Response> {
        self.0.lock().take()
    }

    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.0.lock().as_ref().map(Response::status)
    }

    pub(crate) fn store(&self, response: Response) {
        *self.0.lock() = Some(response);
    }
}

/// Per-call options carried through every policy.
///
/// Cheap to clone. Cancellation and the deadline are observed by the retry
/// policy, by body downloads and by the transport.
#[derive(Clone, Default)]
pub struct Context {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    retry: Option<RetryOptions>,
    capture: Option<ResponseCapture>,
    unmarshaler: Option<Arc<dyn Unmarshaler>>,
    skip_body_download: bool,
    headers: HeaderMap,
    query: Vec<(String, String)>,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the call when `token` fires
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Give up once `timeout` has elapsed, keeping an earlier deadline if one is set
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    /// Override the pipeline's retry options for this call
    #[must_use]
    pub fn with_retry_options(mut self, options: RetryOptions) -> Self {
        self.retry = Some(options);
        self
    }

    #[must_use]
    pub fn with_capture_response(mut self, capture: ResponseCapture) -> Self {
        self.capture = Some(capture);
        self
    }

    #[must_use]
    pub fn with_unmarshaler(mut self, unmarshaler: Arc<dyn Unmarshaler>) -> Self {
        self.unmarshaler = Some(unmarshaler);
        self
    }

    /// Leave the response body streaming; the caller reads it
    #[must_use]
    pub fn with_skip_body_download(mut self) -> Self {
        self.skip_body_download = true;
        self
    }

    /// Add a header every request of this call carries, replacing existing values
    ///
    /// # Errors
    /// Returns an error if the name or value is not valid HTTP.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, HttpError> {
        self.headers
            .insert(HeaderName::try_from(name)?, HeaderValue::try_from(value)?);
        Ok(self)
    }

    /// Set a query parameter on every request of this call, replacing existing values
    #[must_use]
    pub fn with_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[must_use]
    pub fn retry_options(&self) -> Option<&RetryOptions> {
        self.retry.as_ref()
    }

    #[must_use]
    pub fn response_capture(&self) -> Option<&ResponseCapture> {
        self.capture.as_ref()
    }

    #[must_use]
    pub fn unmarshaler(&self) -> Option<&Arc<dyn Unmarshaler>> {
        self.unmarshaler.as_ref()
    }

    #[must_use]
    pub fn skips_body_download(&self) -> bool {
        self.skip_body_download
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn query_params(&self) -> &[(String, String)] {
        &self.query
    }

    /// Fail fast if the call is already canceled or past its deadline.
    ///
    /// # Errors
    /// Returns [`HttpError::Canceled`] or [`HttpError::DeadlineExceeded`].
    pub fn check(&self) -> Result<(), HttpError> {
        if self.cancellation.is_cancelled() {
            return Err(HttpError::Canceled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(HttpError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` unless the call is canceled or its deadline passes first.
    ///
    /// # Errors
    /// Returns [`HttpError::Canceled`] or [`HttpError::DeadlineExceeded`]; `fut`
    /// is dropped in that case.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, HttpError> {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => Err(HttpError::Canceled),
            () = deadline => Err(HttpError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `delay`, waking early with an error on cancellation or deadline.
    ///
    /// # Errors
    /// Same as [`run`](Self::run).
    pub async fn sleep(&self, delay: Duration) -> Result<(), HttpError> {
        self.run(tokio::time::sleep(delay)).await
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("canceled", &self.cancellation.is_cancelled())
            .field("deadline", &self.deadline)
            .field("retry", &self.retry)
            .field("capture", &self.capture.is_some())
            .field("unmarshaler", &self.unmarshaler.is_some())
            .field("skip_body_download", &self.skip_body_download)
            .field("headers", &self.headers.len())
            .field("query", &self.query.len())
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = Context::new();
        assert_eq!(ctx.run(async { 7 }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_canceled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = Context::new().with_cancellation(token);
        assert!(matches!(ctx.check(), Err(HttpError::Canceled)));
        let err = ctx.sleep(Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, HttpError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_sleep() {
        let ctx = Context::new().with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = ctx.sleep(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, HttpError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(ctx.check(), Err(HttpError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_wins() {
        let ctx = Context::new()
            .with_timeout(Duration::from_millis(50))
            .with_timeout(Duration::from_secs(60));
        let err = ctx.sleep(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, HttpError::DeadlineExceeded));
    }

    #[test]
    fn test_custom_headers_and_query() {
        let ctx = Context::new()
            .with_header("x-trace", "abc")
            .unwrap()
            .with_query_param("api-version", "2024-01-01");
        assert_eq!(ctx.headers()["x-trace"], "abc");
        assert_eq!(ctx.query_params()[0].0, "api-version");
        assert!(Context::new().with_header("bad header", "x").is_err());
    }
}
