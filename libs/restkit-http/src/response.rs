use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode};
use http_body::Frame;
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{BoxError, HttpError, ResponseError};
use crate::unmarshal::Unmarshaler;

/// Default cap on downloaded response bodies (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Millisecond variants take precedence over the standard header
const RETRY_AFTER_MS_HEADERS: [&str; 2] = ["retry-after-ms", "x-ms-retry-after-ms"];

/// Type-erased streaming body as produced by the transport (already decompressed)
pub type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Parse the server's retry hint into a `Duration`.
///
/// Checked in order:
/// - `retry-after-ms` / `x-ms-retry-after-ms`: integer milliseconds
/// - `Retry-After`: integer seconds or an HTTP-date (RFC 1123)
///
/// Returns `None` when no header parses or the value lies in the past.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    for name in RETRY_AFTER_MS_HEADERS {
        if let Some(ms) = header_str(headers, name).and_then(|v| v.parse::<u64>().ok()) {
            return Some(Duration::from_millis(ms));
        }
    }

    let value = header_str(headers, http::header::RETRY_AFTER.as_str())?;
    if let Ok(seconds) = value.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        return Some(Duration::from_secs(seconds.cast_unsigned()));
    }

    let at = httpdate::parse_http_date(value).ok()?;
    at.duration_since(SystemTime::now()).ok()
}

/// Whether any retry hint header is present, parseable or not
#[must_use]
pub fn has_retry_after(headers: &HeaderMap) -> bool {
    headers.contains_key(http::header::RETRY_AFTER)
        || RETRY_AFTER_MS_HEADERS
            .iter()
            .any(|name| headers.contains_key(*name))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok().map(str::trim)
}

pin_project! {
    /// Streaming body that fails with [`HttpError::BodyTooLarge`] once more than
    /// `limit` bytes have passed through.
    ///
    /// Obtained from [`Response::into_limited_body`] when body download was skipped.
    pub struct LimitedBody {
        #[pin]
        inner: ResponseBody,
        limit: usize,
        read: usize,
    }
}

impl LimitedBody {
    #[must_use]
    pub fn new(inner: ResponseBody, limit: usize) -> Self {
        Self {
            inner,
            limit,
            read: 0,
        }
    }

    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.read
    }
}

impl http_body::Body for LimitedBody {
    type Data = Bytes;
    type Error = HttpError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    *this.read += data.len();
                    if *this.read > *this.limit {
                        return Poll::Ready(Some(Err(HttpError::BodyTooLarge {
                            limit: *this.limit,
                            actual: *this.read,
                        })));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(HttpError::Transport(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

enum Body {
    Buffered(Bytes),
    Streaming(ResponseBody),
}

/// Response flowing back up the policy chain.
///
/// Bodies arrive streaming from the transport. The body-download policy buffers
/// them, after which [`bytes`](Self::bytes), [`json`](Self::json) and
/// [`snapshot`](Self::snapshot) work without I/O.
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
    request_method: Method,
    request_url: Url,
    max_body_size: usize,
    unmarshaler: Option<Arc<dyn Unmarshaler>>,
}

impl Response {
    /// Response whose body is already in memory
    #[must_use]
    pub fn buffered(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        request_method: Method,
        request_url: Url,
    ) -> Self {
        Self {
            status,
            headers,
            body: Body::Buffered(body),
            request_method,
            request_url,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            unmarshaler: None,
        }
    }

    /// Response with a body still on the wire
    #[must_use]
    pub fn streaming(
        status: StatusCode,
        headers: HeaderMap,
        body: ResponseBody,
        request_method: Method,
        request_url: Url,
    ) -> Self {
        Self {
            status,
            headers,
            body: Body::Streaming(body),
            request_method,
            request_url,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            unmarshaler: None,
        }
    }

    #[must_use]
    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Header value as a trimmed string, if present and valid UTF-8
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    #[must_use]
    pub fn request_method(&self) -> &Method {
        &self.request_method
    }

    #[must_use]
    pub fn request_url(&self) -> &Url {
        &self.request_url
    }

    /// Whether the status is one of `codes`
    #[must_use]
    pub fn has_status_code(&self, codes: &[u16]) -> bool {
        codes.contains(&self.status.as_u16())
    }

    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        parse_retry_after(&self.headers)
    }

    #[must_use]
    pub fn is_buffered(&self) -> bool {
        matches!(self.body, Body::Buffered(_))
    }

    /// Downloaded body, `None` while still streaming
    #[must_use]
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.body {
            Body::Buffered(bytes) => Some(bytes),
            Body::Streaming(_) => None,
        }
    }

    /// Download the whole body into memory, enforcing the size limit.
    ///
    /// # Errors
    /// Returns [`HttpError::BodyTooLarge`] past the limit and
    /// [`HttpError::Transport`] if the stream fails.
    pub async fn buffer(&mut self) -> Result<(), HttpError> {
        let body = match std::mem::replace(&mut self.body, Body::Buffered(Bytes::new())) {
            Body::Buffered(bytes) => {
                self.body = Body::Buffered(bytes);
                return Ok(());
            }
            Body::Streaming(body) => body,
        };

        let mut limited = LimitedBody::new(body, self.max_body_size);
        let mut buf = BytesMut::new();
        while let Some(frame) = limited.frame().await {
            if let Some(data) = frame?.data_ref() {
                buf.extend_from_slice(data);
            }
        }
        self.body = Body::Buffered(buf.freeze());
        Ok(())
    }

    /// Deserialize the downloaded body with the attached unmarshaler, or plain
    /// `serde_json` when none was configured.
    ///
    /// # Errors
    /// Returns [`HttpError::BodyNotBuffered`] for a streaming body and
    /// [`HttpError::Json`] if decoding fails.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        let bytes = self.bytes().ok_or(HttpError::BodyNotBuffered)?;
        match &self.unmarshaler {
            Some(unmarshaler) => Ok(serde_json::from_value(unmarshaler.unmarshal(bytes)?)?),
            None => Ok(serde_json::from_slice(bytes)?),
        }
    }

    /// Downloaded body as UTF-8, lossy
    ///
    /// # Errors
    /// Returns [`HttpError::BodyNotBuffered`] for a streaming body.
    pub fn text(&self) -> Result<String, HttpError> {
        let bytes = self.bytes().ok_or(HttpError::BodyNotBuffered)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Turn a non-2xx response into [`HttpError::Response`]
    ///
    /// # Errors
    /// Returns the response error for any status outside 200..=299.
    pub fn error_for_status(self) -> Result<Self, HttpError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(ResponseError::from_response(&self).into())
        }
    }

    /// Copy of the response sharing the downloaded body.
    ///
    /// A body that is still streaming cannot be shared and comes back empty.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self {
            status: self.status,
            headers: self.headers.clone(),
            body: Body::Buffered(self.bytes().cloned().unwrap_or_default()),
            request_method: self.request_method.clone(),
            request_url: self.request_url.clone(),
            max_body_size: self.max_body_size,
            unmarshaler: self.unmarshaler.clone(),
        }
    }

    /// Read and discard up to `limit` bytes so the connection can be reused
    pub async fn drain(self, limit: usize) {
        let Body::Streaming(body) = self.body else {
            return;
        };
        let mut limited = LimitedBody::new(body, limit);
        while let Some(frame) = limited.frame().await {
            if frame.is_err() {
                break;
            }
        }
    }

    /// Streaming body with the size limit enforced; buffered bodies are re-wrapped
    #[must_use]
    pub fn into_limited_body(self) -> LimitedBody {
        let body = match self.body {
            Body::Streaming(body) => body,
            Body::Buffered(bytes) => http_body_util::Full::new(bytes)
                .map_err(|never| match never {})
                .boxed(),
        };
        LimitedBody::new(body, self.max_body_size)
    }

    pub(crate) fn set_unmarshaler(&mut self, unmarshaler: Arc<dyn Unmarshaler>) {
        self.unmarshaler = Some(unmarshaler);
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("request_method", &self.request_method)
            .field("request_url", &self.request_url.as_str())
            .field("buffered", &self.is_buffered())
            .finish_non_exhaustive()
    }
}
