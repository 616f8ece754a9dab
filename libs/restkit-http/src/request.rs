use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use http_body_util::Full;
use serde::Serialize;
use url::Url;

use crate::error::HttpError;

/// Request payload the pipeline can replay.
///
/// The retry and auth policies rewind the body before every re-send, so a body
/// must be able to return to its start. `read_to_end` reads from the current
/// position.
pub trait SeekableBody: Send + Sync {
    /// Total length in bytes
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the remaining bytes, advancing the position to the end
    ///
    /// # Errors
    /// Propagates I/O failures of the underlying source.
    fn read_to_end(&mut self) -> io::Result<Bytes>;

    /// Seek back to the start
    ///
    /// # Errors
    /// Propagates I/O failures of the underlying source.
    fn rewind(&mut self) -> io::Result<()>;

    /// Release the underlying resource. Called once by the pipeline.
    ///
    /// # Errors
    /// Propagates I/O failures of the underlying source.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// In-memory body
#[derive(Debug, Clone)]
pub struct BytesBody {
    data: Bytes,
    pos: usize,
}

impl BytesBody {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl SeekableBody for BytesBody {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_to_end(&mut self) -> io::Result<Bytes> {
        let rest = self.data.slice(self.pos..);
        self.pos = self.data.len();
        Ok(rest)
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.pos = 0;
        Ok(())
    }
}

/// Body backed by any `Read + Seek` source such as a file or a cursor
pub struct ReadSeekBody<R> {
    inner: R,
    len: u64,
}

impl<R: Read + Seek> ReadSeekBody<R> {
    /// Wrap `inner`, measuring its length and seeking it back to the start.
    ///
    /// # Errors
    /// Fails if the source cannot seek.
    pub fn new(mut inner: R) -> io::Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, len })
    }
}

impl<R: Read + Seek + Send + Sync> SeekableBody for ReadSeekBody<R> {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_to_end(&mut self) -> io::Result<Bytes> {
        let mut buf = Vec::new();
        self.inner.read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn rewind(&mut self) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(0)).map(|_| ())
    }
}

/// Outgoing request as seen by policies.
///
/// Policies mutate the request in place (headers, URL) and the transport reads
/// the body from its current position.
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Box<dyn SeekableBody>>,
    body_closed: bool,
}

impl Request {
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            body_closed: false,
        }
    }

    /// Parse `url` and build a request.
    ///
    /// # Errors
    /// Returns [`HttpError::InvalidUrl`] for a malformed URL.
    pub fn parse(method: Method, url: &str) -> Result<Self, HttpError> {
        let parsed = Url::parse(url).map_err(|e| HttpError::InvalidUrl {
            url: url.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(method, parsed))
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Set a header, replacing any previous value.
    ///
    /// # Errors
    /// Returns an error if the name or value is not valid HTTP.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), HttpError> {
        let name = HeaderName::try_from(name)?;
        let value = HeaderValue::try_from(value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Attach a body and its content type.
    ///
    /// # Errors
    /// Returns an error if `content_type` is not a valid header value.
    pub fn set_body(
        &mut self,
        body: impl SeekableBody + 'static,
        content_type: &str,
    ) -> Result<(), HttpError> {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::try_from(content_type)?);
        self.body = Some(Box::new(body));
        self.body_closed = false;
        Ok(())
    }

    /// Serialize `value` as the JSON body.
    ///
    /// # Errors
    /// Returns [`HttpError::Json`] if serialization fails.
    pub fn set_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), HttpError> {
        let data = serde_json::to_vec(value)?;
        self.set_body(BytesBody::new(data), "application/json")
    }

    #[must_use]
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    #[must_use]
    pub fn body_len(&self) -> u64 {
        self.body.as_ref().map_or(0, |b| b.len())
    }

    /// Detach the body, leaving the request empty
    pub fn take_body(&mut self) -> Option<Box<dyn SeekableBody>> {
        self.body.take()
    }

    /// Re-attach a body previously removed with [`take_body`](Self::take_body)
    pub fn restore_body(&mut self, body: Option<Box<dyn SeekableBody>>) {
        self.body = body;
    }

    /// Read the body from its current position; empty when there is none.
    ///
    /// # Errors
    /// Returns [`HttpError::BodyRead`] on I/O failure.
    pub fn read_body(&mut self) -> Result<Bytes, HttpError> {
        match self.body.as_mut() {
            Some(body) => body.read_to_end().map_err(HttpError::BodyRead),
            None => Ok(Bytes::new()),
        }
    }

    /// Seek the body back to its start. No-op without a body.
    ///
    /// # Errors
    /// Returns [`HttpError::BodyRewind`], which the retry policy never retries.
    pub fn rewind_body(&mut self) -> Result<(), HttpError> {
        match self.body.as_mut() {
            Some(body) => body.rewind().map_err(HttpError::BodyRewind),
            None => Ok(()),
        }
    }

    /// Close the body. Safe to call repeatedly; only the first call reaches the body.
    ///
    /// # Errors
    /// Returns [`HttpError::BodyRead`] if the body fails to close.
    pub fn close_body(&mut self) -> Result<(), HttpError> {
        if self.body_closed {
            return Ok(());
        }
        self.body_closed = true;
        match self.body.as_mut() {
            Some(body) => body.close().map_err(HttpError::BodyRead),
            None => Ok(()),
        }
    }

    /// Build the wire request, consuming the body from its current position
    pub(crate) fn build_wire_request(&mut self) -> Result<http::Request<Full<Bytes>>, HttpError> {
        let payload = self.read_body()?;
        let uri: http::Uri = self.url.as_str().parse().map_err(|e: http::uri::InvalidUri| {
            HttpError::InvalidUrl {
                url: self.url.to_string(),
                reason: e.to_string(),
            }
        })?;
        let mut builder = http::Request::builder()
            .method(self.method.clone())
            .uri(uri);
        if let Some(headers) = builder.headers_mut() {
            headers.clone_from(&self.headers);
        }
        Ok(builder.body(Full::new(payload))?)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers.len())
            .field("body_len", &self.body_len())
            .finish_non_exhaustive()
    }
}
