use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use url::Url;

use crate::response::Response;

/// Boxed error used at the seams where foreign errors enter the pipeline
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Header carrying a service-specific error code
pub const ERROR_CODE_HEADER: &str = "x-ms-error-code";

const SEPARATOR: &str =
    "--------------------------------------------------------------------------------";

/// Errors produced while sending a request through a [`Pipeline`](crate::Pipeline)
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// The last policy called `next` instead of sending the request
    #[error("no more policies in the pipeline; the chain must end in a transport")]
    NoMorePolicies,

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// URL scheme rejected by the transport security setting
    #[error("invalid URL scheme '{scheme}': {reason}")]
    InvalidScheme { scheme: String, reason: String },

    #[error("invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    #[error("failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// TLS initialization failed (e.g. no usable root certificates)
    #[error("TLS initialization failed: {0}")]
    Tls(#[source] BoxError),

    /// Connection-level failure reported by the transport
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// A single attempt exceeded `RetryOptions::try_timeout`
    #[error("request attempt timed out after {0:?}")]
    TryTimeout(Duration),

    /// The context's cancellation token fired
    #[error("operation canceled")]
    Canceled,

    /// The context's deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("body download policy: {0}")]
    BodyDownload(#[source] BoxError),

    #[error("response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    #[error("response body was not downloaded")]
    BodyNotBuffered,

    #[error("failed to read request body: {0}")]
    BodyRead(#[source] std::io::Error),

    #[error("failed to rewind request body: {0}")]
    BodyRewind(#[source] std::io::Error),

    /// Non-success HTTP status turned into an error
    #[error(transparent)]
    Response(Box<ResponseError>),

    /// Wrapped error the retry policy must not retry
    #[error(transparent)]
    NonRetriable(BoxError),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl HttpError {
    /// Mark `err` as non-retriable.
    ///
    /// An `HttpError` that already stops retries is returned unchanged.
    pub fn non_retriable(err: impl Into<BoxError>) -> Self {
        match err.into().downcast::<Self>() {
            Ok(inner) if !inner.is_retriable() => *inner,
            Ok(inner) => Self::NonRetriable(inner),
            Err(other) => Self::NonRetriable(other),
        }
    }

    /// Whether the retry policy may try again after this error
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::TryTimeout(_) | Self::BodyDownload(_) | Self::Response(_)
        )
    }

    /// The response error, if this error came from a non-success status
    #[must_use]
    pub fn as_response_error(&self) -> Option<&ResponseError> {
        match self {
            Self::Response(err) => Some(err),
            Self::NonRetriable(inner) => inner
                .downcast_ref::<Self>()
                .and_then(Self::as_response_error)
                .or_else(|| inner.downcast_ref::<ResponseError>()),
            _ => None,
        }
    }

    /// HTTP status of the failed response, when there is one
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        self.as_response_error().map(|e| e.status)
    }
}

impl From<ResponseError> for HttpError {
    fn from(err: ResponseError) -> Self {
        Self::Response(Box::new(err))
    }
}

/// Failed service response, with everything needed to diagnose it.
///
/// The `Display` output is a multi-line report:
///
/// ```text
/// GET https://service.example/items
/// --------------------------------------------------------------------------------
/// RESPONSE 404: Not Found
/// ERROR CODE: ResourceNotFound
/// --------------------------------------------------------------------------------
/// {
///   "code": "ResourceNotFound"
/// }
/// --------------------------------------------------------------------------------
/// ```
#[derive(Debug, Clone)]
pub struct ResponseError {
    pub status: StatusCode,
    /// From the `x-ms-error-code` header, else the JSON body's `error.code` or `code`
    pub error_code: Option<String>,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseError {
    /// Capture a failed response.
    ///
    /// The body is whatever has been downloaded; a streaming body is reported as empty.
    #[must_use]
    pub fn from_response(response: &Response) -> Self {
        let body = response.bytes().cloned().unwrap_or_default();
        let error_code = response
            .headers()
            .get(ERROR_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
            .or_else(|| error_code_from_body(&body));
        Self {
            status: response.status(),
            error_code,
            method: response.request_method().clone(),
            url: response.request_url().clone(),
            headers: response.headers().clone(),
            body,
        }
    }
}

fn error_code_from_body(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let code = match value.get("error") {
        Some(inner) if inner.is_object() => inner.get("code"),
        _ => value.get("code"),
    };
    code.and_then(serde_json::Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_owned)
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut url = self.url.clone();
        url.set_query(None);
        url.set_fragment(None);

        writeln!(f, "{} {}", self.method, url)?;
        writeln!(f, "{SEPARATOR}")?;
        writeln!(
            f,
            "RESPONSE {}: {}",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or_default()
        )?;
        match &self.error_code {
            Some(code) => writeln!(f, "ERROR CODE: {code}")?,
            None => writeln!(f, "ERROR CODE UNAVAILABLE")?,
        }
        writeln!(f, "{SEPARATOR}")?;
        if self.body.is_empty() {
            writeln!(f, "Response contained no body")?;
        } else {
            let pretty = serde_json::from_slice::<serde_json::Value>(&self.body)
                .ok()
                .and_then(|v| serde_json::to_string_pretty(&v).ok());
            match pretty {
                Some(json) => writeln!(f, "{json}")?,
                None => writeln!(f, "{}", String::from_utf8_lossy(&self.body))?,
            }
        }
        writeln!(f, "{SEPARATOR}")
    }
}

impl std::error::Error for ResponseError {}
