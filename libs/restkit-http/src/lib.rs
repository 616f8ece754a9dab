#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! HTTP request pipeline for `RestKit` service clients
//!
//! A [`Pipeline`] is an ordered chain of [`Policy`] values ending in a
//! [`Transport`]. Each policy may change the request, call the rest of the
//! chain (any number of times), and inspect or replace the response. The
//! standard chain built by [`PipelineBuilder`] provides:
//! - `User-Agent` telemetry
//! - Retries with exponential backoff, `Retry-After` support and per-attempt timeouts
//! - Rewinding of request bodies between attempts
//! - Redacting request/response logging via `tracing`
//! - Per-call headers and query parameters from the [`Context`]
//! - Response body download with a pluggable [`Unmarshaler`]
//! - A hyper + rustls transport (HTTPS only by default, transparent decompression)
//!
//! Every HTTP status is returned as `Ok`; [`Response::error_for_status`] turns
//! failures into a [`ResponseError`] with a readable report.
//!
//! # Example
//!
//! ```ignore
//! use restkit_http::{Context, Pipeline, Request, RetryOptions};
//! use std::time::Duration;
//!
//! let pipeline = Pipeline::builder()
//!     .component("widgets", env!("CARGO_PKG_VERSION"))
//!     .retry(RetryOptions { try_timeout: Some(Duration::from_secs(10)), ..Default::default() })
//!     .build()?;
//!
//! let ctx = Context::new().with_timeout(Duration::from_secs(60));
//! let mut request = Request::parse(http::Method::GET, "https://api.example.com/widgets/7")?;
//! let widget: Widget = pipeline.send(&ctx, &mut request).await?.error_for_status()?.json()?;
//! ```

mod config;
mod context;
mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
mod pipeline;
pub mod policies;
mod policy;
mod request;
mod response;
mod tls;
mod transport;
mod unmarshal;

pub use config::{
    DEFAULT_ALLOWED_LOG_HEADERS, DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT, DEFAULT_RETRY_STATUS_CODES,
    LogOptions, MAX_APPLICATION_ID_LEN, RetryOptions, ShouldRetryFn, TelemetryOptions,
    TlsRootConfig, TransportConfig, TransportSecurity, USER_AGENT_PRODUCT,
};
pub use context::{Context, ResponseCapture};
pub use error::{BoxError, ERROR_CODE_HEADER, HttpError, ResponseError};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use policy::{Next, Policy};
pub use request::{BytesBody, ReadSeekBody, Request, SeekableBody};
pub use response::{
    DEFAULT_MAX_BODY_SIZE, LimitedBody, Response, ResponseBody, has_retry_after,
    parse_retry_after,
};
pub use transport::{HyperTransport, Transport, TransportPolicy};
pub use unmarshal::{BomTolerantUnmarshaler, JsonUnmarshaler, Unmarshaler};

// Re-exported so dependents name the same versions
pub use async_trait::async_trait;
pub use http;
pub use tokio_util::sync::CancellationToken;
pub use url::Url;
