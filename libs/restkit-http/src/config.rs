use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HttpError;
use crate::response::{DEFAULT_MAX_BODY_SIZE, Response};

/// Product token of the `User-Agent` the telemetry policy sends
pub const USER_AGENT_PRODUCT: &str = concat!("restkit/", env!("CARGO_PKG_VERSION"));

/// Longest accepted `TelemetryOptions::application_id`
pub const MAX_APPLICATION_ID_LEN: usize = 24;

/// Maximum bytes drained from a failed response before retrying (64 KiB).
///
/// Draining lets the connection return to the pool. Applies to decompressed bytes.
pub const DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT: usize = 64 * 1024;

/// Status codes retried by default: request timeout and the transient 5xx family
pub const DEFAULT_RETRY_STATUS_CODES: [u16; 5] = [408, 500, 502, 503, 504];

/// Caller-supplied retry decision; sees the response or the error of an attempt
pub type ShouldRetryFn = Arc<dyn Fn(Option<&Response>, Option<&HttpError>) -> bool + Send + Sync>;

/// Retry policy configuration.
///
/// Deserializes from config files with humantime durations:
///
/// ```yaml
/// retry:
///   max_retries: 5
///   try_timeout: 30s
///   retry_delay: 500ms
///   max_retry_delay: 1m   # null disables the cap
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Retries after the initial attempt (0 = single attempt, default: 3)
    pub max_retries: u32,

    /// Time limit for a single attempt (default: none)
    #[serde(with = "restkit_utils::humantime_serde::option")]
    pub try_timeout: Option<Duration>,

    /// Base delay of the exponential backoff (default: 800ms)
    #[serde(with = "restkit_utils::humantime_serde")]
    pub retry_delay: Duration,

    /// Cap on any single delay (default: 60s). `None` means unlimited.
    ///
    /// A server `Retry-After` larger than the cap stops retrying instead of waiting.
    #[serde(with = "restkit_utils::humantime_serde::option")]
    pub max_retry_delay: Option<Duration>,

    /// Response statuses that trigger a retry
    pub status_codes: Vec<u16>,

    /// Replaces the built-in classification when set
    #[serde(skip)]
    pub should_retry: Option<ShouldRetryFn>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            try_timeout: None,
            retry_delay: Duration::from_millis(800),
            max_retry_delay: Some(Duration::from_secs(60)),
            status_codes: DEFAULT_RETRY_STATUS_CODES.to_vec(),
            should_retry: None,
        }
    }
}

impl RetryOptions {
    /// Single attempt, no retries
    #[must_use]
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Short delays, for tests against local servers
    #[must_use]
    pub fn fast() -> Self {
        Self {
            retry_delay: Duration::from_millis(5),
            max_retry_delay: Some(Duration::from_millis(50)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&Response>, Option<&HttpError>) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("try_timeout", &self.try_timeout)
            .field("retry_delay", &self.retry_delay)
            .field("max_retry_delay", &self.max_retry_delay)
            .field("status_codes", &self.status_codes)
            .field("should_retry", &self.should_retry.is_some())
            .finish()
    }
}

/// `User-Agent` telemetry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryOptions {
    /// Prefix identifying the calling application (max 24 chars, no spaces)
    pub application_id: Option<String>,
    /// Skip the telemetry policy entirely
    pub disabled: bool,
}

/// Headers whose values are logged verbatim; all others print as `REDACTED`
pub const DEFAULT_ALLOWED_LOG_HEADERS: &[&str] = &[
    "accept",
    "cache-control",
    "connection",
    "content-length",
    "content-type",
    "date",
    "etag",
    "expires",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-unmodified-since",
    "last-modified",
    "pragma",
    "request-id",
    "retry-after",
    "server",
    "traceparent",
    "transfer-encoding",
    "user-agent",
    "www-authenticate",
    "x-ms-client-request-id",
    "x-ms-request-id",
    "x-ms-return-client-request-id",
];

/// Request/response logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Log request and response bodies (default: false)
    pub include_body: bool,
    /// Header names logged in clear, on top of [`DEFAULT_ALLOWED_LOG_HEADERS`]
    pub allowed_headers: Vec<String>,
    /// Query parameter names logged in clear; every other value is redacted
    pub allowed_query_params: Vec<String>,
}

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// OS native root certificate store
    Native,
}

/// Transport security configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum TransportSecurity {
    /// HTTPS only
    #[default]
    TlsOnly,
    /// Allow plain HTTP (local mock servers only)
    AllowInsecureHttp,
}

/// Configuration of the default hyper-based transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Per-attempt connection timeout (default: 30s)
    #[serde(with = "restkit_utils::humantime_serde")]
    pub request_timeout: Duration,

    /// Maximum downloaded body size in bytes (default: 10 MiB)
    pub max_body_size: usize,

    /// Transport security mode (default: `TlsOnly`)
    pub security: TransportSecurity,

    /// TLS root certificate strategy (default: `WebPki`)
    pub tls_roots: TlsRootConfig,

    /// Idle pooled connections are closed after this long (default: 90s)
    #[serde(with = "restkit_utils::humantime_serde::option")]
    pub pool_idle_timeout: Option<Duration>,

    /// Idle connections kept per host (default: 32)
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            security: TransportSecurity::TlsOnly,
            tls_roots: TlsRootConfig::default(),
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
        }
    }
}

impl TransportConfig {
    /// Local mock-server configuration (allows insecure HTTP, short timeouts)
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_body_size: 1024 * 1024,
            security: TransportSecurity::AllowInsecureHttp,
            tls_roots: TlsRootConfig::default(),
            pool_idle_timeout: Some(Duration::from_secs(10)),
            pool_max_idle_per_host: 4,
        }
    }

    /// Allow plain HTTP on an otherwise default configuration.
    ///
    /// Only compiled in debug builds or with the `allow-insecure-http` feature.
    #[cfg(any(debug_assertions, feature = "allow-insecure-http"))]
    #[must_use]
    pub fn allow_insecure_http(mut self) -> Self {
        tracing::warn!("insecure HTTP transport enabled; never use outside local testing");
        self.security = TransportSecurity::AllowInsecureHttp;
        self
    }
}
