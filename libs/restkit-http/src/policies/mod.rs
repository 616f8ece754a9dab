//! Built-in policies, in the order the [`PipelineBuilder`](crate::PipelineBuilder)
//! chains them.

mod body_download;
mod headers;
mod logging;
mod retry;
mod telemetry;

pub use body_download::BodyDownloadPolicy;
pub use headers::HeadersPolicy;
pub use logging::{BODY_LOG_LIMIT, LoggingPolicy, REDACTED};
pub use retry::{RetryPolicy, calculate_backoff};
pub use telemetry::TelemetryPolicy;
