use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use async_trait::async_trait;
use http::HeaderMap;
use http::header::CONTENT_TYPE;
use url::Url;

use crate::config::{DEFAULT_ALLOWED_LOG_HEADERS, LogOptions};
use crate::context::Context;
use crate::error::HttpError;
use crate::policy::{Next, Policy};
use crate::request::Request;
use crate::response::Response;

/// Placeholder for header and query values that are not allow-listed
pub const REDACTED: &str = "REDACTED";

/// Bodies longer than this are truncated in logs (4 KiB)
pub const BODY_LOG_LIMIT: usize = 4 * 1024;

/// Logs each attempt at `debug` level and failures at `warn`.
///
/// Sits inside the retry loop, so every attempt is logged. Header and query
/// values are redacted unless allow-listed.
pub struct LoggingPolicy {
    allowed_headers: HashSet<String>,
    allowed_query_params: HashSet<String>,
    include_body: bool,
}

impl LoggingPolicy {
    #[must_use]
    pub fn new(options: &LogOptions) -> Self {
        let allowed_headers = DEFAULT_ALLOWED_LOG_HEADERS
            .iter()
            .map(|h| (*h).to_owned())
            .chain(options.allowed_headers.iter().map(|h| h.to_ascii_lowercase()))
            .collect();
        let allowed_query_params = options.allowed_query_params.iter().cloned().collect();
        Self {
            allowed_headers,
            allowed_query_params,
            include_body: options.include_body,
        }
    }

    fn redact_url(&self, url: &Url) -> String {
        let mut redacted = url.clone();
        if url.query().is_some() {
            let pairs: Vec<(String, String)> = url
                .query_pairs()
                .map(|(k, v)| {
                    let value = if self.allowed_query_params.contains(k.as_ref()) {
                        v.into_owned()
                    } else {
                        REDACTED.to_owned()
                    };
                    (k.into_owned(), value)
                })
                .collect();
            redacted.query_pairs_mut().clear().extend_pairs(pairs);
        }
        redacted.to_string()
    }

    fn redact_headers(&self, headers: &HeaderMap) -> BTreeMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                let shown = if self.allowed_headers.contains(name.as_str()) {
                    String::from_utf8_lossy(value.as_bytes()).into_owned()
                } else {
                    REDACTED.to_owned()
                };
                (name.as_str().to_owned(), shown)
            })
            .collect()
    }

    fn request_body(&self, request: &mut Request) -> Option<String> {
        if !self.include_body || !request.has_body() || !is_textual(request.headers()) {
            return None;
        }
        let bytes = request.read_body().ok()?;
        if let Err(e) = request.rewind_body() {
            tracing::warn!(error = %e, "failed to rewind request body after logging it");
        }
        Some(preview(&bytes))
    }
}

fn is_textual(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("text/") || ct.contains("json") || ct.contains("xml")
        })
}

fn preview(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(BODY_LOG_LIMIT)];
    let mut text = String::from_utf8_lossy(shown).into_owned();
    if bytes.len() > BODY_LOG_LIMIT {
        text.push_str("...(truncated)");
    }
    text
}

#[async_trait]
impl Policy for LoggingPolicy {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: Next<'_>,
    ) -> Result<Response, HttpError> {
        let url = self.redact_url(request.url());
        if tracing::enabled!(tracing::Level::DEBUG) {
            let body = self.request_body(request);
            tracing::debug!(
                method = %request.method(),
                url = %url,
                headers = ?self.redact_headers(request.headers()),
                body = body.as_deref(),
                "sending request"
            );
        }

        let started = Instant::now();
        let outcome = next.run(ctx, request).await;
        let elapsed_ms = started.elapsed().as_millis();

        match &outcome {
            Ok(response) => {
                let body = (self.include_body && is_textual(response.headers()))
                    .then(|| response.bytes().map(|b| preview(b)))
                    .flatten();
                tracing::debug!(
                    method = %request.method(),
                    url = %url,
                    status = response.status().as_u16(),
                    elapsed_ms,
                    headers = ?self.redact_headers(response.headers()),
                    body = body.as_deref(),
                    "received response"
                );
            }
            Err(err) => {
                tracing::warn!(
                    method = %request.method(),
                    url = %url,
                    elapsed_ms,
                    error = %err,
                    "request failed"
                );
            }
        }
        outcome
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::mock::{MockResponse, MockTransport};
    use crate::pipeline::Pipeline;
    use crate::request::BytesBody;
    use crate::transport::TransportPolicy;
    use http::{Method, StatusCode};
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn policy() -> LoggingPolicy {
        LoggingPolicy::new(&LogOptions {
            include_body: true,
            allowed_headers: vec!["X-Visible".to_owned()],
            allowed_query_params: vec!["api-version".to_owned()],
        })
    }

    #[test]
    fn test_query_values_redacted_unless_allowed() {
        let url = Url::parse("https://example.com/x?api-version=1&sig=secret").unwrap();
        let shown = policy().redact_url(&url);
        assert!(shown.contains("api-version=1"));
        assert!(shown.contains("sig=REDACTED"));
        assert!(!shown.contains("secret"));
    }

    #[test]
    fn test_headers_redacted_unless_allowed() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        headers.insert("x-visible", "yes".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());
        let shown = policy().redact_headers(&headers);
        assert_eq!(shown["authorization"], REDACTED);
        assert_eq!(shown["x-visible"], "yes");
        assert_eq!(shown["content-type"], "application/json");
    }

    #[test]
    fn test_preview_truncates() {
        let long = vec![b'a'; BODY_LOG_LIMIT + 10];
        assert!(preview(&long).ends_with("...(truncated)"));
        assert_eq!(preview(b"short"), "short");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_logs_without_leaking_secrets_and_keeps_body() {
        let transport = Arc::new(MockTransport::new());
        transport.set_response(MockResponse::new(StatusCode::OK));
        let pipeline = Pipeline::from_policies(vec![
            Arc::new(policy()),
            Arc::new(TransportPolicy(transport.clone())),
        ]);

        let mut req =
            Request::parse(Method::POST, "https://example.com/items?token=hunter2").unwrap();
        req.set_header("authorization", "Bearer hunter2").unwrap();
        req.set_body(BytesBody::new(r#"{"a":1}"#), "application/json")
            .unwrap();
        pipeline.send(&Context::new(), &mut req).await.unwrap();

        assert!(logs_contain("sending request"));
        assert!(logs_contain("received response"));
        assert!(!logs_contain("hunter2"));
        assert_eq!(transport.requests()[0].body, r#"{"a":1}"#);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failures_logged_at_warn() {
        let transport = Arc::new(MockTransport::new());
        transport.set_error(|| HttpError::Transport("connection refused".into()));
        let pipeline = Pipeline::from_policies(vec![
            Arc::new(policy()),
            Arc::new(TransportPolicy(transport.clone())),
        ]);
        let mut req = Request::parse(Method::GET, "https://example.com/").unwrap();
        assert!(pipeline.send(&Context::new(), &mut req).await.is_err());
        assert!(logs_contain("request failed"));
        assert!(logs_contain("connection refused"));
    }
}
