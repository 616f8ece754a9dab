use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::config::{DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT, RetryOptions};
use crate::context::Context;
use crate::error::HttpError;
use crate::policy::{Next, Policy};
use crate::request::Request;
use crate::response::{Response, has_retry_after};

/// Longest backoff the policy will ever compute (one day)
const MAX_BACKOFF_SECS: f64 = 86_400.0;

/// Exponent cap; 2^30 times any sane base delay is far past `MAX_BACKOFF_SECS`
const MAX_BACKOFF_EXPONENT: i32 = 30;

/// Re-sends the rest of the chain on transient failures.
///
/// Per attempt the body is rewound, headers are restored to their state on
/// entry, and the optional `try_timeout` bounds the attempt. Options on the
/// [`Context`] take precedence over the ones given here.
///
/// The policy owns the request body: it closes it before returning.
pub struct RetryPolicy {
    options: RetryOptions,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Policy for RetryPolicy {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: Next<'_>,
    ) -> Result<Response, HttpError> {
        let options = ctx.retry_options().unwrap_or(&self.options);
        let outcome = run_attempts(options, ctx, request, next).await;

        if let Err(e) = request.close_body() {
            tracing::debug!(error = %e, "failed to close request body");
        }
        if let (Some(capture), Ok(response)) = (ctx.response_capture(), &outcome) {
            capture.store(response.snapshot());
        }
        outcome
    }
}

async fn run_attempts(
    options: &RetryOptions,
    ctx: &Context,
    request: &mut Request,
    next: Next<'_>,
) -> Result<Response, HttpError> {
    let headers = request.headers().clone();
    let max_attempts = options.max_retries.saturating_add(1);
    let mut attempt: u32 = 1;

    loop {
        if attempt > 1 {
            request.rewind_body()?;
            request.headers_mut().clone_from(&headers);
        }

        let outcome = match options.try_timeout {
            Some(limit) => tokio::time::timeout(limit, next.run(ctx, request))
                .await
                .unwrap_or(Err(HttpError::TryTimeout(limit))),
            None => next.run(ctx, request).await,
        };

        if outcome.as_ref().is_err_and(|e| !e.is_retriable()) {
            return outcome;
        }
        if !should_retry(options, &outcome) || attempt >= max_attempts {
            return outcome;
        }
        if outcome.is_err() {
            ctx.check()?;
        }

        let server_delay = outcome.as_ref().ok().and_then(Response::retry_after);
        let delay = match server_delay {
            Some(delay) if options.max_retry_delay.is_some_and(|cap| delay > cap) => {
                tracing::debug!(
                    retry_after_ms = delay.as_millis(),
                    "server retry delay exceeds max_retry_delay; not retrying"
                );
                return outcome;
            }
            Some(delay) => delay,
            None => calculate_backoff(options, attempt),
        };

        match outcome {
            Ok(response) => {
                tracing::debug!(
                    retry = attempt,
                    max_retries = options.max_retries,
                    status = response.status().as_u16(),
                    method = %request.method(),
                    host = request.url().host_str().unwrap_or("unknown"),
                    backoff_ms = delay.as_millis(),
                    "retrying request after HTTP status"
                );
                response.drain(DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT).await;
            }
            Err(err) => {
                tracing::debug!(
                    retry = attempt,
                    max_retries = options.max_retries,
                    error = %err,
                    method = %request.method(),
                    host = request.url().host_str().unwrap_or("unknown"),
                    backoff_ms = delay.as_millis(),
                    "retrying request after error"
                );
            }
        }

        ctx.sleep(delay).await?;
        attempt += 1;
    }
}

fn should_retry(options: &RetryOptions, outcome: &Result<Response, HttpError>) -> bool {
    if let Some(decide) = &options.should_retry {
        return decide(outcome.as_ref().ok(), outcome.as_ref().err());
    }
    match outcome {
        Ok(response) => {
            response.has_status_code(&options.status_codes)
                || (response.status() == http::StatusCode::TOO_MANY_REQUESTS
                    && has_retry_after(response.headers()))
        }
        Err(_) => true,
    }
}

/// Delay before retry number `attempt` (1-based): `retry_delay * 2^(attempt-1)`,
/// scaled by a random factor in `[0.8, 1.3)` and capped at `max_retry_delay`.
///
/// Non-finite intermediate values are clamped rather than allowed to panic.
#[must_use]
pub fn calculate_backoff(options: &RetryOptions, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1))
        .unwrap_or(i32::MAX)
        .min(MAX_BACKOFF_EXPONENT);

    let base_secs = options.retry_delay.as_secs_f64() * 2f64.powi(exponent);
    let jitter = rand::rng().random_range(0.8..1.3);
    let secs = base_secs * jitter;
    let secs = if secs.is_finite() {
        secs.clamp(0.0, MAX_BACKOFF_SECS)
    } else {
        MAX_BACKOFF_SECS
    };

    let delay = Duration::from_secs_f64(secs);
    match options.max_retry_delay {
        Some(cap) => delay.min(cap),
        None => delay,
    }
}
