use async_trait::async_trait;
use http::HeaderValue;
use http::header::USER_AGENT;

use crate::config::{MAX_APPLICATION_ID_LEN, TelemetryOptions, USER_AGENT_PRODUCT};
use crate::context::Context;
use crate::error::HttpError;
use crate::policy::{Next, Policy};
use crate::request::Request;
use crate::response::Response;

/// Stamps `User-Agent` with the client identity.
///
/// Format: `[<application_id> ][<component>/<version> ]restkit/<version> (<os>; <arch>)`.
/// A caller-provided `User-Agent` is kept and ours is appended after it.
pub struct TelemetryPolicy {
    user_agent: String,
}

impl TelemetryPolicy {
    /// `component` names the client library built on the pipeline, with its version.
    ///
    /// # Errors
    /// Returns [`HttpError::InvalidConfig`] if the application id is longer than
    /// 24 characters or contains a space.
    pub fn try_new(
        component: Option<(&str, &str)>,
        options: &TelemetryOptions,
    ) -> Result<Self, HttpError> {
        let mut parts = Vec::with_capacity(3);
        if let Some(app_id) = options.application_id.as_deref().filter(|id| !id.is_empty()) {
            if app_id.chars().count() > MAX_APPLICATION_ID_LEN || app_id.contains(' ') {
                return Err(HttpError::InvalidConfig(format!(
                    "application_id must be at most {MAX_APPLICATION_ID_LEN} characters without spaces, got '{app_id}'"
                )));
            }
            parts.push(app_id.to_owned());
        }
        if let Some((name, version)) = component {
            parts.push(format!("{name}/{version}"));
        }
        parts.push(format!(
            "{USER_AGENT_PRODUCT} ({}; {})",
            std::env::consts::OS,
            std::env::consts::ARCH
        ));

        let user_agent = parts.join(" ");
        HeaderValue::try_from(user_agent.as_str())?;
        Ok(Self { user_agent })
    }

    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

#[async_trait]
impl Policy for TelemetryPolicy {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: Next<'_>,
    ) -> Result<Response, HttpError> {
        let existing = request
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let value = match existing {
            Some(caller) => HeaderValue::try_from(format!("{caller} {}", self.user_agent))?,
            None => HeaderValue::try_from(self.user_agent.as_str())?,
        };
        request.headers_mut().insert(USER_AGENT, value);
        next.run(ctx, request).await
    }
}
