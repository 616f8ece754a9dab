//! Tracking of long-running operations
//!
//! A service answers a long-running request early and describes how to follow
//! the operation in the response. [`Poller::new`] reads that description and
//! picks a strategy:
//!
//! - `Operation-Location` / `Azure-AsyncOperation`: poll a status monitor
//!   whose body carries `status`
//! - `Location` on a 202: poll the location until it stops answering 202
//! - PUT/PATCH with a non-terminal `properties.provisioningState`: poll the
//!   resource itself
//! - anything else: the operation already finished
//!
//! A poller that has not finished can be saved with
//! [`resume_token`](Poller::resume_token) and rebuilt later, possibly in
//! another process, with [`from_resume_token`](Poller::from_resume_token).

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use http::{Method, StatusCode};
use restkit_http::{Context, HttpError, Pipeline, Request, Response, ResponseError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const OPERATION_LOCATION: &str = "operation-location";
const ASYNC_OPERATION: &str = "azure-asyncoperation";
const LOCATION: &str = "location";

/// Floor for the interval between polls in [`Poller::poll_until_done`]
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// The operation has not reached a terminal state yet
    #[error("the operation is still in progress")]
    NotDone,

    #[error("the operation already reached a terminal state")]
    Terminal,

    /// Operations that completed in the initial response have nothing to resume
    #[error("a synchronously completed operation cannot be resumed")]
    NoOpResume,

    #[error("invalid resume token: {0}")]
    InvalidResumeToken(String),

    #[error("202 response carries no polling URL")]
    MissingPollingUrl,

    #[error("status monitor response has no status")]
    MissingStatus,

    #[error(transparent)]
    Http(#[from] HttpError),
}

/// State of a long-running operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl OperationStatus {
    /// Map a service status string, ignoring case.
    ///
    /// Values other than the terminal ones count as in progress.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("succeeded") {
            Self::Succeeded
        } else if value.eq_ignore_ascii_case("failed") {
            Self::Failed
        } else if value.eq_ignore_ascii_case("canceled") || value.eq_ignore_ascii_case("cancelled")
        {
            Self::Canceled
        } else {
            Self::InProgress
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::InProgress
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "InProgress",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Canceled => "Canceled",
        };
        f.write_str(s)
    }
}

/// Where the result of a finished operation is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalStateVia {
    /// The `Location` header of the initial response
    Location,
    /// The URL of the initial request
    OriginalUri,
    /// The body of the status monitor
    OperationLocation,
}

#[derive(Debug, Clone, Default)]
pub struct PollerOptions {
    /// Overrides the method-based choice of the final GET
    pub final_state_via: Option<FinalStateVia>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Strategy {
    #[serde(rename_all = "camelCase")]
    OperationLocation {
        polling_url: String,
        #[serde(default)]
        location_url: Option<String>,
        #[serde(default)]
        resource_location: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Location { polling_url: String },
    Body,
    NoOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollerState {
    #[serde(flatten)]
    strategy: Strategy,
    method: String,
    original_url: String,
    status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    final_state_via: Option<FinalStateVia>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusMonitor {
    status: Option<String>,
    resource_location: Option<String>,
}

#[derive(Deserialize)]
struct ResourceBody {
    properties: Option<ResourceProperties>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceProperties {
    provisioning_state: Option<String>,
}

/// Driver for one long-running operation producing a `T`
pub struct Poller<T> {
    pipeline: Pipeline,
    state: PollerState,
    last: Option<Response>,
    result: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned + Default> Poller<T> {
    /// Start tracking the operation that `initial` answered.
    ///
    /// # Errors
    /// - [`HttpError::Response`] (as [`PollerError::Http`]) when `initial` is
    ///   not a 2xx
    /// - [`PollerError::MissingPollingUrl`] for a 202 without a polling header
    /// - body download errors of the initial response
    pub async fn new(
        pipeline: Pipeline,
        mut initial: Response,
        options: PollerOptions,
    ) -> Result<Self, PollerError> {
        initial.buffer().await?;
        if !initial.status().is_success() {
            return Err(HttpError::from(ResponseError::from_response(&initial)).into());
        }

        let method = initial.request_method().clone();
        let original_url = initial.request_url().to_string();
        let operation_url = match header_url(&initial, OPERATION_LOCATION)? {
            Some(url) => Some(url),
            None => header_url(&initial, ASYNC_OPERATION)?,
        };
        let location_url = header_url(&initial, LOCATION)?;

        let (strategy, status) = if let Some(polling_url) = operation_url {
            // the initial body may be the resource rather than a status monitor
            let monitor = status_monitor(&initial).ok().flatten();
            let status = monitor
                .as_ref()
                .and_then(|m| m.status.as_deref())
                .map_or(OperationStatus::InProgress, OperationStatus::parse);
            let strategy = Strategy::OperationLocation {
                polling_url,
                location_url,
                resource_location: monitor.and_then(|m| m.resource_location),
            };
            (strategy, status)
        } else if initial.status() == StatusCode::ACCEPTED {
            let polling_url = location_url.ok_or(PollerError::MissingPollingUrl)?;
            (Strategy::Location { polling_url }, OperationStatus::InProgress)
        } else if method == Method::PUT || method == Method::PATCH {
            let status = provisioning_state(&initial).unwrap_or(
                if initial.status() == StatusCode::CREATED {
                    OperationStatus::InProgress
                } else {
                    OperationStatus::Succeeded
                },
            );
            if status.is_terminal() {
                (Strategy::NoOp, status)
            } else {
                (Strategy::Body, status)
            }
        } else {
            (Strategy::NoOp, OperationStatus::Succeeded)
        };

        tracing::debug!(
            strategy = strategy.name(),
            %status,
            %method,
            "tracking long-running operation"
        );

        Ok(Self {
            pipeline,
            state: PollerState {
                strategy,
                method: method.to_string(),
                original_url,
                status,
                final_state_via: options.final_state_via,
            },
            last: Some(initial),
            result: PhantomData,
        })
    }

    /// Rebuild a poller saved with [`resume_token`](Self::resume_token).
    ///
    /// # Errors
    /// [`PollerError::InvalidResumeToken`] when `token` is not valid JSON, has
    /// an unknown strategy or misses fields, or describes an operation that
    /// cannot be polled.
    pub fn from_resume_token(token: &str, pipeline: Pipeline) -> Result<Self, PollerError> {
        let state: PollerState = serde_json::from_str(token)
            .map_err(|e| PollerError::InvalidResumeToken(e.to_string()))?;
        if matches!(state.strategy, Strategy::NoOp) {
            return Err(PollerError::InvalidResumeToken(
                "operation has no polling strategy".to_owned(),
            ));
        }
        if state.status.is_terminal() {
            return Err(PollerError::InvalidResumeToken(format!(
                "operation is already {}",
                state.status
            )));
        }
        Method::from_bytes(state.method.as_bytes())
            .map_err(|e| PollerError::InvalidResumeToken(e.to_string()))?;

        Ok(Self {
            pipeline,
            state,
            last: None,
            result: PhantomData,
        })
    }

    #[must_use]
    pub fn status(&self) -> OperationStatus {
        self.state.status
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.state.status.is_terminal()
    }

    /// Opaque token from which [`from_resume_token`](Self::from_resume_token)
    /// rebuilds this poller.
    ///
    /// # Errors
    /// [`PollerError::NoOpResume`] for operations that finished in the initial
    /// response and [`PollerError::Terminal`] once the operation finished.
    pub fn resume_token(&self) -> Result<String, PollerError> {
        if matches!(self.state.strategy, Strategy::NoOp) {
            return Err(PollerError::NoOpResume);
        }
        if self.done() {
            return Err(PollerError::Terminal);
        }
        Ok(serde_json::to_string(&self.state).map_err(HttpError::from)?)
    }

    /// Check the operation once.
    ///
    /// A finished poller returns its last response without HTTP. The state is
    /// only updated from a successful poll, so a failed or canceled poll can
    /// simply be repeated.
    ///
    /// # Errors
    /// Pipeline errors, non-2xx poll responses as [`HttpError::Response`] and
    /// [`PollerError::MissingStatus`] for a status monitor without `status`.
    pub async fn poll(&mut self, ctx: &Context) -> Result<Response, PollerError> {
        if self.done() {
            return self
                .last
                .as_ref()
                .map(Response::snapshot)
                .ok_or(PollerError::Terminal);
        }

        let url = match &self.state.strategy {
            Strategy::OperationLocation { polling_url, .. }
            | Strategy::Location { polling_url } => polling_url.clone(),
            Strategy::Body | Strategy::NoOp => self.state.original_url.clone(),
        };
        let mut response = self.get(ctx, &url).await?;
        ctx.run(response.buffer()).await??;
        if !response.status().is_success() {
            return Err(HttpError::from(ResponseError::from_response(&response)).into());
        }

        let mut strategy = self.state.strategy.clone();
        let status = match &mut strategy {
            Strategy::OperationLocation {
                resource_location, ..
            } => {
                let monitor = status_monitor(&response)?.ok_or(PollerError::MissingStatus)?;
                let status = monitor.status.ok_or(PollerError::MissingStatus)?;
                if monitor.resource_location.is_some() {
                    *resource_location = monitor.resource_location;
                }
                OperationStatus::parse(&status)
            }
            Strategy::Location { polling_url } => match response.status() {
                StatusCode::ACCEPTED => {
                    if let Some(next) = header_url(&response, LOCATION)? {
                        *polling_url = next;
                    }
                    OperationStatus::InProgress
                }
                StatusCode::OK | StatusCode::CREATED => {
                    provisioning_state(&response).unwrap_or(OperationStatus::Succeeded)
                }
                _ => OperationStatus::Succeeded,
            },
            Strategy::Body => match response.status() {
                StatusCode::ACCEPTED => OperationStatus::InProgress,
                StatusCode::NO_CONTENT => OperationStatus::Succeeded,
                _ => provisioning_state(&response).unwrap_or(OperationStatus::Succeeded),
            },
            Strategy::NoOp => OperationStatus::Succeeded,
        };

        tracing::debug!(%status, url = %response.request_url(), "polled long-running operation");
        self.state.strategy = strategy;
        self.state.status = status;
        self.last = Some(response.snapshot());
        Ok(response)
    }

    /// Poll until the operation finishes, then fetch its result.
    ///
    /// A `Retry-After` on the latest response delays the first poll. Between
    /// polls the poller waits for the response's `Retry-After` hint, or
    /// `interval` when there is none; `interval` is raised to at least
    /// [`MIN_POLL_INTERVAL`]. Waiting stops early when `ctx` is canceled or
    /// its deadline passes.
    ///
    /// # Errors
    /// Everything [`poll`](Self::poll) and [`result`](Self::result) return,
    /// plus [`HttpError::Canceled`] and [`HttpError::DeadlineExceeded`].
    pub async fn poll_until_done(
        &mut self,
        ctx: &Context,
        interval: Duration,
    ) -> Result<T, PollerError> {
        let interval = interval.max(MIN_POLL_INTERVAL);
        if !self.done()
            && let Some(delay) = self.last.as_ref().and_then(Response::retry_after)
        {
            tracing::trace!(?delay, "waiting before first poll");
            ctx.sleep(delay).await?;
        }
        while !self.done() {
            let response = self.poll(ctx).await?;
            if self.done() {
                break;
            }
            let delay = response.retry_after().unwrap_or(interval);
            tracing::trace!(?delay, "waiting before next poll");
            ctx.sleep(delay).await?;
        }
        self.result(ctx).await
    }

    /// Result of a finished operation.
    ///
    /// A successful operation may need one more GET, depending on the initial
    /// method or [`PollerOptions::final_state_via`]. Empty bodies and 204
    /// produce `T::default()`.
    ///
    /// # Errors
    /// - [`PollerError::NotDone`] before the operation finished
    /// - [`HttpError::Response`] built from the last response when the
    ///   operation failed or was canceled
    /// - errors of the final GET and of decoding the body
    pub async fn result(&self, ctx: &Context) -> Result<T, PollerError> {
        match self.state.status {
            OperationStatus::InProgress => return Err(PollerError::NotDone),
            OperationStatus::Failed | OperationStatus::Canceled => {
                let last = self.last.as_ref().ok_or(PollerError::NotDone)?;
                return Err(HttpError::from(ResponseError::from_response(last)).into());
            }
            OperationStatus::Succeeded => {}
        }

        if let Some(url) = self.final_url() {
            let mut response = self.get(ctx, &url).await?;
            ctx.run(response.buffer()).await??;
            let response = response.error_for_status()?;
            return decode(&response);
        }
        let last = self.last.as_ref().ok_or(PollerError::NotDone)?;
        decode(last)
    }

    /// Target of the GET that fetches the final result, if one is needed
    fn final_url(&self) -> Option<String> {
        let method = self.state.method.as_str();
        if method == Method::DELETE.as_str() {
            return None;
        }
        let original = Some(self.state.original_url.clone());
        match &self.state.strategy {
            Strategy::OperationLocation {
                location_url,
                resource_location,
                ..
            } => match self.state.final_state_via {
                Some(FinalStateVia::Location) => location_url.clone(),
                Some(FinalStateVia::OriginalUri) => original,
                None if method == Method::PUT.as_str() || method == Method::PATCH.as_str() => {
                    original
                }
                None if method == Method::POST.as_str() => {
                    location_url.clone().or_else(|| resource_location.clone())
                }
                Some(FinalStateVia::OperationLocation) | None => None,
            },
            Strategy::Location { .. } | Strategy::Body => match self.state.final_state_via {
                Some(FinalStateVia::OriginalUri) => original,
                _ => None,
            },
            Strategy::NoOp => None,
        }
    }

    async fn get(&self, ctx: &Context, url: &str) -> Result<Response, HttpError> {
        let mut request = Request::parse(Method::GET, url)?;
        self.pipeline.send(ctx, &mut request).await
    }
}

impl Strategy {
    fn name(&self) -> &'static str {
        match self {
            Self::OperationLocation { .. } => "OperationLocation",
            Self::Location { .. } => "Location",
            Self::Body => "Body",
            Self::NoOp => "NoOp",
        }
    }
}

/// Absolute form of a URL header, resolved against the request URL
fn header_url(response: &Response, name: &str) -> Result<Option<String>, HttpError> {
    let Some(value) = response.header(name).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let url = response
        .request_url()
        .join(value)
        .map_err(|e| HttpError::InvalidUrl {
            url: value.to_owned(),
            reason: e.to_string(),
        })?;
    Ok(Some(url.to_string()))
}

fn has_body(response: &Response) -> bool {
    response.status() != StatusCode::NO_CONTENT
        && response
            .bytes()
            .is_some_and(|b| b.iter().any(|c| !c.is_ascii_whitespace()))
}

fn status_monitor(response: &Response) -> Result<Option<StatusMonitor>, HttpError> {
    if !has_body(response) {
        return Ok(None);
    }
    response.json().map(Some)
}

/// `properties.provisioningState` of a resource body, when there is one
fn provisioning_state(response: &Response) -> Option<OperationStatus> {
    if !has_body(response) {
        return None;
    }
    let body: ResourceBody = response.json().ok()?;
    body.properties?
        .provisioning_state
        .as_deref()
        .map(OperationStatus::parse)
}

fn decode<T: DeserializeOwned + Default>(response: &Response) -> Result<T, PollerError> {
    if !has_body(response) {
        return Ok(T::default());
    }
    Ok(response.json()?)
}
