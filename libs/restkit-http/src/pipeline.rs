use std::sync::Arc;

use crate::config::{LogOptions, RetryOptions, TelemetryOptions, TransportConfig};
use crate::context::Context;
use crate::error::HttpError;
use crate::policies::{
    BodyDownloadPolicy, HeadersPolicy, LoggingPolicy, RetryPolicy, TelemetryPolicy,
};
use crate::policy::{Next, Policy};
use crate::request::Request;
use crate::response::Response;
use crate::transport::{HyperTransport, Transport, TransportPolicy};
use crate::unmarshal::Unmarshaler;

/// Immutable, shareable chain of policies ending in a transport.
///
/// Cloning is cheap; one pipeline serves any number of concurrent calls.
#[derive(Clone)]
pub struct Pipeline {
    chain: Arc<[Arc<dyn Policy>]>,
}

impl Pipeline {
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Chain exactly `policies`, in order, with nothing added.
    ///
    /// The last policy must answer without calling `next`, otherwise sends fail
    /// with [`HttpError::NoMorePolicies`].
    #[must_use]
    pub fn from_policies(policies: Vec<Arc<dyn Policy>>) -> Self {
        Self {
            chain: policies.into(),
        }
    }

    /// Run `request` through the chain.
    ///
    /// Every HTTP status comes back as `Ok`; use
    /// [`Response::error_for_status`] to turn failures into errors. The request
    /// body is closed once the chain returns.
    ///
    /// # Errors
    /// Transport failures, cancellation, deadline expiry and policy errors.
    pub async fn send(&self, ctx: &Context, request: &mut Request) -> Result<Response, HttpError> {
        let outcome = Next::new(&self.chain).run(ctx, request).await;
        if let Err(e) = request.close_body() {
            tracing::debug!(error = %e, "failed to close request body");
        }
        outcome
    }

    /// Number of policies, the transport included
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

/// Assembles the standard chain:
///
/// ```text
/// telemetry → per-call… → retry → per-retry… → logging → headers → body download → transport
/// ```
///
/// Per-call policies run once per `send`; per-retry policies run on every attempt.
#[derive(Default)]
#[must_use]
pub struct PipelineBuilder {
    component: Option<(String, String)>,
    per_call: Vec<Arc<dyn Policy>>,
    per_retry: Vec<Arc<dyn Policy>>,
    retry: RetryOptions,
    telemetry: TelemetryOptions,
    logging: LogOptions,
    unmarshaler: Option<Arc<dyn Unmarshaler>>,
    transport: Option<Arc<dyn Transport>>,
    transport_config: TransportConfig,
}

impl PipelineBuilder {
    /// Name and version of the client library, reported in `User-Agent`
    pub fn component(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.component = Some((name.into(), version.into()));
        self
    }

    pub fn per_call(mut self, policy: Arc<dyn Policy>) -> Self {
        self.per_call.push(policy);
        self
    }

    pub fn per_retry(mut self, policy: Arc<dyn Policy>) -> Self {
        self.per_retry.push(policy);
        self
    }

    pub fn retry(mut self, options: RetryOptions) -> Self {
        self.retry = options;
        self
    }

    pub fn telemetry(mut self, options: TelemetryOptions) -> Self {
        self.telemetry = options;
        self
    }

    pub fn logging(mut self, options: LogOptions) -> Self {
        self.logging = options;
        self
    }

    /// Default unmarshaler for responses; a per-call one on the [`Context`] wins
    pub fn unmarshaler(mut self, unmarshaler: Arc<dyn Unmarshaler>) -> Self {
        self.unmarshaler = Some(unmarshaler);
        self
    }

    /// Use `transport` instead of building a [`HyperTransport`]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Configuration for the default [`HyperTransport`]; ignored with a custom transport
    pub fn transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    /// # Errors
    /// Returns [`HttpError::InvalidConfig`] for a bad application id and
    /// [`HttpError::Tls`] if the default transport cannot be built.
    pub fn build(self) -> Result<Pipeline, HttpError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HyperTransport::new(&self.transport_config)?),
        };

        let mut chain: Vec<Arc<dyn Policy>> =
            Vec::with_capacity(self.per_call.len() + self.per_retry.len() + 6);
        if !self.telemetry.disabled {
            let component = self
                .component
                .as_ref()
                .map(|(name, version)| (name.as_str(), version.as_str()));
            chain.push(Arc::new(TelemetryPolicy::try_new(component, &self.telemetry)?));
        }
        chain.extend(self.per_call);
        chain.push(Arc::new(RetryPolicy::new(self.retry)));
        chain.extend(self.per_retry);
        chain.push(Arc::new(LoggingPolicy::new(&self.logging)));
        chain.push(Arc::new(HeadersPolicy));
        chain.push(Arc::new(BodyDownloadPolicy::new(self.unmarshaler)));
        chain.push(Arc::new(TransportPolicy(transport)));

        Ok(Pipeline::from_policies(chain))
    }
}
