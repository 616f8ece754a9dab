use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;
use url::Url;

use crate::config::{TransportConfig, TransportSecurity};
use crate::context::Context;
use crate::error::HttpError;
use crate::policy::{Next, Policy};
use crate::request::Request;
use crate::response::{Response, ResponseBody};
use crate::tls;

/// Sends a request over the wire. Always the last link of a pipeline.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and return the response with its body still streaming.
    ///
    /// Any HTTP status is a successful exchange; only connection-level failures
    /// are errors.
    async fn execute(&self, ctx: &Context, request: &mut Request) -> Result<Response, HttpError>;
}

/// Terminal policy wrapping a [`Transport`]; it never calls `next`.
///
/// Needed to end chains assembled with [`Pipeline::from_policies`](crate::Pipeline::from_policies).
pub struct TransportPolicy(pub Arc<dyn Transport>);

#[async_trait]
impl Policy for TransportPolicy {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        _next: Next<'_>,
    ) -> Result<Response, HttpError> {
        self.0.execute(ctx, request).await
    }
}

type WireService =
    BoxCloneSyncService<http::Request<Full<Bytes>>, http::Response<ResponseBody>, HttpError>;

/// Default transport: pooled hyper client over rustls.
///
/// Stack (outer to inner): `Timeout → Decompression → hyper client`. Response
/// bodies are decompressed (gzip, br, deflate) before any policy sees them.
#[derive(Clone)]
pub struct HyperTransport {
    service: WireService,
    max_body_size: usize,
    security: TransportSecurity,
}

impl HyperTransport {
    /// # Errors
    /// Returns [`HttpError::Tls`] when the configured root store is unusable.
    pub fn new(config: &TransportConfig) -> Result<Self, HttpError> {
        if config.security == TransportSecurity::AllowInsecureHttp {
            tracing::warn!(
                "insecure HTTP enabled (TransportSecurity::AllowInsecureHttp); \
                 use only for testing with mock servers"
            );
        }

        let https = tls::https_connector(config.tls_roots, config.security)?;

        let mut client_builder = Client::builder(TokioExecutor::new());
        // pool_idle_timeout needs a timer to take effect
        client_builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .http2_only(false);
        if let Some(idle) = config.pool_idle_timeout {
            client_builder.pool_idle_timeout(idle);
        }
        let hyper_client = client_builder.build::<_, Full<Bytes>>(https);

        let timeout = config.request_timeout;
        let service = ServiceBuilder::new()
            .timeout(timeout)
            .layer(DecompressionLayer::new())
            .service(hyper_client)
            .map_response(box_response_body)
            .map_err(move |e: tower::BoxError| map_tower_error(e, timeout));

        Ok(Self {
            service: BoxCloneSyncService::new(service),
            max_body_size: config.max_body_size,
            security: config.security,
        })
    }

    fn check_scheme(&self, url: &Url) -> Result<(), HttpError> {
        match url.scheme() {
            "https" => Ok(()),
            "http" if self.security == TransportSecurity::AllowInsecureHttp => Ok(()),
            "http" => Err(HttpError::InvalidScheme {
                scheme: "http".to_owned(),
                reason: "plain HTTP requires TransportSecurity::AllowInsecureHttp".to_owned(),
            }),
            other => Err(HttpError::InvalidScheme {
                scheme: other.to_owned(),
                reason: "only http and https are supported".to_owned(),
            }),
        }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn execute(&self, ctx: &Context, request: &mut Request) -> Result<Response, HttpError> {
        self.check_scheme(request.url())?;
        let wire = request.build_wire_request()?;

        let mut service = self.service.clone();
        let response = ctx
            .run(async move {
                service.ready().await?;
                service.call(wire).await
            })
            .await??;

        let (parts, body) = response.into_parts();
        Ok(Response::streaming(
            parts.status,
            parts.headers,
            body,
            request.method().clone(),
            request.url().clone(),
        )
        .with_max_body_size(self.max_body_size))
    }
}

fn map_tower_error(err: tower::BoxError, timeout: Duration) -> HttpError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return HttpError::TryTimeout(timeout);
    }
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(other) => HttpError::Transport(other),
    }
}

fn box_response_body<B>(response: http::Response<B>) -> http::Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    http::Response::from_parts(parts, body.map_err(Into::into).boxed())
}
