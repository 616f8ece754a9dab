use async_trait::async_trait;

use crate::context::Context;
use crate::error::HttpError;
use crate::policy::{Next, Policy};
use crate::request::Request;
use crate::response::Response;

/// Applies the per-call headers and query parameters from the [`Context`].
///
/// Both replace any value of the same name already on the request.
pub struct HeadersPolicy;

#[async_trait]
impl Policy for HeadersPolicy {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: Next<'_>,
    ) -> Result<Response, HttpError> {
        for name in ctx.headers().keys() {
            request.headers_mut().remove(name);
        }
        for (name, value) in ctx.headers() {
            request.headers_mut().append(name, value.clone());
        }

        let overrides = ctx.query_params();
        if !overrides.is_empty() {
            let url = request.url_mut();
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| !overrides.iter().any(|(name, _)| name == k))
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            url.query_pairs_mut()
                .clear()
                .extend_pairs(kept)
                .extend_pairs(overrides.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }

        next.run(ctx, request).await
    }
}
