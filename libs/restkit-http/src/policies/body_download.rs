use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::HttpError;
use crate::policy::{Next, Policy};
use crate::request::Request;
use crate::response::Response;
use crate::unmarshal::Unmarshaler;

/// Buffers response bodies and attaches the unmarshaler used by
/// [`Response::json`].
///
/// Skipped per call with [`Context::with_skip_body_download`]. Sits inside the
/// retry loop, so a failed download is retried like any transport error.
pub struct BodyDownloadPolicy {
    unmarshaler: Option<Arc<dyn Unmarshaler>>,
}

impl BodyDownloadPolicy {
    #[must_use]
    pub fn new(unmarshaler: Option<Arc<dyn Unmarshaler>>) -> Self {
        Self { unmarshaler }
    }
}

#[async_trait]
impl Policy for BodyDownloadPolicy {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: Next<'_>,
    ) -> Result<Response, HttpError> {
        let mut response = next.run(ctx, request).await?;

        if let Some(unmarshaler) = ctx.unmarshaler().or(self.unmarshaler.as_ref()) {
            response.set_unmarshaler(Arc::clone(unmarshaler));
        }
        if ctx.skips_body_download() {
            return Ok(response);
        }

        ctx.run(response.buffer())
            .await?
            .map_err(|e| HttpError::BodyDownload(Box::new(e)))?;
        Ok(response)
    }
}
