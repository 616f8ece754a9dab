//! Lazy, restartable iteration over paginated listings
//!
//! A [`Pager`] owns a [`Pipeline`] and a [`PagingHandler`] that knows how to
//! build the request for the next page and how to parse a page out of a
//! response. Callers either drive it page by page with
//! [`next_page`](Pager::next_page) or turn it into a `Stream`.
//!
//! # Example
//!
//! ```rust,ignore
//! use futures_util::StreamExt;
//! use restkit_sdk::pager::{Pager, PagingHandler};
//!
//! let handler = PagingHandler::new(
//!     |page: &WidgetPage| page.next_link.is_some(),
//!     |_ctx, page: Option<&WidgetPage>| {
//!         let url = page
//!             .and_then(|p| p.next_link.clone())
//!             .unwrap_or_else(|| format!("{base}/widgets"));
//!         Request::parse(http::Method::GET, &url)
//!     },
//!     |response| response.json::<WidgetPage>(),
//! );
//!
//! let mut pages = Pager::new(pipeline, handler).into_stream(Context::new());
//! while let Some(page) = pages.next().await {
//!     for widget in page?.value {
//!         println!("{}", widget.name);
//!     }
//! }
//! ```

use futures_core::Stream;
use restkit_http::{Context, HttpError, Pipeline, Request, Response};

type MoreFn<P> = dyn Fn(&P) -> bool + Send + Sync;
type FetcherFn<P> = dyn Fn(&Context, Option<&P>) -> Result<Request, HttpError> + Send + Sync;
type ResponderFn<P> = dyn Fn(Response) -> Result<P, HttpError> + Send + Sync;

/// Error type for pagination operations
#[derive(Debug, thiserror::Error)]
pub enum PagerError {
    /// `next_page` was called after the last page was handed out
    #[error("no more pages")]
    NoMorePages,

    #[error(transparent)]
    Http(#[from] HttpError),
}

/// Callbacks that adapt a [`Pager`] to one listing operation
pub struct PagingHandler<P> {
    more: Box<MoreFn<P>>,
    fetcher: Box<FetcherFn<P>>,
    responder: Box<ResponderFn<P>>,
}

impl<P> PagingHandler<P> {
    /// - `more` tells whether another page follows `page`
    /// - `fetcher` builds the request for the page after `page`, or for the
    ///   first page when it gets `None`
    /// - `responder` parses a successful, downloaded response into a page
    pub fn new<M, F, R>(more: M, fetcher: F, responder: R) -> Self
    where
        M: Fn(&P) -> bool + Send + Sync + 'static,
        F: Fn(&Context, Option<&P>) -> Result<Request, HttpError> + Send + Sync + 'static,
        R: Fn(Response) -> Result<P, HttpError> + Send + Sync + 'static,
    {
        Self {
            more: Box::new(more),
            fetcher: Box::new(fetcher),
            responder: Box::new(responder),
        }
    }
}

/// Cursor over a paginated listing.
///
/// Nothing is fetched until the first [`next_page`](Self::next_page). A failed
/// fetch leaves the cursor where it was, so the same page can be requested
/// again.
pub struct Pager<P> {
    pipeline: Pipeline,
    handler: PagingHandler<P>,
    current: Option<P>,
    seeded: bool,
}

impl<P: Clone> Pager<P> {
    #[must_use]
    pub fn new(pipeline: Pipeline, handler: PagingHandler<P>) -> Self {
        Self {
            pipeline,
            handler,
            current: None,
            seeded: false,
        }
    }

    /// Pager whose first page is already known (e.g. returned by a create
    /// call). The first [`next_page`](Self::next_page) hands out `page` without
    /// any HTTP.
    #[must_use]
    pub fn with_first_page(pipeline: Pipeline, handler: PagingHandler<P>, page: P) -> Self {
        Self {
            pipeline,
            handler,
            current: Some(page),
            seeded: true,
        }
    }

    /// Whether another page can be fetched
    #[must_use]
    pub fn more(&self) -> bool {
        match &self.current {
            None => true,
            Some(_) if self.seeded => true,
            Some(page) => (self.handler.more)(page),
        }
    }

    /// Fetch the next page.
    ///
    /// # Errors
    /// - [`PagerError::NoMorePages`] once [`more`](Self::more) is false
    /// - [`PagerError::Http`] for pipeline failures, non-2xx responses (as
    ///   [`HttpError::Response`]) and errors from the handler callbacks
    pub async fn next_page(&mut self, ctx: &Context) -> Result<P, PagerError> {
        if self.seeded
            && let Some(page) = &self.current
        {
            let page = page.clone();
            self.seeded = false;
            return Ok(page);
        }
        if !self.more() {
            return Err(PagerError::NoMorePages);
        }

        let mut request = (self.handler.fetcher)(ctx, self.current.as_ref())?;
        let mut response = self.pipeline.send(ctx, &mut request).await?;
        ctx.run(response.buffer()).await??;
        let response = response.error_for_status()?;
        let page = (self.handler.responder)(response)?;

        tracing::trace!(first = self.current.is_none(), "fetched page");
        self.current = Some(page.clone());
        Ok(page)
    }

    /// Stream of the remaining pages.
    ///
    /// The stream ends after the last page or after the first error.
    pub fn into_stream(self, ctx: Context) -> impl Stream<Item = Result<P, PagerError>> {
        futures_util::stream::unfold(Some((self, ctx)), |state| async move {
            let (mut pager, ctx) = state?;
            if !pager.more() {
                return None;
            }
            match pager.next_page(&ctx).await {
                Ok(page) => Some((Ok(page), Some((pager, ctx)))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }
}
