use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::HttpError;
use crate::request::Request;
use crate::response::Response;

/// One link of a [`Pipeline`](crate::Pipeline).
///
/// A policy may inspect or mutate the request, then either delegate with
/// `next.run(ctx, request)` (possibly several times, as the retry policy does)
/// or answer on its own.
///
/// ```ignore
/// struct RequestIdPolicy;
///
/// #[async_trait]
/// impl Policy for RequestIdPolicy {
///     async fn send(&self, ctx: &Context, request: &mut Request, next: Next<'_>)
///         -> Result<Response, HttpError>
///     {
///         request.set_header("x-request-id", &new_id())?;
///         next.run(ctx, request).await
///     }
/// }
/// ```
#[async_trait]
pub trait Policy: Send + Sync {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: Next<'_>,
    ) -> Result<Response, HttpError>;
}

/// The remainder of the chain after the current policy.
///
/// `Copy`, so a policy can run the rest of the chain more than once.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Policy>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Policy>]) -> Self {
        Self { chain }
    }

    /// Invoke the next policy.
    ///
    /// # Errors
    /// Returns [`HttpError::NoMorePolicies`] when the chain is exhausted, which
    /// happens only if it lacks a terminal transport.
    pub async fn run(self, ctx: &Context, request: &mut Request) -> Result<Response, HttpError> {
        let Some((policy, rest)) = self.chain.split_first() else {
            return Err(HttpError::NoMorePolicies);
        };
        policy.send(ctx, request, Next::new(rest)).await
    }

    /// Number of policies left, the transport included
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.chain.len()
    }
}
