use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use http::header::{AUTHORIZATION, HeaderValue};
use parking_lot::RwLock;
use restkit_http::{
    BoxError, Context, DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT, HttpError, Next, Policy, Request,
    Response,
};
use url::Url;
use zeroize::Zeroizing;

use crate::challenge::{Challenge, cae_claims, challenges_from_headers};
use crate::credential::{AccessToken, TokenCredential, TokenRequestOptions};
use crate::error::AuthError;
use crate::temporal::{Acquired, TemporalResource};

/// Hooks that let a client choose token parameters per request or per challenge
#[async_trait]
pub trait AuthorizationHandler: Send + Sync {
    /// Token options for an outgoing request; `None` keeps the policy's scopes.
    ///
    /// # Errors
    /// Any failure aborts the request with a non-retriable error.
    async fn on_request(&self, _request: &Request) -> Result<Option<TokenRequestOptions>, BoxError> {
        Ok(None)
    }

    /// Token options answering a 401 that is not a CAE challenge.
    ///
    /// `None` hands the 401 back to the caller.
    ///
    /// # Errors
    /// Any failure aborts the request with a non-retriable error.
    async fn on_challenge(
        &self,
        _request: &Request,
        _response: &Response,
    ) -> Result<Option<TokenRequestOptions>, BoxError> {
        Ok(None)
    }
}

/// [`BearerTokenPolicy`] configuration
#[derive(Clone, Default)]
pub struct BearerTokenOptions {
    pub handler: Option<Arc<dyn AuthorizationHandler>>,
    /// Send tokens over plain HTTP (local emulators only)
    pub insecure_allow_credential_with_http: bool,
}

/// Authorizes requests with `Authorization: Bearer <token>`.
///
/// Tokens come from a [`TemporalResource`], so concurrent requests share one
/// acquisition and a fresh token is reused until its refresh point. A 401 expires
/// the cached token; if the response carries a challenge the policy
/// re-authenticates once and sends the request again:
/// - a CAE challenge (`error="insufficient_claims"` with `claims`) is answered
///   with a token for those claims
/// - any other challenge goes to [`AuthorizationHandler::on_challenge`]
///
/// Place it among the per-retry policies so every attempt is authorized.
pub struct BearerTokenPolicy {
    token: Option<TemporalResource<AccessToken, TokenRequestOptions>>,
    scopes: Vec<String>,
    options: BearerTokenOptions,
}

impl BearerTokenPolicy {
    /// With `credential` set to `None` requests pass through unauthenticated.
    #[must_use]
    pub fn new(
        credential: Option<Arc<dyn TokenCredential>>,
        scopes: Vec<String>,
        options: BearerTokenOptions,
    ) -> Self {
        Self {
            token: credential.map(token_resource),
            scopes,
            options,
        }
    }

    fn default_options(&self) -> TokenRequestOptions {
        TokenRequestOptions::for_scopes(self.scopes.iter().cloned())
    }
}

/// Get a token for `options` and set it on `request`
///
/// # Errors
/// Cancellation, and non-retriable credential failures.
pub async fn authorize(
    ctx: &Context,
    token: &TemporalResource<AccessToken, TokenRequestOptions>,
    request: &mut Request,
    options: TokenRequestOptions,
) -> Result<(), HttpError> {
    let access = ctx
        .run(token.get(options))
        .await?
        .map_err(|e| AuthError::Credential(Box::new(e)))?;
    set_bearer(request, &access)
}

/// Expire the cached token, authorize with `options` and send again
///
/// # Errors
/// Body rewind and authorization failures, and whatever the rest of the chain returns.
pub async fn reauthorize_and_send(
    ctx: &Context,
    token: &TemporalResource<AccessToken, TokenRequestOptions>,
    request: &mut Request,
    next: Next<'_>,
    previous: Response,
    options: TokenRequestOptions,
) -> Result<Response, HttpError> {
    token.expire();
    previous.drain(DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT).await;
    request.rewind_body()?;
    authorize(ctx, token, request, options).await?;
    next.run(ctx, request).await
}

/// Token cache backed by `credential`
#[must_use]
pub fn token_resource(
    credential: Arc<dyn TokenCredential>,
) -> TemporalResource<AccessToken, TokenRequestOptions> {
    TemporalResource::new(move |options: TokenRequestOptions| {
        let credential = Arc::clone(&credential);
        async move {
            tracing::debug!(scopes = ?options.scopes, cae = options.enable_cae, "acquiring access token");
            let token = credential.get_token(&options).await?;
            let (expires_on, refresh_on) = (token.expires_on, token.refresh_on);
            Ok(Acquired::new(token, expires_on).with_refresh_on(refresh_on))
        }
    })
}

/// Set the `Authorization` header, marked sensitive so it never reaches logs
///
/// # Errors
/// [`HttpError::InvalidHeaderValue`] when the token is not a valid header value.
pub fn set_bearer(request: &mut Request, token: &AccessToken) -> Result<(), HttpError> {
    let value = Zeroizing::new(format!("Bearer {}", token.token.expose()));
    let mut header = HeaderValue::from_str(&value)?;
    header.set_sensitive(true);
    request.headers_mut().insert(AUTHORIZATION, header);
    Ok(())
}

/// Reject plain-HTTP URLs unless explicitly allowed
///
/// # Errors
/// [`AuthError::HttpsRequired`]
pub fn require_https(url: &Url, allow_http: bool) -> Result<(), AuthError> {
    if url.scheme() == "https" || allow_http {
        Ok(())
    } else {
        Err(AuthError::HttpsRequired)
    }
}

#[async_trait]
impl Policy for BearerTokenPolicy {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: Next<'_>,
    ) -> Result<Response, HttpError> {
        let Some(token) = &self.token else {
            return next.run(ctx, request).await;
        };
        require_https(
            request.url(),
            self.options.insecure_allow_credential_with_http,
        )?;

        let handler = self.options.handler.as_deref();
        let base = match handler {
            Some(h) => h
                .on_request(request)
                .await
                .map_err(AuthError::Handler)?
                .unwrap_or_else(|| self.default_options()),
            None => self.default_options(),
        };
        authorize(ctx, token, request, base.clone()).await?;
        let response = next.run(ctx, request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        token.expire();
        let challenges = challenges_from_headers(response.headers());
        if challenges.is_empty() {
            return Ok(response);
        }

        if let Some(claims) = cae_claims(&challenges)? {
            tracing::debug!("answering CAE claims challenge");
            let options = with_claims(base, claims);
            return reauthorize_and_send(ctx, token, request, next, response, options).await;
        }

        let Some(handler) = handler else {
            return Ok(response);
        };
        let Some(options) = handler
            .on_challenge(request, &response)
            .await
            .map_err(AuthError::Handler)?
        else {
            return Ok(response);
        };
        tracing::debug!(scopes = ?options.scopes, "answering authentication challenge");
        let response =
            reauthorize_and_send(ctx, token, request, next, response, options.clone()).await?;

        // The re-negotiated token may itself be challenged for claims, once
        if response.status() == StatusCode::UNAUTHORIZED
            && let Some(claims) = cae_claims(&challenges_from_headers(response.headers()))?
        {
            tracing::debug!("answering CAE claims challenge after re-negotiation");
            let options = with_claims(options, claims);
            return reauthorize_and_send(ctx, token, request, next, response, options).await;
        }
        Ok(response)
    }
}

fn with_claims(options: TokenRequestOptions, claims: String) -> TokenRequestOptions {
    TokenRequestOptions {
        claims: Some(claims),
        enable_cae: true,
        ..options
    }
}

/// Built-in [`AuthorizationHandler`] that re-negotiates scope and tenant.
///
/// Reads `scope` (space separated) or `resource` (mapped to
/// `<resource>/.default`) from a `Bearer` challenge, and the tenant from a
/// `tenant` parameter or the last path segment of `authorization` /
/// `authorization_uri`. What it learns is reused for later requests.
#[derive(Default)]
pub struct BearerChallengeHandler {
    learned: RwLock<Option<TokenRequestOptions>>,
}

impl BearerChallengeHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token options described by `challenges`.
    ///
    /// # Errors
    /// [`AuthError::InvalidChallenge`] when there is no `Bearer` challenge or it
    /// names neither a scope nor a resource.
    pub fn options_from_challenges(
        challenges: &[Challenge],
    ) -> Result<TokenRequestOptions, AuthError> {
        let bearer = challenges
            .iter()
            .find(|c| c.is_bearer())
            .ok_or_else(|| AuthError::InvalidChallenge("no Bearer challenge".to_owned()))?;

        let scopes: Vec<String> = match (bearer.param("scope"), bearer.param("resource")) {
            (Some(scope), _) => scope.split_whitespace().map(str::to_owned).collect(),
            (None, Some(resource)) => {
                vec![format!("{}/.default", resource.trim_end_matches('/'))]
            }
            (None, None) => Vec::new(),
        };
        if scopes.is_empty() {
            return Err(AuthError::InvalidChallenge(
                "challenge names neither scope nor resource".to_owned(),
            ));
        }

        let tenant_id = bearer.param("tenant").map(str::to_owned).or_else(|| {
            bearer
                .param("authorization")
                .or_else(|| bearer.param("authorization_uri"))
                .and_then(tenant_from_authority)
        });

        Ok(TokenRequestOptions {
            scopes,
            tenant_id,
            ..TokenRequestOptions::default()
        })
    }
}

fn tenant_from_authority(authority: &str) -> Option<String> {
    let url = Url::parse(authority).ok()?;
    url.path_segments()?
        .rev()
        .find(|s| !s.is_empty())
        .map(str::to_owned)
}

#[async_trait]
impl AuthorizationHandler for BearerChallengeHandler {
    async fn on_request(&self, _request: &Request) -> Result<Option<TokenRequestOptions>, BoxError> {
        Ok(self.learned.read().clone())
    }

    async fn on_challenge(
        &self,
        _request: &Request,
        response: &Response,
    ) -> Result<Option<TokenRequestOptions>, BoxError> {
        let options = Self::options_from_challenges(&challenges_from_headers(response.headers()))?;
        *self.learned.write() = Some(options.clone());
        Ok(Some(options))
    }
}
