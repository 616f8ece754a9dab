use std::sync::Arc;

use async_trait::async_trait;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use parking_lot::RwLock;
use restkit_http::{
    Context, DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT, HttpError, Next, Policy, Request, Response,
};

use crate::bearer::{authorize, reauthorize_and_send, require_https, token_resource};
use crate::challenge::{Challenge, challenges_from_headers};
use crate::credential::{AccessToken, TokenCredential, TokenRequestOptions};
use crate::error::AuthError;
use crate::temporal::TemporalResource;

/// [`RegistryChallengePolicy`] configuration
#[derive(Debug, Clone, Default)]
pub struct RegistryChallengeOptions {
    /// Send tokens over plain HTTP (local registries only)
    pub insecure_allow_credential_with_http: bool,
}

/// Authorization for registry-style services that challenge every
/// unauthenticated request.
///
/// The first request of a session is preceded by a probe: the same method, URL
/// and headers with no body. The probe's 401 carries
/// `Bearer realm="...",service="...",scope="..."`; the policy asks the credential for
/// a token with that scope (`realm` and `service` travel in
/// [`TokenRequestOptions::challenge_parameters`]) and sends the real request.
/// Later requests reuse the token. A later 401 with a new challenge triggers
/// one re-acquisition and re-send.
pub struct RegistryChallengePolicy {
    token: TemporalResource<AccessToken, TokenRequestOptions>,
    challenge: RwLock<Option<TokenRequestOptions>>,
    options: RegistryChallengeOptions,
}

impl RegistryChallengePolicy {
    #[must_use]
    pub fn new(credential: Arc<dyn TokenCredential>, options: RegistryChallengeOptions) -> Self {
        Self {
            token: token_resource(credential),
            challenge: RwLock::new(None),
            options,
        }
    }

    /// Token options described by a registry challenge.
    ///
    /// # Errors
    /// [`AuthError::InvalidChallenge`] when there is no `Bearer` challenge or it
    /// lacks `realm` or `service`.
    pub fn options_from_challenges(
        challenges: &[Challenge],
    ) -> Result<TokenRequestOptions, AuthError> {
        let bearer = challenges
            .iter()
            .find(|c| c.is_bearer())
            .ok_or_else(|| AuthError::InvalidChallenge("no Bearer challenge".to_owned()))?;

        let mut options = TokenRequestOptions::default();
        for name in ["realm", "service"] {
            let value = bearer
                .param(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| AuthError::InvalidChallenge(format!("challenge has no {name}")))?;
            options
                .challenge_parameters
                .insert(name.to_owned(), value.to_owned());
        }
        if let Some(scope) = bearer.param("scope") {
            options.scopes = scope.split_whitespace().map(str::to_owned).collect();
        }
        Ok(options)
    }

    /// Remember the challenge of a 401, if `response` is one
    fn learn(&self, response: &Response) -> Result<Option<TokenRequestOptions>, AuthError> {
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let challenges = challenges_from_headers(response.headers());
        if challenges.is_empty() {
            return Ok(None);
        }
        let options = Self::options_from_challenges(&challenges)?;
        tracing::debug!(scopes = ?options.scopes, "registry challenge received");
        *self.challenge.write() = Some(options.clone());
        Ok(Some(options))
    }
}

#[async_trait]
impl Policy for RegistryChallengePolicy {
    async fn send(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: Next<'_>,
    ) -> Result<Response, HttpError> {
        require_https(
            request.url(),
            self.options.insecure_allow_credential_with_http,
        )?;

        let known = self.challenge.read().clone();
        let options = match known {
            Some(options) => options,
            None => {
                let had_body = request.has_body();
                let body = request.take_body();
                let body_headers = take_body_headers(request.headers_mut());
                let probe = next.run(ctx, request).await;
                request.headers_mut().extend(body_headers);
                request.restore_body(body);
                let probe = probe?;

                match self.learn(&probe)? {
                    Some(options) => {
                        probe.drain(DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT).await;
                        options
                    }
                    // Without a body the probe was the request itself
                    None if !had_body => return Ok(probe),
                    None => {
                        probe.drain(DEFAULT_RETRY_RESPONSE_DRAIN_LIMIT).await;
                        return next.run(ctx, request).await;
                    }
                }
            }
        };

        authorize(ctx, &self.token, request, options).await?;
        let response = next.run(ctx, request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        match self.learn(&response)? {
            Some(options) => {
                reauthorize_and_send(ctx, &self.token, request, next, response, options).await
            }
            None => {
                self.token.expire();
                Ok(response)
            }
        }
    }
}

/// Remove the headers that describe a request body
fn take_body_headers(headers: &mut HeaderMap) -> HeaderMap {
    let mut taken = HeaderMap::new();
    for name in [CONTENT_TYPE, CONTENT_LENGTH] {
        if let Some(value) = headers.remove(&name) {
            taken.insert(name, value);
        }
    }
    taken
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use restkit_http::BoxError;
    use restkit_http::mock::{MockResponse, MockTransport};
    use restkit_http::{Pipeline, TransportPolicy};
    use time::OffsetDateTime;

    const CHALLENGE: &str = r#"Bearer realm="https://registry.example.com/oauth2/token",service="registry.example.com",scope="repository:app:pull,push""#;

    #[derive(Default)]
    struct ExchangeCredential {
        seen: Mutex<Vec<TokenRequestOptions>>,
    }

    #[async_trait]
    impl TokenCredential for ExchangeCredential {
        async fn get_token(&self, options: &TokenRequestOptions) -> Result<AccessToken, BoxError> {
            let mut seen = self.seen.lock();
            seen.push(options.clone());
            Ok(AccessToken::new(
                format!("acr-{}:{}", seen.len(), options.scopes.join(" ")),
                OffsetDateTime::now_utc() + time::Duration::hours(1),
            ))
        }
    }

    fn setup() -> (Pipeline, Arc<MockTransport>, Arc<ExchangeCredential>) {
        let credential = Arc::new(ExchangeCredential::default());
        let transport = Arc::new(MockTransport::new());
        let policy = RegistryChallengePolicy::new(
            credential.clone(),
            RegistryChallengeOptions::default(),
        );
        let pipeline = Pipeline::from_policies(vec![
            Arc::new(policy),
            Arc::new(TransportPolicy(transport.clone())),
        ]);
        (pipeline, transport, credential)
    }

    fn auth_header(transport: &MockTransport, index: usize) -> Option<String> {
        transport.requests()[index]
            .headers
            .get(http::header::AUTHORIZATION)
            .map(|v| v.to_str().unwrap().to_owned())
    }

    #[tokio::test]
    async fn test_first_request_is_probed() {
        let (pl, transport, credential) = setup();
        transport.append_response(
            MockResponse::new(StatusCode::UNAUTHORIZED).with_header("www-authenticate", CHALLENGE),
        );
        transport.append_response(MockResponse::new(StatusCode::CREATED));

        let mut req = Request::parse(
            http::Method::PUT,
            "https://registry.example.com/v2/app/blobs/uploads/1",
        )
        .unwrap();
        req.set_body(restkit_http::BytesBody::new("layer"), "application/octet-stream")
            .unwrap();
        let resp = pl.send(&Context::new(), &mut req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::CREATED);
        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method, http::Method::PUT);
        assert!(requests[0].body.is_empty());
        assert!(!requests[0].headers.contains_key(CONTENT_TYPE));
        assert!(!requests[0].headers.contains_key(CONTENT_LENGTH));
        assert_eq!(auth_header(&transport, 0), None);
        assert_eq!(requests[1].body, "layer");
        assert_eq!(requests[1].headers[CONTENT_TYPE], "application/octet-stream");
        assert_eq!(
            auth_header(&transport, 1).as_deref(),
            Some("Bearer acr-1:repository:app:pull,push")
        );

        let seen = credential.seen.lock();
        assert_eq!(
            seen[0].challenge_parameters.get("service").map(String::as_str),
            Some("registry.example.com")
        );
        assert_eq!(
            seen[0].challenge_parameters.get("realm").map(String::as_str),
            Some("https://registry.example.com/oauth2/token")
        );
    }

    #[tokio::test]
    async fn test_token_reused_after_first_request() {
        let (pl, transport, credential) = setup();
        transport.append_response(
            MockResponse::new(StatusCode::UNAUTHORIZED).with_header("www-authenticate", CHALLENGE),
        );
        transport.set_response(MockResponse::new(StatusCode::OK));

        for _ in 0..3 {
            let mut req =
                Request::parse(http::Method::GET, "https://registry.example.com/v2/_catalog")
                    .unwrap();
            pl.send(&Context::new(), &mut req).await.unwrap();
        }
        // one probe, then three authorized requests
        assert_eq!(transport.request_count(), 4);
        assert_eq!(credential.seen.lock().len(), 1);
        assert!(auth_header(&transport, 3).is_some());
    }

    #[tokio::test]
    async fn test_unchallenged_probe_is_the_response() {
        let (pl, transport, credential) = setup();
        transport.set_response(MockResponse::new(StatusCode::OK));
        let mut req = Request::parse(http::Method::GET, "https://registry.example.com/v2/").unwrap();
        let resp = pl.send(&Context::new(), &mut req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.request_count(), 1);
        assert!(credential.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_later_challenge_reacquires_once() {
        let (pl, transport, credential) = setup();
        transport.append_response(
            MockResponse::new(StatusCode::UNAUTHORIZED).with_header("www-authenticate", CHALLENGE),
        );
        transport.append_response(MockResponse::new(StatusCode::OK));
        let mut req = Request::parse(http::Method::GET, "https://registry.example.com/v2/a").unwrap();
        pl.send(&Context::new(), &mut req).await.unwrap();

        transport.append_response(MockResponse::new(StatusCode::UNAUTHORIZED).with_header(
            "www-authenticate",
            r#"Bearer realm="https://registry.example.com/oauth2/token",service="registry.example.com",scope="repository:other:pull""#,
        ));
        transport.append_response(MockResponse::new(StatusCode::OK));
        let mut req = Request::parse(http::Method::GET, "https://registry.example.com/v2/b").unwrap();
        let resp = pl.send(&Context::new(), &mut req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(transport.request_count(), 4);
        assert_eq!(
            auth_header(&transport, 3).as_deref(),
            Some("Bearer acr-2:repository:other:pull")
        );
        assert_eq!(credential.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_challenge_without_service_is_rejected() {
        let (pl, transport, _credential) = setup();
        transport.set_response(
            MockResponse::new(StatusCode::UNAUTHORIZED)
                .with_header("www-authenticate", r#"Bearer realm="https://x/token""#),
        );
        let mut req = Request::parse(http::Method::GET, "https://registry.example.com/v2/").unwrap();
        let err = pl.send(&Context::new(), &mut req).await.unwrap_err();
        assert!(!err.is_retriable());
        assert_eq!(
            err.to_string(),
            "invalid authentication challenge: challenge has no service"
        );
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_plain_http_rejected() {
        let (pl, transport, _credential) = setup();
        let mut req = Request::parse(http::Method::GET, "http://registry.example.com/v2/").unwrap();
        let err = pl.send(&Context::new(), &mut req).await.unwrap_err();
        assert!(!err.is_retriable());
        assert_eq!(transport.request_count(), 0);
    }
}
