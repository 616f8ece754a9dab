//! Bearer and registry challenge flows over the hyper transport against a
//! local mock server.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use httpmock::prelude::*;
use restkit_auth::{
    AccessToken, BearerChallengeHandler, BearerTokenOptions, BearerTokenPolicy,
    RegistryChallengeOptions, RegistryChallengePolicy, TokenCredential, TokenRequestOptions,
};
use restkit_http::{
    BoxError, Context, HttpError, Pipeline, Request, RetryOptions, TransportConfig, async_trait,
};
use time::OffsetDateTime;

/// Issues `<scopes>` as the token value and counts acquisitions
#[derive(Default)]
struct ScopeEchoCredential {
    calls: AtomicUsize,
}

#[async_trait]
impl TokenCredential for ScopeEchoCredential {
    async fn get_token(&self, options: &TokenRequestOptions) -> Result<AccessToken, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(AccessToken::new(
            options.scopes.join(" "),
            OffsetDateTime::now_utc() + time::Duration::hours(1),
        ))
    }
}

fn pipeline(auth: Arc<dyn restkit_http::Policy>) -> Pipeline {
    Pipeline::builder()
        .retry(RetryOptions::fast())
        .per_retry(auth)
        .transport_config(TransportConfig::for_testing())
        .build()
        .unwrap()
}

fn bearer(credential: &Arc<ScopeEchoCredential>, allow_http: bool) -> BearerTokenPolicy {
    BearerTokenPolicy::new(
        Some(credential.clone()),
        vec!["https://default.example.com/.default".to_owned()],
        BearerTokenOptions {
            handler: Some(Arc::new(BearerChallengeHandler::new())),
            insecure_allow_credential_with_http: allow_http,
        },
    )
}

#[tokio::test]
async fn challenge_renegotiates_scope() {
    let server = MockServer::start();
    let challenged = server.mock(|when, then| {
        when.method(GET)
            .path("/secrets/db")
            .header("authorization", "Bearer https://default.example.com/.default");
        then.status(401).header(
            "www-authenticate",
            r#"Bearer authorization="https://login.example.com/tenant-b", scope="https://vault.example.com/.default""#,
        );
    });
    let accepted = server.mock(|when, then| {
        when.method(GET)
            .path("/secrets/db")
            .header("authorization", "Bearer https://vault.example.com/.default");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"value":"s3cr3t"}"#);
    });

    let credential = Arc::new(ScopeEchoCredential::default());
    let pl = pipeline(Arc::new(bearer(&credential, true)));
    let mut req = Request::parse(http::Method::GET, &server.url("/secrets/db")).unwrap();
    let resp = pl.send(&Context::new(), &mut req).await.unwrap();

    assert_eq!(resp.status(), http::StatusCode::OK);
    assert_eq!(resp.text().unwrap(), r#"{"value":"s3cr3t"}"#);
    challenged.assert_calls(1);
    accepted.assert_calls(1);
    assert_eq!(credential.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn plain_http_never_sees_a_token() {
    let server = MockServer::start();
    let any = server.mock(|when, then| {
        when.path("/");
        then.status(200);
    });

    let credential = Arc::new(ScopeEchoCredential::default());
    let pl = pipeline(Arc::new(bearer(&credential, false)));
    let mut req = Request::parse(http::Method::GET, &server.url("/")).unwrap();
    let err = pl.send(&Context::new(), &mut req).await.unwrap_err();

    assert!(matches!(err, HttpError::NonRetriable(_)));
    any.assert_calls(0);
    assert_eq!(credential.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn registry_probe_then_upload() {
    let server = MockServer::start();
    let probe = server.mock(|when, then| {
        when.method(PUT)
            .path("/v2/app/blobs/uploads/1")
            .header_missing("authorization");
        then.status(401).header(
            "www-authenticate",
            r#"Bearer realm="https://registry.example.com/oauth2/token",service="registry.example.com",scope="repository:app:push""#,
        );
    });
    let upload = server.mock(|when, then| {
        when.method(PUT)
            .path("/v2/app/blobs/uploads/1")
            .header("authorization", "Bearer repository:app:push")
            .body("layer-bytes");
        then.status(201);
    });

    let credential = Arc::new(ScopeEchoCredential::default());
    let policy = RegistryChallengePolicy::new(
        credential.clone(),
        RegistryChallengeOptions {
            insecure_allow_credential_with_http: true,
        },
    );
    let pl = pipeline(Arc::new(policy));

    let mut req = Request::parse(http::Method::PUT, &server.url("/v2/app/blobs/uploads/1")).unwrap();
    req.set_body(
        restkit_http::BytesBody::new("layer-bytes"),
        "application/octet-stream",
    )
    .unwrap();
    let resp = pl.send(&Context::new(), &mut req).await.unwrap();

    assert_eq!(resp.status(), http::StatusCode::CREATED);
    probe.assert_calls(1);
    upload.assert_calls(1);
    assert_eq!(credential.calls.load(Ordering::SeqCst), 1);
}
