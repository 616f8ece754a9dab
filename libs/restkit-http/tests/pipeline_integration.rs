//! End-to-end tests of the default pipeline over the hyper transport against a
//! local mock server.

use std::io::Write;
use std::time::Duration;

use httpmock::prelude::*;
use restkit_http::{
    BytesBody, Context, HttpError, Pipeline, Request, RetryOptions, TransportConfig,
};

fn pipeline(retry: RetryOptions) -> Pipeline {
    Pipeline::builder()
        .retry(retry)
        .transport_config(TransportConfig::for_testing())
        .build()
        .unwrap()
}

fn request(method: http::Method, server: &MockServer, path: &str) -> Request {
    Request::parse(method, &server.url(path)).unwrap()
}

#[tokio::test]
async fn json_round_trip() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/widgets/7").header_exists("user-agent");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id":7,"name":"sprocket"}"#);
    });

    let mut req = request(http::Method::GET, &server, "/widgets/7");
    let resp = pipeline(RetryOptions::fast())
        .send(&Context::new(), &mut req)
        .await
        .unwrap()
        .error_for_status()
        .unwrap();

    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["name"], "sprocket");
    mock.assert_calls(1);
}

#[tokio::test]
async fn retries_stop_at_attempt_ceiling() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/flaky");
        then.status(503);
    });

    let mut req = request(http::Method::GET, &server, "/flaky");
    let resp = pipeline(RetryOptions::fast())
        .send(&Context::new(), &mut req)
        .await
        .unwrap();

    assert_eq!(resp.status(), http::StatusCode::SERVICE_UNAVAILABLE);
    mock.assert_calls(4);
}

#[tokio::test]
async fn body_is_replayed_on_every_attempt() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/upload").body("payload");
        then.status(500);
    });

    let mut req = request(http::Method::POST, &server, "/upload");
    req.set_body(BytesBody::new("payload"), "text/plain").unwrap();
    let options = RetryOptions {
        max_retries: 2,
        ..RetryOptions::fast()
    };
    pipeline(options)
        .send(&Context::new(), &mut req)
        .await
        .unwrap();

    mock.assert_calls(3);
}

#[tokio::test]
async fn gzip_responses_are_decompressed() {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(br#"{"compressed":true}"#).unwrap();
    let gz = encoder.finish().unwrap();

    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/gz");
        then.status(200)
            .header("content-type", "application/json")
            .header("content-encoding", "gzip")
            .body(gz.clone());
    });

    let mut req = request(http::Method::GET, &server, "/gz");
    let resp = pipeline(RetryOptions::no_retries())
        .send(&Context::new(), &mut req)
        .await
        .unwrap();
    assert_eq!(resp.json::<serde_json::Value>().unwrap()["compressed"], true);
}

#[tokio::test]
async fn error_status_becomes_response_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/missing");
        then.status(404)
            .header("content-type", "application/json")
            .body(r#"{"error":{"code":"ResourceNotFound","message":"no such widget"}}"#);
    });

    let mut req = request(http::Method::GET, &server, "/missing?secret=1");
    let err = pipeline(RetryOptions::no_retries())
        .send(&Context::new(), &mut req)
        .await
        .unwrap()
        .error_for_status()
        .unwrap_err();

    let resp_err = err.as_response_error().unwrap();
    assert_eq!(resp_err.status, http::StatusCode::NOT_FOUND);
    assert_eq!(resp_err.error_code.as_deref(), Some("ResourceNotFound"));
    let report = err.to_string();
    assert!(report.starts_with("GET http://"));
    assert!(report.contains("RESPONSE 404: Not Found"));
    assert!(report.contains("\"message\": \"no such widget\""));
    assert!(!report.contains("secret=1"));
}

#[tokio::test]
async fn tls_only_transport_refuses_plain_http() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.any_request();
        then.status(200);
    });

    let pipeline = Pipeline::builder()
        .retry(RetryOptions::fast())
        .build()
        .unwrap();
    let mut req = request(http::Method::GET, &server, "/");
    let err = pipeline.send(&Context::new(), &mut req).await.unwrap_err();

    assert!(matches!(err, HttpError::InvalidScheme { .. }));
    mock.assert_calls(0);
}

#[tokio::test]
async fn slow_server_hits_transport_timeout() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/slow");
        then.status(200).delay(Duration::from_secs(2));
    });

    let config = TransportConfig {
        request_timeout: Duration::from_millis(100),
        ..TransportConfig::for_testing()
    };
    let pipeline = Pipeline::builder()
        .retry(RetryOptions::no_retries())
        .transport_config(config)
        .build()
        .unwrap();
    let mut req = request(http::Method::GET, &server, "/slow");
    let err = pipeline.send(&Context::new(), &mut req).await.unwrap_err();
    assert!(matches!(err, HttpError::TryTimeout(_)));
}

#[tokio::test]
async fn context_deadline_bounds_the_whole_call() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/slow");
        then.status(200).delay(Duration::from_secs(2));
    });

    let ctx = Context::new().with_timeout(Duration::from_millis(100));
    let mut req = request(http::Method::GET, &server, "/slow");
    let err = pipeline(RetryOptions::fast())
        .send(&ctx, &mut req)
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::DeadlineExceeded));
}
