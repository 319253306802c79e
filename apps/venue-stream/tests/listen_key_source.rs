//! Listen Key Source Integration Tests
//!
//! HTTP contract of the listen-key credential source against a mock venue API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use venue_stream::{CredentialError, CredentialSource, HttpListenKeySource, ListenKeyConfig};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PATH: &str = "/fapi/v1/listenKey";

fn source(server: &MockServer) -> HttpListenKeySource {
    HttpListenKeySource::new(&ListenKeyConfig::new(server.uri(), "test-api-key")).unwrap()
}

#[tokio::test]
async fn issue_posts_with_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(PATH))
        .and(header("X-MBX-APIKEY", "test-api-key"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "listenKey": "abc123" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let token = source(&server).issue().await.unwrap();
    assert_eq!(token, "abc123");
}

#[tokio::test]
async fn issue_without_token_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .mount(&server)
        .await;

    let err = source(&server).issue().await.unwrap_err();
    assert_eq!(err, CredentialError::MissingToken);
}

#[tokio::test]
async fn issue_surfaces_venue_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(PATH))
        .respond_with(
            ResponseTemplate::new(401).set_body_string(r#"{"code":-2015,"msg":"Invalid API-key"}"#),
        )
        .mount(&server)
        .await;

    let err = source(&server).issue().await.unwrap_err();
    assert!(matches!(
        err,
        CredentialError::Status { status: 401, ref body } if body.contains("-2015")
    ));
}

#[tokio::test]
async fn refresh_puts_the_token() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(PATH))
        .and(header("X-MBX-APIKEY", "test-api-key"))
        .and(query_param("listenKey", "abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;

    source(&server).refresh("abc123").await.unwrap();
}

#[tokio::test]
async fn refresh_of_unknown_key_fails() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(PATH))
        .respond_with(
            ResponseTemplate::new(400).set_body_string(r#"{"code":-1125,"msg":"This listenKey does not exist."}"#),
        )
        .mount(&server)
        .await;

    let err = source(&server).refresh("stale").await.unwrap_err();
    assert!(matches!(err, CredentialError::Status { status: 400, .. }));
}

#[tokio::test]
async fn unreachable_api_is_a_transport_error() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let source = HttpListenKeySource::new(&ListenKeyConfig::new(uri, "test-api-key")).unwrap();
    let err = source.issue().await.unwrap_err();
    assert!(matches!(err, CredentialError::Transport(_)));
}
