use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use maskinporten_token::{testutils, Pkce};
use tower::ServiceExt;
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

/// A token endpoint that fails the test if it is ever called.
async fn untouched_endpoint() -> MockServer {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock)
        .await;
    mock
}

async fn send(router: Router, method: Method, uri: &str) -> StatusCode {
    router
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn test_unmapped_paths() {
    let mock = untouched_endpoint().await;
    let server = testutils::jwt_bearer_server(&format!("{}/token", mock.uri()));

    for uri in ["/favicon.ico", "/token", "/response/extra", "/robots.txt?cache=true"] {
        assert_eq!(
            send(server.router(), Method::GET, uri).await,
            StatusCode::NOT_FOUND,
            "{uri}"
        );
    }
}

#[tokio::test]
async fn test_response_route_requires_person_mode() {
    let mock = untouched_endpoint().await;
    let server = testutils::jwt_bearer_server(&format!("{}/token", mock.uri()));
    assert!(!server.is_person_mode());

    let status = send(server.router(), Method::GET, "/response?code=ABC").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(server.pending_code().await, None);
}

#[tokio::test]
async fn test_response_route_stores_latest_code() {
    let mock = untouched_endpoint().await;
    let server = testutils::person_server(&format!("{}/token", mock.uri()), Pkce::generate());
    assert!(server.is_person_mode());

    let status = send(server.router(), Method::GET, "/response?code=one").await;
    assert_eq!(status, StatusCode::FOUND);
    let status = send(server.router(), Method::GET, "/response?code=two%2Fthree").await;
    assert_eq!(status, StatusCode::FOUND);
    assert_eq!(server.pending_code().await.as_deref(), Some("two/three"));
}

#[tokio::test]
async fn test_only_get_is_routed() {
    let mock = untouched_endpoint().await;
    let server = testutils::jwt_bearer_server(&format!("{}/token", mock.uri()));

    let status = send(server.router(), Method::POST, "/").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}
