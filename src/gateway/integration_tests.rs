//! End-to-end tests: gateway in front of a live identity service and a fake upstream.

#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::{ClassLimits, GatewayConfig, IdentityConfig};
use crate::db::{DatabaseConfig, create_connection, ensure_schema};
use crate::gateway::test_support::LogCapture;
use crate::gateway::{GatewayState, create_gateway_router};
use crate::identity::{IdentityState, SharedIdentity, create_identity_router};
use crate::auth::NewSubject;

const PASSWORD: &str = "correct-horse";

struct Harness {
    gateway: Router,
    identity: SharedIdentity,
    upstream: MockServer,
}

async fn spawn_identity() -> (String, SharedIdentity) {
    let db = create_connection(DatabaseConfig {
        url: "memory".to_string(),
        namespace: "test".to_string(),
        database: "test".to_string(),
        username: None,
        password: None,
    })
    .await
    .unwrap();
    ensure_schema(&db).await.unwrap();

    let state = Arc::new(IdentityState::new(db, IdentityConfig::default()));
    let router = create_identity_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{}", addr), state)
}

async fn harness(shared_secret: Option<&str>) -> Harness {
    let (identity_url, identity) = spawn_identity().await;
    let upstream = MockServer::start().await;

    let config = GatewayConfig {
        shared_secret: shared_secret.map(str::to_string),
        verify_url: format!("{}/internal", identity_url),
        user_service_url: identity_url,
        ai_service_url: upstream.uri(),
        analytics_service_url: upstream.uri(),
        verify_timeout: Duration::from_secs(2),
        media: ClassLimits {
            timeout: Duration::from_secs(5),
            body_cap: 1024,
        },
        ..Default::default()
    };
    let state = GatewayState::from_config(&config).unwrap();

    Harness {
        gateway: create_gateway_router(Arc::new(state)),
        identity,
        upstream,
    }
}

impl Harness {
    async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let response = self.gateway.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn post_json(&self, uri: &str, bearer: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut req = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = bearer {
            req = req.header("authorization", format!("Bearer {}", token));
        }
        self.send(req.body(Body::from(body.to_string())).unwrap()).await
    }

    async fn stats(&self, name: &str, value: &str) -> StatusCode {
        let req = Request::builder()
            .uri("/api/v1/stats")
            .header(name, value)
            .body(Body::empty())
            .unwrap();
        self.send(req).await.0
    }

    /// Register through the gateway and log in. Returns (subject id, session token).
    async fn sign_up(&self, username: &str) -> (String, String) {
        let (status, user) = self
            .post_json(
                "/api/v1/users",
                None,
                json!({
                    "username": username,
                    "email": format!("{}@example.com", username),
                    "password": PASSWORD
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, login) = self
            .post_json(
                "/api/v1/login",
                None,
                json!({"username": username, "password": PASSWORD}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        (
            user["id"].as_str().unwrap().to_string(),
            login["token"].as_str().unwrap().to_string(),
        )
    }
}

#[tokio::test]
async fn test_login_access_logout() {
    let h = harness(None).await;
    let (subject_id, token) = h.sign_up("alice").await;

    Mock::given(method("GET"))
        .and(path("/api/v1/stats"))
        .and(header("x-user-id", subject_id.as_str()))
        .and(header("x-username", "alice"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"requests": 12})))
        .expect(1)
        .mount(&h.upstream)
        .await;

    let bearer = format!("Bearer {}", token);
    assert_eq!(h.stats("authorization", &bearer).await, StatusCode::OK);

    let (status, _) = h.post_json("/api/v1/logout", Some(&token), json!({})).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    assert_eq!(h.stats("authorization", &bearer).await, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_api_key_access_until_revoked() {
    let h = harness(None).await;
    let (subject_id, token) = h.sign_up("bob").await;

    let (status, created) = h
        .post_json("/api/v1/keys", Some(&token), json!({"name": "ci-bot"}))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let key = created["key"].as_str().unwrap().to_string();
    let key_id = created["id"].as_str().unwrap().to_string();

    Mock::given(method("GET"))
        .and(path("/api/v1/stats"))
        .and(header("x-user-id", subject_id.as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&h.upstream)
        .await;

    assert_eq!(h.stats("x-api-key", &key).await, StatusCode::OK);

    let req = Request::builder()
        .method(Method::PUT)
        .uri(format!("/api/v1/keys/{}", key_id))
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap();
    let (status, body) = h.send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    assert_eq!(h.stats("x-api-key", &key).await, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_shared_secret_carries_no_identity() {
    let h = harness(Some("ops-secret")).await;

    Mock::given(method("GET"))
        .and(path("/api/v1/stats"))
        .and(|req: &wiremock::Request| {
            !req.headers.contains_key("x-user-id") && !req.headers.contains_key("x-username")
        })
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&h.upstream)
        .await;

    let req = Request::builder()
        .uri("/api/v1/stats")
        .header("authorization", "Bearer ops-secret")
        .header("x-user-id", "forged")
        .body(Body::empty())
        .unwrap();
    let (status, _) = h.send(req).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_expired_session_rejected_every_time() {
    let h = harness(None).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.upstream)
        .await;

    let subject = h
        .identity
        .subjects
        .create_subject(NewSubject::new("carol", "carol@example.com", PASSWORD))
        .await
        .unwrap();
    h.identity
        .credentials
        .create_session(&subject.subject_id, "stale-token", chrono::Duration::seconds(-1))
        .await
        .unwrap();

    for _ in 0..2 {
        assert_eq!(
            h.stats("authorization", "Bearer stale-token").await,
            StatusCode::UNAUTHORIZED
        );
    }
}

#[tokio::test]
async fn test_deactivated_subject_loses_access() {
    let h = harness(None).await;
    let (subject_id, token) = h.sign_up("dave").await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&h.upstream)
        .await;

    let bearer = format!("Bearer {}", token);
    assert_eq!(h.stats("authorization", &bearer).await, StatusCode::OK);

    h.identity
        .subjects
        .set_active(&crate::types::SubjectId::new(subject_id), false)
        .await
        .unwrap();

    assert_eq!(h.stats("authorization", &bearer).await, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_invalid_api_key_does_not_fall_back_to_session() {
    let h = harness(None).await;
    let (_, token) = h.sign_up("erin").await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.upstream)
        .await;

    let req = Request::builder()
        .uri("/api/v1/stats")
        .header("x-api-key", "sk_not-a-real-key")
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap();
    let response = h.gateway.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"Unauthorized: Invalid API key");
}

#[tokio::test]
async fn test_oversized_upstream_response_is_capped() {
    let capture = LogCapture::new();
    let _guard = capture.set_default();

    let h = harness(Some("ops-secret")).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/images/render"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'z'; 4096]))
        .mount(&h.upstream)
        .await;

    let req = Request::builder()
        .uri("/api/v1/images/render")
        .header("authorization", "Bearer ops-secret")
        .body(Body::empty())
        .unwrap();
    let response = h.gateway.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(body.len(), 1024);
    assert!(capture.contents().contains("truncated=true"));
}

#[tokio::test]
async fn test_identity_service_down_is_401() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    // Bind then drop to get a port with nothing listening
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let config = GatewayConfig {
        verify_url: format!("{}/internal", dead),
        user_service_url: dead,
        analytics_service_url: upstream.uri(),
        verify_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let gateway = create_gateway_router(Arc::new(GatewayState::from_config(&config).unwrap()));

    for (name, value) in [("authorization", "Bearer some-token"), ("x-api-key", "sk_some-key")] {
        let req = Request::builder()
            .uri("/api/v1/stats")
            .header(name, value)
            .body(Body::empty())
            .unwrap();
        let response = gateway.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
