//! HTTP-level tests of the exchange API.
//!
//! The router runs against an in-memory SQLite repository; identities come
//! from HS256 tokens signed with the test secret.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{Method, Request, StatusCode},
};
use exchange_hex::{
    ExchangeService,
    inbound::{HttpServer, JwtVerifier},
};
use exchange_repo::SqliteRepo;
use exchange_types::{ExchangeRepository, Identity, Role};
use http_body_util::BodyExt;
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;

const SECRET: &str = "integration-secret";
const AUDIENCE: &str = "authenticated";

struct TestApp {
    app: Router,
    repo: Arc<SqliteRepo>,
}

/// Helper to create a test server with the given rate limit.
async fn create_test_app(requests_per_minute: u32) -> TestApp {
    let repo = Arc::new(SqliteRepo::new("sqlite::memory:").await.unwrap());
    let service = ExchangeService::new(repo.clone());
    let verifier = Arc::new(JwtVerifier::new(SECRET, AUDIENCE));
    let server = HttpServer::with_rate_limit(service, verifier, requests_per_minute);
    TestApp {
        app: server.router(),
        repo,
    }
}

fn token_with(secret: &str, email: &str) -> String {
    let claims = json!({
        "sub": format!("sub-{}", email),
        "email": email,
        "aud": AUDIENCE,
        "exp": chrono::Utc::now().timestamp() + 3600,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

fn token(email: &str) -> String {
    token_with(SECRET, email)
}

/// Registers a user with roles and returns a token for them.
async fn staff(repo: &SqliteRepo, email: &str, roles: &[Role]) -> String {
    let user = repo
        .upsert_identity(Identity {
            external_id: format!("sub-{}", email),
            email: email.into(),
        })
        .await
        .unwrap();
    repo.set_roles(user.id, roles.iter().copied().collect())
        .await
        .unwrap();
    token(email)
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Creates USD, EUR and UAH, a branch and a USD -> EUR rate. Returns (branch_id, rate_id).
async fn seed_catalog(app: &Router, owner: &str) -> (String, String) {
    for (code, name, symbol) in [("USD", "US Dollar", "$"), ("EUR", "Euro", "€"), ("UAH", "Hryvnia", "₴")] {
        let (status, _) = send(
            app,
            Method::POST,
            "/api/currencies",
            Some(owner),
            Some(json!({ "code": code, "name": name, "symbol": symbol })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, branch) = send(
        app,
        Method::POST,
        "/api/branches",
        Some(owner),
        Some(json!({
            "name": "Central",
            "city": "Kyiv",
            "address": "1 Khreshchatyk St",
            "phone": "+380441234567",
            "email": "central@example.com",
            "base_currency": "UAH",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let branch_id = branch["id"].as_str().unwrap().to_string();

    let (status, rate) = send(
        app,
        Method::POST,
        "/api/rates",
        Some(owner),
        Some(json!({
            "branch_id": branch_id,
            "from_currency": "USD",
            "to_currency": "EUR",
            "rate": "0.915",
            "min_amount": "10",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    (branch_id, rate["id"].as_str().unwrap().to_string())
}

fn order_body(branch_id: &str, amount: &str) -> Value {
    json!({
        "branch_id": branch_id,
        "client_email": "client@example.com",
        "items": [{ "from_currency": "USD", "to_currency": "EUR", "from_amount": amount }],
    })
}

#[tokio::test]
async fn test_health_and_openapi_document() {
    let t = create_test_app(100).await;

    let (status, body) = send(&t.app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, doc) = send(&t.app, Method::GET, "/api-docs/openapi.json", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/api/rates/{id}/quote"].is_object());
}

#[tokio::test]
async fn test_public_quote_and_error_bodies() {
    let t = create_test_app(100).await;
    let owner = staff(&t.repo, "owner@example.com", &[Role::Owner]).await;
    let (_, rate_id) = seed_catalog(&t.app, &owner).await;
    let uri = format!("/api/rates/{}/quote", rate_id);

    let (status, quote) = send(&t.app, Method::POST, &uri, None, Some(json!({ "amount_from": "11" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(quote["amount_to"], "10.07");
    assert_eq!(quote["rate"], "0.915");

    let (status, err) = send(&t.app, Method::POST, &uri, None, Some(json!({ "amount_from": "5" }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(err["kind"], "below_minimum");
    assert_eq!(err["code"], 422);
    assert_eq!(err["details"]["min_amount"], "10");
    assert_eq!(err["details"]["currency"], "USD");

    let (status, err) = send(&t.app, Method::POST, &uri, None, Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["kind"], "invalid_input");

    let (status, _) = send(&t.app, Method::POST, "/api/rates/not-a-uuid/quote", None, Some(json!({ "amount_from": "11" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_identity_errors() {
    let t = create_test_app(100).await;

    let (status, err) = send(&t.app, Method::GET, "/api/users/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(err["kind"], "unauthorized");

    let forged = token_with("wrong-secret", "client@example.com");
    let (status, _) = send(&t.app, Method::GET, "/api/currencies", Some(&forged), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let client = token("client@example.com");
    let (status, me) = send(&t.app, Method::GET, "/api/users/me", Some(&client), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["email"], "client@example.com");
    assert_eq!(me["username"], "client");

    let (status, err) = send(
        &t.app,
        Method::POST,
        "/api/currencies",
        Some(&client),
        Some(json!({ "code": "GBP", "name": "Pound", "symbol": "£" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["kind"], "forbidden");
}

#[tokio::test]
async fn test_order_lifecycle_over_http() {
    let t = create_test_app(100).await;
    let owner = staff(&t.repo, "owner@example.com", &[Role::Owner]).await;
    let operator = staff(&t.repo, "operator@example.com", &[Role::Operator]).await;
    let client = token("client@example.com");
    let (branch_id, _) = seed_catalog(&t.app, &owner).await;

    let (status, order) = send(&t.app, Method::POST, "/api/orders", Some(&client), Some(order_body(&branch_id, "100"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(order["status"], "new");
    assert_eq!(order["items"][0]["to_amount"], "91.50");
    let order_id = order["id"].as_str().unwrap().to_string();
    let tracking_code = order["tracking_code"].as_str().unwrap().to_string();
    let status_uri = format!("/api/orders/{}/status", order_id);

    let (status, err) = send(&t.app, Method::PATCH, &status_uri, Some(&operator), Some(json!({ "status": "completed" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["kind"], "invalid_transition");
    assert_eq!(err["details"]["allowed"], json!(["processing", "cancelled"]));

    let (status, _) = send(&t.app, Method::PATCH, &status_uri, Some(&client), Some(json!({ "status": "processing" }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    for next in ["processing", "waiting_delivery"] {
        let (status, _) = send(&t.app, Method::PATCH, &status_uri, Some(&operator), Some(json!({ "status": next }))).await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, err) = send(&t.app, Method::PATCH, &status_uri, Some(&operator), Some(json!({ "status": "completed" }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(err["details"]["missing"], json!(["receipt", "chat"]));

    let docs_uri = format!("/api/orders/{}/documents", order_id);
    for doc_type in ["receipt", "chat"] {
        let (status, _) = send(
            &t.app,
            Method::POST,
            &docs_uri,
            Some(&client),
            Some(json!({ "doc_type": doc_type, "file_handle": format!("uploads/{}.pdf", doc_type) })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, done) = send(&t.app, Method::PATCH, &status_uri, Some(&operator), Some(json!({ "status": "completed" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(done["status_display"], "Completed");

    let (status, tracked) = send(&t.app, Method::GET, &format!("/api/track/{}", tracking_code), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tracked["status"], "completed");
    assert!(tracked.get("client_email").is_none());

    let (status, review) = send(
        &t.app,
        Method::POST,
        "/api/reviews",
        Some(&client),
        Some(json!({ "order_id": order_id, "rating": 5, "text": "Quick and easy" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(review["is_visible"], false);

    let (status, mine) = send(&t.app, Method::GET, "/api/orders", Some(&client), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(mine.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_guest_order_and_delete() {
    let t = create_test_app(100).await;
    let owner = staff(&t.repo, "owner@example.com", &[Role::Owner]).await;
    let (branch_id, _) = seed_catalog(&t.app, &owner).await;

    let (status, order) = send(&t.app, Method::POST, "/api/orders", None, Some(order_body(&branch_id, "50"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(order["user_id"].is_null());

    let (status, _) = send(&t.app, Method::GET, "/api/orders", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let uri = format!("/api/orders/{}", order["id"].as_str().unwrap());
    let (status, _) = send(&t.app, Method::DELETE, &uri, Some(&owner), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&t.app, Method::GET, &uri, Some(&owner), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rate_limiting_returns_429_when_exceeded() {
    let t = create_test_app(3).await;
    let client = token("client@example.com");

    for i in 1..=3 {
        let (status, _) = send(&t.app, Method::GET, "/api/currencies", Some(&client), None).await;
        assert_ne!(
            status,
            StatusCode::TOO_MANY_REQUESTS,
            "Request {} should not be rate limited",
            i
        );
    }

    let (status, body) = send(&t.app, Method::GET, "/api/currencies", Some(&client), None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("Rate limit exceeded"));
    assert_eq!(body["retry_after_seconds"], 60);

    // Anonymous callers have their own bucket
    let (status, _) = send(&t.app, Method::GET, "/api/currencies", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

/// Lists currencies as a caller connecting from `peer`.
async fn list_from(app: &Router, peer: &str, token: &str) -> StatusCode {
    let peer: SocketAddr = peer.parse().unwrap();
    let mut request = Request::builder()
        .method(Method::GET)
        .uri("/api/currencies")
        .header("Authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    app.clone().oneshot(request).await.unwrap().status()
}

#[tokio::test]
async fn test_rate_limiting_cannot_be_dodged_with_fresh_tokens() {
    let t = create_test_app(3).await;

    let mut statuses = Vec::new();
    for i in 0..10 {
        let garbage = format!("not-a-jwt-{}", i);
        let (status, _) = send(&t.app, Method::GET, "/api/currencies", Some(&garbage), None).await;
        statuses.push(status);
    }
    assert_eq!(&statuses[..3], &[StatusCode::UNAUTHORIZED; 3]);
    assert!(statuses[3..].iter().all(|s| *s == StatusCode::TOO_MANY_REQUESTS));

    // A signed-in account draws from its own bucket
    let client = token("client@example.com");
    for _ in 0..3 {
        let (status, _) = send(&t.app, Method::GET, "/api/currencies", Some(&client), None).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = send(&t.app, Method::GET, "/api/currencies", Some(&client), None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    // Someone else is unaffected
    let other = token("other@example.com");
    let (status, _) = send(&t.app, Method::GET, "/api/currencies", Some(&other), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_rejected_tokens_charged_per_address() {
    let t = create_test_app(2).await;

    assert_eq!(list_from(&t.app, "10.0.0.1:4000", "bad-1").await, StatusCode::UNAUTHORIZED);
    assert_eq!(list_from(&t.app, "10.0.0.1:4001", "bad-2").await, StatusCode::UNAUTHORIZED);
    assert_eq!(
        list_from(&t.app, "10.0.0.1:4002", "bad-3").await,
        StatusCode::TOO_MANY_REQUESTS
    );

    // A different peer still gets a plain rejection
    assert_eq!(list_from(&t.app, "10.0.0.2:4000", "bad-4").await, StatusCode::UNAUTHORIZED);

    // A valid user behind the throttled address has their own bucket
    let client = token("client@example.com");
    assert_eq!(list_from(&t.app, "10.0.0.1:4003", &client).await, StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limiting_health_endpoint_bypassed() {
    let t = create_test_app(1).await;
    for _ in 0..10 {
        let (status, _) = send(&t.app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK, "Health endpoint should not be rate limited");
    }
}
