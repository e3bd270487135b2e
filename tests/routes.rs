//! Axum route tests: cookie-backed transactions and sessions driven through
//! the router with `tower::ServiceExt::oneshot`.

#![cfg(feature = "axum")]

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use auth0_server::ServerClientConfig;
use auth0_server::middleware::{AuthConfig, auth_routes};

const CLIENT_ID: &str = "route-client";
const CLIENT_SECRET: &str = "route-client-secret-long-enough-for-hs256";
const APP_BASE: &str = "http://localhost:3000/";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn provider() -> MockServer {
    let server = MockServer::start().await;
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": format!("{base}/"),
            "authorization_endpoint": format!("{base}/authorize"),
            "token_endpoint": format!("{base}/oauth/token"),
        })))
        .mount(&server)
        .await;
    server
}

fn app(server: &MockServer, auth: AuthConfig) -> Router {
    let client = auth
        .cookie_client(ServerClientConfig::new(
            server.uri(),
            CLIENT_ID,
            CLIENT_SECRET,
            "cookie-sealing-secret",
        ))
        .unwrap();
    auth_routes(auth, client)
}

fn auth_config() -> AuthConfig {
    AuthConfig::new(APP_BASE.parse().unwrap())
}

async fn get(app: &Router, uri: &str, cookies: &[String]) -> Response<Body> {
    let mut request = Request::builder().uri(uri);
    if !cookies.is_empty() {
        request = request.header(header::COOKIE, cookies.join("; "));
    }
    app.clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

/// `name=value` pairs of the response's `Set-Cookie` headers.
fn set_cookies(response: &Response<Body>) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .map(str::to_owned)
        .collect()
}

fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

fn query_param(url: &str, name: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn id_token(server: &MockServer, nonce: &str) -> String {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    encode(
        &Header::default(),
        &json!({
            "iss": format!("{}/", server.uri()),
            "aud": CLIENT_ID,
            "sub": "route-user",
            "sid": "route-sid",
            "nonce": nonce,
            "iat": now,
            "exp": now + 3600,
        }),
        &EncodingKey::from_secret(CLIENT_SECRET.as_bytes()),
    )
    .unwrap()
}

/// Runs login + callback and returns the session cookie.
async fn logged_in(server: &MockServer, app: &Router) -> String {
    let login = get(app, "/auth/login?returnTo=/orders", &[]).await;
    let transaction_cookies = set_cookies(&login);
    let authorize = location(&login);
    let state = query_param(&authorize, "state").unwrap();
    let nonce = query_param(&authorize, "nonce").unwrap();

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "route-access-token-value",
            "expires_in": 3600,
            "id_token": id_token(server, &nonce),
        })))
        .mount(server)
        .await;

    let callback = get(
        app,
        &format!("/auth/callback?code=route-code&state={state}"),
        &transaction_cookies,
    )
    .await;
    assert_eq!(callback.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&callback), "http://localhost:3000/orders");

    set_cookies(&callback)
        .into_iter()
        .find(|cookie| cookie.starts_with("auth0_session=") && cookie.len() > "auth0_session=".len())
        .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_login_redirects_and_sets_transaction_cookie() {
    let server = provider().await;
    let app = app(&server, auth_config());

    let response = get(&app, "/auth/login", &[]).await;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let authorize = location(&response);
    assert!(authorize.starts_with(&format!("{}/authorize?", server.uri())));
    assert_eq!(
        query_param(&authorize, "redirect_uri").as_deref(),
        Some("http://localhost:3000/auth/callback")
    );
    assert!(set_cookies(&response).iter().any(|c| c.starts_with("_a0_tx.")));
}

#[tokio::test]
async fn test_callback_without_transaction_cookie_is_rejected() {
    let server = provider().await;
    let app = app(&server, auth_config());

    let response = get(&app, "/auth/callback?code=c&state=unknown", &[]).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_login_flow_establishes_cookie_session() {
    let server = provider().await;
    let app = app(&server, auth_config());
    let session = logged_in(&server, &app).await;

    let profile = get(&app, "/auth/profile", &[session.clone()]).await;
    assert_eq!(profile.status(), StatusCode::OK);
    let body = json_body(profile).await;
    assert_eq!(body["user"]["sub"], "route-user");
    assert!(body["session"].get("internal").is_none());

    let token = get(&app, "/auth/token", &[session]).await;
    assert_eq!(token.status(), StatusCode::OK);
    let body = json_body(token).await;
    assert_eq!(body["access_token_available"], true);
    assert_eq!(body["access_token_preview"], "route-acce...");
}

#[tokio::test]
async fn test_profile_requires_session() {
    let server = provider().await;
    let app = app(&server, auth_config());

    let response = get(&app, "/auth/profile", &[]).await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_clears_session_cookie() {
    let server = provider().await;
    let app = app(&server, auth_config());
    let session = logged_in(&server, &app).await;

    let response = get(&app, "/auth/logout", &[session]).await;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let target = location(&response);
    assert!(target.starts_with(&format!("{}/v2/logout?", server.uri())));
    assert_eq!(query_param(&target, "returnTo").as_deref(), Some(APP_BASE));
    assert!(set_cookies(&response).contains(&"auth0_session=".to_owned()));
}

#[tokio::test]
async fn test_backchannel_logout_requires_token() {
    let server = provider().await;
    let app = app(&server, auth_config());

    let request = Request::builder()
        .method("POST")
        .uri("/auth/backchannel-logout")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("other=1"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/auth/backchannel-logout")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"logout_token":"not-a-jwt"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_connect_routes_are_opt_in() {
    let server = provider().await;

    let default_app = app(&server, auth_config());
    let response = get(&default_app, "/auth/connect?connection=github", &[]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let connect_app = app(&server, auth_config().with_mount_connect_routes(true));
    let response = get(&connect_app, "/auth/connect", &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get(&connect_app, "/auth/connect?connection=github", &[]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_connect_redirects_logged_in_user() {
    let server = provider().await;
    let app = app(&server, auth_config().with_mount_connect_routes(true));
    let session = logged_in(&server, &app).await;

    let response = get(
        &app,
        "/auth/connect?connection=github&returnTo=https://evil.example/",
        &[session],
    )
    .await;

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let authorize = location(&response);
    assert_eq!(query_param(&authorize, "requested_connection").as_deref(), Some("github"));
    assert_eq!(
        query_param(&authorize, "redirect_uri").as_deref(),
        Some("http://localhost:3000/auth/connect/callback")
    );
}

#[tokio::test]
async fn test_tampered_session_cookie_is_cleared_on_rejection() {
    let server = provider().await;
    let app = app(&server, auth_config());
    let tampered = ["auth0_session=not-a-sealed-session".to_owned()];

    let profile = get(&app, "/auth/profile", &tampered).await;
    assert_eq!(profile.status(), StatusCode::UNAUTHORIZED);
    assert!(set_cookies(&profile).contains(&"auth0_session=".to_owned()));

    let token = get(&app, "/auth/token", &tampered).await;
    assert_eq!(token.status(), StatusCode::BAD_REQUEST);
    assert!(set_cookies(&token).contains(&"auth0_session=".to_owned()));
}
