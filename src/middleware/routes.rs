use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header::CONTENT_TYPE};
use axum::response::Redirect;
use axum::routing::{get, post};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use url::Url;

use super::config::{AuthConfig, AuthSettings};
use super::error::AuthError;
use super::extractor::AuthUser;
use super::state::{AuthState, CookieResult, request_store, with_jar};
use crate::client::ServerClient;
use crate::store::{StateStore, TransactionStore};
use crate::types::{
    Claims, ConnectionTokenOptions, LogoutOptions, StartInteractiveLoginOptions,
    StartLinkUserOptions,
};

/// Create the authentication router.
///
/// `/auth/login`, `/auth/callback`, `/auth/logout`, `/auth/backchannel-logout`,
/// `/auth/profile`, `/auth/token` and `/auth/connection/{connection}` are
/// mounted when `mount_routes` is set; `/auth/connect` and
/// `/auth/connect/callback` when `mount_connect_routes` is set.
pub fn auth_routes<T, S>(config: AuthConfig, client: ServerClient<T, S>) -> Router
where
    T: TransactionStore,
    S: StateStore,
{
    let state = AuthState {
        client: Arc::new(client),
        settings: Arc::new(config.settings),
    };

    let mut router = Router::new();

    if state.settings.mount_routes {
        router = router
            .route("/auth/login", get(login::<T, S>))
            .route("/auth/callback", get(callback::<T, S>))
            .route("/auth/logout", get(logout::<T, S>))
            .route("/auth/backchannel-logout", post(backchannel_logout::<T, S>))
            .route("/auth/profile", get(profile::<T, S>))
            .route("/auth/token", get(token::<T, S>))
            .route("/auth/connection/{connection}", get(connection_token::<T, S>));
    }

    if state.settings.mount_connect_routes {
        router = router
            .route("/auth/connect", get(connect::<T, S>))
            .route("/auth/connect/callback", get(connect_callback::<T, S>));
    }

    router.with_state(state)
}

// ── Login ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ReturnToParams {
    #[serde(rename = "returnTo")]
    return_to: Option<String>,
}

async fn login<T: TransactionStore, S: StateStore>(
    State(state): State<AuthState<T, S>>,
    headers: HeaderMap,
    Query(params): Query<ReturnToParams>,
) -> CookieResult<Redirect> {
    let (buffer, options) = request_store(&headers);

    let mut login = StartInteractiveLoginOptions::default();
    if let Some(target) = params
        .return_to
        .as_deref()
        .and_then(|target| safe_redirect(target, &state.settings.app_base_url))
    {
        login = login.with_app_state(return_to_state(target));
    }

    let url = state
        .client
        .start_interactive_login(login, &options)
        .await
        .map_err(with_jar(&buffer))?;
    Ok((buffer.jar(), Redirect::to(&url)))
}

// ── Callback ───────────────────────────────────────────────────────

async fn callback<T: TransactionStore, S: StateStore>(
    State(state): State<AuthState<T, S>>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
) -> CookieResult<Redirect> {
    let (buffer, options) = request_store(&headers);

    let outcome = state
        .client
        .complete_interactive_login(&uri.to_string(), &options)
        .await
        .map_err(with_jar(&buffer))?;

    let target = post_login_target(outcome.app_state.as_ref(), &state.settings);
    tracing::info!("Login callback completed");
    Ok((buffer.jar(), Redirect::to(&target)))
}

// ── Logout ─────────────────────────────────────────────────────────

async fn logout<T: TransactionStore, S: StateStore>(
    State(state): State<AuthState<T, S>>,
    headers: HeaderMap,
) -> CookieResult<Redirect> {
    let (buffer, options) = request_store(&headers);
    let logout = LogoutOptions {
        return_to: Some(state.settings.app_base_url.to_string()),
    };

    let url = state
        .client
        .logout(&logout, &options)
        .await
        .map_err(with_jar(&buffer))?;
    Ok((buffer.jar(), Redirect::to(&url)))
}

#[derive(Deserialize)]
struct BackchannelLogoutBody {
    logout_token: Option<String>,
}

/// Accepts `logout_token` as a form field or a JSON member.
async fn backchannel_logout<T: TransactionStore, S: StateStore>(
    State(state): State<AuthState<T, S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AuthError> {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));

    let logout_token = if is_json {
        serde_json::from_slice::<BackchannelLogoutBody>(&body)
            .map_err(|e| AuthError::BadRequest(format!("Invalid request body: {e}")))?
            .logout_token
    } else {
        url::form_urlencoded::parse(&body)
            .find(|(key, _)| key == "logout_token")
            .map(|(_, value)| value.into_owned())
    };

    let logout_token = logout_token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AuthError::BadRequest("Missing 'logout_token' in request body.".into()))?;

    let (_, options) = request_store(&headers);
    state
        .client
        .handle_backchannel_logout(&logout_token, &options)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

// ── Session inspection ─────────────────────────────────────────────

async fn profile<T: TransactionStore, S: StateStore>(
    State(state): State<AuthState<T, S>>,
    headers: HeaderMap,
    user: AuthUser,
) -> CookieResult<Json<serde_json::Value>> {
    let (buffer, options) = request_store(&headers);
    let session = state
        .client
        .get_session(&options)
        .await
        .map_err(with_jar(&buffer))?;

    Ok((
        buffer.jar(),
        Json(serde_json::json!({
            "user": user.claims,
            "session": session,
        })),
    ))
}

async fn token<T: TransactionStore, S: StateStore>(
    State(state): State<AuthState<T, S>>,
    headers: HeaderMap,
) -> CookieResult<Json<serde_json::Value>> {
    let (buffer, options) = request_store(&headers);
    let access_token = state
        .client
        .get_access_token(None, &options)
        .await
        .map_err(with_jar(&buffer))?;

    Ok((
        buffer.jar(),
        Json(serde_json::json!({
            "access_token_available": !access_token.is_empty(),
            "access_token_preview": token_preview(&access_token),
            "status": "success",
        })),
    ))
}

#[derive(Deserialize)]
struct ConnectionTokenParams {
    login_hint: Option<String>,
}

async fn connection_token<T: TransactionStore, S: StateStore>(
    State(state): State<AuthState<T, S>>,
    headers: HeaderMap,
    Path(connection): Path<String>,
    Query(params): Query<ConnectionTokenParams>,
) -> CookieResult<Json<serde_json::Value>> {
    let (buffer, options) = request_store(&headers);
    let request = ConnectionTokenOptions {
        connection: connection.clone(),
        login_hint: params.login_hint,
    };
    let access_token = state
        .client
        .get_access_token_for_connection(&request, &options)
        .await
        .map_err(with_jar(&buffer))?;

    Ok((
        buffer.jar(),
        Json(serde_json::json!({
            "connection": connection,
            "access_token_available": !access_token.is_empty(),
            "access_token_preview": token_preview(&access_token),
            "status": "success",
        })),
    ))
}

// ── Account linking ────────────────────────────────────────────────

#[derive(Deserialize)]
struct ConnectParams {
    connection: Option<String>,
    #[serde(rename = "connectionScope")]
    connection_scope: Option<String>,
    #[serde(rename = "returnTo")]
    return_to: Option<String>,
}

async fn connect<T: TransactionStore, S: StateStore>(
    State(state): State<AuthState<T, S>>,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
) -> CookieResult<Redirect> {
    let (buffer, options) = request_store(&headers);
    let connection = params
        .connection
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            (
                buffer.jar(),
                AuthError::BadRequest("connection is not set".into()),
            )
        })?;

    let settings = &state.settings;
    let return_to = params
        .return_to
        .as_deref()
        .and_then(|target| safe_redirect(target, &settings.app_base_url))
        .unwrap_or_else(|| settings.app_base_url.to_string());

    let mut link = StartLinkUserOptions::new(connection);
    link.connection_scope = params.connection_scope;
    link.app_state = Some(return_to_state(return_to));
    let callback = settings
        .route_url("auth/connect/callback")
        .map_err(with_jar(&buffer))?;
    link.authorization_params.insert("redirect_uri".into(), callback);

    let url = state
        .client
        .start_link_user(link, &options)
        .await
        .map_err(with_jar(&buffer))?;
    Ok((buffer.jar(), Redirect::to(&url)))
}

async fn connect_callback<T: TransactionStore, S: StateStore>(
    State(state): State<AuthState<T, S>>,
    headers: HeaderMap,
    OriginalUri(uri): OriginalUri,
) -> CookieResult<Redirect> {
    let (buffer, options) = request_store(&headers);

    let outcome = state
        .client
        .complete_link_user(&uri.to_string(), &options)
        .await
        .map_err(with_jar(&buffer))?;

    let target = post_login_target(outcome.app_state.as_ref(), &state.settings);
    Ok((buffer.jar(), Redirect::to(&target)))
}

// ── Helpers ────────────────────────────────────────────────────────

/// Resolves `target` against `base` and keeps it only if it stays on the
/// application's origin.
fn safe_redirect(target: &str, base: &Url) -> Option<String> {
    let resolved = base.join(target).ok()?;
    (resolved.origin() == base.origin()).then(|| resolved.into())
}

fn return_to_state(target: String) -> Claims {
    let mut app_state = Claims::new();
    app_state.insert("returnTo".into(), target.into());
    app_state
}

fn post_login_target(app_state: Option<&Claims>, settings: &AuthSettings) -> String {
    app_state
        .and_then(|state| state.get("returnTo"))
        .and_then(serde_json::Value::as_str)
        .and_then(|target| safe_redirect(target, &settings.app_base_url))
        .unwrap_or_else(|| settings.app_base_url.to_string())
}

fn token_preview(token: &str) -> Option<String> {
    (!token.is_empty()).then(|| format!("{}...", token.chars().take(10).collect::<String>()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        "https://app.example.com/".parse().unwrap()
    }

    #[test]
    fn same_origin_targets_are_kept() {
        assert_eq!(
            safe_redirect("/orders?id=7", &base()).as_deref(),
            Some("https://app.example.com/orders?id=7")
        );
    }

    #[test]
    fn foreign_targets_are_dropped() {
        assert_eq!(safe_redirect("https://evil.example/", &base()), None);
        assert_eq!(safe_redirect("//evil.example/path", &base()), None);
    }

    #[test]
    fn preview_truncates() {
        assert_eq!(
            token_preview("abcdefghijklmnop").as_deref(),
            Some("abcdefghij...")
        );
        assert_eq!(token_preview(""), None);
    }
}
