use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::CookieJar;

use super::error::AuthError;
use super::state::{AuthState, request_store, with_jar};
use crate::store::{StateStore, TransactionStore};
use crate::types::Claims;

/// Logged in user, extracted from the session cookie.
///
/// Use as an Axum extractor in route handlers mounted on the auth router's
/// state. Returns `401 Unauthorized` if no valid session exists; a session
/// cookie that failed to unseal is cleared in the same response.
///
/// ```rust,ignore
/// async fn protected(user: AuthUser) -> impl IntoResponse {
///     format!("Hello, {}", user.subject().unwrap_or("anonymous"))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// ID-token claims of the session.
    pub claims: Claims,
}

impl AuthUser {
    /// The user's `sub` claim.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.claims.get("sub").and_then(serde_json::Value::as_str)
    }
}

impl<T: TransactionStore, S: StateStore> FromRequestParts<AuthState<T, S>> for AuthUser {
    type Rejection = (CookieJar, AuthError);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AuthState<T, S>,
    ) -> Result<Self, Self::Rejection> {
        let (buffer, options) = request_store(&parts.headers);
        state
            .client
            .get_user(&options)
            .await
            .map_err(with_jar(&buffer))?
            .map(|claims| Self { claims })
            .ok_or_else(|| (buffer.jar(), AuthError::Unauthenticated))
    }
}
