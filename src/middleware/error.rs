use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::Error;

/// Authentication errors for the route layer.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No session found.
    #[error("Not authenticated")]
    Unauthenticated,

    /// Malformed request from the browser or the identity provider.
    #[error("{0}")]
    BadRequest(String),

    /// Engine failure.
    #[error(transparent)]
    Engine(#[from] Error),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthenticated => (StatusCode::UNAUTHORIZED, self.to_string()).into_response(),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            Self::Engine(Error::StoreOptions(_) | Error::Seal(_) | Error::ClientAssertion(_))
            | Self::Config(_) => {
                tracing::error!(error = %self, "Auth internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
            }
            Self::Engine(ref error) => {
                tracing::warn!(error = %error, "Auth request failed");
                (StatusCode::BAD_REQUEST, error.to_string()).into_response()
            }
        }
    }
}
