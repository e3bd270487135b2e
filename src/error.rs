/// Errors raised by the session engine and its stores.
///
/// Only two failures are recovered internally (a record that fails to unseal,
/// and an undecodable record met during a logout scan). Everything else is
/// returned to the caller as one of these variants.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A mandatory input (redirect URI, secret, callback parameter) is absent.
    #[error("the argument '{0}' is required but was not provided")]
    MissingRequiredArgument(&'static str),

    /// No transaction matches the callback: it expired, was already used, or was forged.
    #[error("the login transaction could not be found")]
    MissingTransaction,

    /// Account linking was attempted without an authenticated session.
    #[error("unable to start the user linking process without a logged in user")]
    StartLinkUser,

    /// No usable access token for the requested audience.
    #[error("{message}")]
    AccessToken { code: &'static str, message: String },

    /// No usable access token for the requested connection.
    #[error("{message}")]
    AccessTokenForConnection { code: &'static str, message: String },

    /// Missing or unverifiable logout token.
    #[error("backchannel logout failed: {0}")]
    BackchannelLogout(String),

    /// A store call lacks the request context it needs.
    #[error("store options error: {0}")]
    StoreOptions(String),

    /// The identity provider rejected an exchange, or could not be reached.
    #[error("{operation} failed: {detail}")]
    Api {
        operation: &'static str,
        status: Option<u16>,
        code: Option<String>,
        detail: String,
    },

    /// The client assertion key is unusable or the assertion could not be signed.
    #[error("client assertion error: {0}")]
    ClientAssertion(String),

    /// A payload could not be sealed or serialized for storage.
    #[error("seal error: {0}")]
    Seal(String),
}

impl Error {
    pub(crate) fn api(operation: &'static str, detail: impl std::fmt::Display) -> Self {
        Self::Api {
            operation,
            status: None,
            code: None,
            detail: detail.to_string(),
        }
    }

    pub(crate) fn missing_refresh_token() -> Self {
        Self::AccessToken {
            code: "missing_refresh_token",
            message: "the access token has expired and a refresh token was not provided; \
                      the user needs to re-authenticate"
                .into(),
        }
    }

    pub(crate) fn missing_connection_refresh_token() -> Self {
        Self::AccessTokenForConnection {
            code: "missing_refresh_token",
            message: "a refresh token was not found but is required to be able to retrieve \
                      an access token for a connection"
                .into(),
        }
    }

    /// OAuth `error` code reported by the identity provider, if any.
    #[must_use]
    pub fn oauth_code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => code.as_deref(),
            Self::AccessToken { code, .. } | Self::AccessTokenForConnection { code, .. } => {
                Some(code)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_mentions_refresh_token() {
        let err = Error::missing_connection_refresh_token();
        assert!(err.to_string().starts_with("a refresh token was not found"));
        assert_eq!(err.oauth_code(), Some("missing_refresh_token"));
    }

    #[test]
    fn backchannel_error_carries_reason() {
        let err = Error::BackchannelLogout("missing logout token".into());
        assert_eq!(err.to_string(), "backchannel logout failed: missing logout token");
    }

    #[test]
    fn api_error_without_code() {
        let err = Error::api("token exchange", "connection refused");
        assert_eq!(err.to_string(), "token exchange failed: connection refused");
        assert_eq!(err.oauth_code(), None);
    }
}
