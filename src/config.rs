use std::collections::BTreeMap;
use std::time::Duration;

use jsonwebtoken::Algorithm;
use url::Url;

use crate::error::Error;
use crate::jwt::DEFAULT_JWKS_REFETCH_INTERVAL;
use crate::oauth::ClientAssertion;
use crate::store::DEFAULT_SESSION_DURATION_SECS;

/// Scope requested when the caller configures none.
pub const DEFAULT_SCOPE: &str = "openid profile email offline_access";

/// Token-set key used when no audience is requested.
pub const DEFAULT_AUDIENCE: &str = "default";

/// Engine configuration.
///
/// Required fields are constructor parameters; everything else has a
/// default and a `with_*` override.
///
/// ```rust,ignore
/// use auth0_server::ServerClientConfig;
///
/// let config = ServerClientConfig::new("tenant.auth0.com", "client-id", "client-secret", secret)
///     .with_redirect_uri("https://app.example.com/auth/callback")
///     .with_audience("https://api.example.com");
/// ```
#[derive(Clone)]
pub struct ServerClientConfig {
    pub(crate) domain: String,
    pub(crate) client_id: String,
    pub(crate) client_secret: String,
    pub(crate) client_assertion: Option<ClientAssertion>,
    pub(crate) secret: String,
    pub(crate) authorization_params: BTreeMap<String, String>,
    pub(crate) pushed_authorization_requests: bool,
    pub(crate) transaction_identifier: String,
    pub(crate) state_identifier: String,
    pub(crate) session_duration: i64,
    pub(crate) jwks_refetch_interval: Duration,
    pub(crate) http: Option<reqwest::Client>,
}

impl std::fmt::Debug for ServerClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerClientConfig")
            .field("domain", &self.domain)
            .field("client_id", &self.client_id)
            .field("client_assertion", &self.client_assertion)
            .field("authorization_params", &self.authorization_params)
            .field(
                "pushed_authorization_requests",
                &self.pushed_authorization_requests,
            )
            .field("transaction_identifier", &self.transaction_identifier)
            .field("state_identifier", &self.state_identifier)
            .field("session_duration", &self.session_duration)
            .finish_non_exhaustive()
    }
}

impl ServerClientConfig {
    /// `domain` is a bare host (`tenant.auth0.com`) or a full base URL.
    /// `secret` seals the stored transactions and sessions. `client_secret`
    /// may be empty when a [`ClientAssertion`] is configured.
    #[must_use]
    pub fn new(
        domain: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let mut authorization_params = BTreeMap::new();
        authorization_params.insert("scope".to_owned(), DEFAULT_SCOPE.to_owned());
        Self {
            domain: domain.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            client_assertion: None,
            secret: secret.into(),
            authorization_params,
            pushed_authorization_requests: false,
            transaction_identifier: "_a0_tx".into(),
            state_identifier: "_a0_session".into(),
            session_duration: DEFAULT_SESSION_DURATION_SECS,
            jwks_refetch_interval: DEFAULT_JWKS_REFETCH_INTERVAL,
            http: None,
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `AUTH0_DOMAIN`, `AUTH0_CLIENT_ID`
    /// - `AUTH0_CLIENT_SECRET`, unless a client assertion key is set
    /// - `AUTH0_SECRET`: secret used to seal stored records
    ///
    /// # Optional env vars
    /// - `AUTH0_REDIRECT_URI`, `AUTH0_AUDIENCE`, `AUTH0_SCOPE`
    /// - `AUTH0_PUSHED_AUTHORIZATION_REQUESTS`: `"1"` or `"true"` to enable PAR
    /// - `AUTH0_CLIENT_ASSERTION_SIGNING_KEY`: PEM private key for `private_key_jwt`
    /// - `AUTH0_CLIENT_ASSERTION_SIGNING_ALG`: its algorithm (default `RS256`)
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingRequiredArgument`] naming the first missing
    /// variable, or [`Error::ClientAssertion`] for an unusable signing key.
    pub fn from_env() -> Result<Self, Error> {
        fn required(name: &'static str) -> Result<String, Error> {
            std::env::var(name)
                .ok()
                .filter(|value| !value.is_empty())
                .ok_or(Error::MissingRequiredArgument(name))
        }

        let assertion = match std::env::var("AUTH0_CLIENT_ASSERTION_SIGNING_KEY") {
            Ok(pem) if !pem.is_empty() => {
                let algorithm = match std::env::var("AUTH0_CLIENT_ASSERTION_SIGNING_ALG") {
                    Ok(alg) => alg.parse::<Algorithm>().map_err(|e| {
                        Error::ClientAssertion(format!("AUTH0_CLIENT_ASSERTION_SIGNING_ALG: {e}"))
                    })?,
                    Err(_) => Algorithm::RS256,
                };
                Some(ClientAssertion::from_pem(pem.as_bytes(), algorithm)?)
            }
            _ => None,
        };
        let client_secret = if assertion.is_some() {
            std::env::var("AUTH0_CLIENT_SECRET").unwrap_or_default()
        } else {
            required("AUTH0_CLIENT_SECRET")?
        };

        let mut config = Self::new(
            required("AUTH0_DOMAIN")?,
            required("AUTH0_CLIENT_ID")?,
            client_secret,
            required("AUTH0_SECRET")?,
        );
        if let Some(assertion) = assertion {
            config = config.with_client_assertion(assertion);
        }

        if let Ok(uri) = std::env::var("AUTH0_REDIRECT_URI") {
            config = config.with_redirect_uri(uri);
        }
        if let Ok(audience) = std::env::var("AUTH0_AUDIENCE") {
            config = config.with_audience(audience);
        }
        if let Ok(scope) = std::env::var("AUTH0_SCOPE") {
            config = config.with_authorization_param("scope", scope);
        }
        let par = matches!(
            std::env::var("AUTH0_PUSHED_AUTHORIZATION_REQUESTS").as_deref(),
            Ok("1") | Ok("true"),
        );

        Ok(config.with_pushed_authorization_requests(par))
    }

    /// Default redirect URI for login callbacks.
    #[must_use]
    pub fn with_redirect_uri(self, uri: impl Into<String>) -> Self {
        self.with_authorization_param("redirect_uri", uri)
    }

    /// Default audience requested at login and used as the token-set key.
    #[must_use]
    pub fn with_audience(self, audience: impl Into<String>) -> Self {
        self.with_authorization_param("audience", audience)
    }

    /// Adds or overrides a default authorization parameter.
    #[must_use]
    pub fn with_authorization_param(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.authorization_params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_pushed_authorization_requests(mut self, enabled: bool) -> Self {
        self.pushed_authorization_requests = enabled;
        self
    }

    /// Prefix of transaction record keys (default `_a0_tx`).
    #[must_use]
    pub fn with_transaction_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.transaction_identifier = identifier.into();
        self
    }

    /// Key of the session record (default `_a0_session`).
    #[must_use]
    pub fn with_state_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.state_identifier = identifier.into();
        self
    }

    /// Session lifetime in seconds for stores built from this config.
    #[must_use]
    pub fn with_session_duration(mut self, seconds: i64) -> Self {
        self.session_duration = seconds;
        self
    }

    /// Authenticate to the token and PAR endpoints with a signed client
    /// assertion (`private_key_jwt`) instead of the client secret.
    #[must_use]
    pub fn with_client_assertion(mut self, assertion: ClientAssertion) -> Self {
        self.client_assertion = Some(assertion);
        self
    }

    /// Minimum time between two JWKS fetches triggered by unknown key ids
    /// (default 30 seconds).
    #[must_use]
    pub fn with_jwks_refetch_interval(mut self, interval: Duration) -> Self {
        self.jwks_refetch_interval = interval;
        self
    }

    /// Use a custom HTTP client (for connection pool reuse, proxies or timeouts).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    #[must_use]
    pub fn redirect_uri(&self) -> Option<&str> {
        self.authorization_params
            .get("redirect_uri")
            .map(String::as_str)
            .filter(|uri| !uri.is_empty())
    }

    /// Token-set key for requests that name no audience.
    #[must_use]
    pub fn default_audience(&self) -> &str {
        self.authorization_params
            .get("audience")
            .map(String::as_str)
            .filter(|audience| !audience.is_empty())
            .unwrap_or(DEFAULT_AUDIENCE)
    }

    #[must_use]
    pub fn authorization_params(&self) -> &BTreeMap<String, String> {
        &self.authorization_params
    }

    #[must_use]
    pub fn state_identifier(&self) -> &str {
        &self.state_identifier
    }

    #[must_use]
    pub fn session_duration(&self) -> i64 {
        self.session_duration
    }

    /// Checks that the required fields are non-empty. The client secret is
    /// only required without a client assertion.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        for (name, value) in [
            ("domain", &self.domain),
            ("client_id", &self.client_id),
            ("secret", &self.secret),
        ] {
            if value.trim().is_empty() {
                return Err(Error::MissingRequiredArgument(name));
            }
        }
        if self.client_assertion.is_none() && self.client_secret.trim().is_empty() {
            return Err(Error::MissingRequiredArgument("client_secret"));
        }
        Ok(())
    }

    /// Tenant base URL, always ending in `/`.
    pub(crate) fn base_url(&self) -> Result<Url, Error> {
        let raw = if self.domain.contains("://") {
            self.domain.clone()
        } else {
            format!("https://{}", self.domain)
        };
        let mut url = Url::parse(&raw).map_err(|_| Error::MissingRequiredArgument("domain"))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ServerClientConfig {
        ServerClientConfig::new("tenant.example.com", "client", "client-secret", "secret")
    }

    #[test]
    fn bare_domain_becomes_https_base() {
        assert_eq!(
            config().base_url().unwrap().as_str(),
            "https://tenant.example.com/"
        );
    }

    #[test]
    fn full_url_domain_keeps_scheme_and_gets_trailing_slash() {
        let config = ServerClientConfig::new("http://127.0.0.1:8080/tenant", "c", "s", "x");
        assert_eq!(
            config.base_url().unwrap().as_str(),
            "http://127.0.0.1:8080/tenant/"
        );
    }

    #[test]
    fn empty_secret_is_rejected() {
        let config = ServerClientConfig::new("tenant.example.com", "client", "client-secret", "");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("secret"));
    }

    #[test]
    fn defaults() {
        let config = config();
        assert_eq!(config.default_audience(), DEFAULT_AUDIENCE);
        assert_eq!(config.redirect_uri(), None);
        assert_eq!(
            config.authorization_params().get("scope").map(String::as_str),
            Some(DEFAULT_SCOPE)
        );
        assert_eq!(config.session_duration(), DEFAULT_SESSION_DURATION_SECS);
    }

    #[test]
    fn overrides() {
        let config = config()
            .with_redirect_uri("https://app.example/callback")
            .with_audience("https://api.example")
            .with_state_identifier("app_session");
        assert_eq!(config.redirect_uri(), Some("https://app.example/callback"));
        assert_eq!(config.default_audience(), "https://api.example");
        assert_eq!(config.state_identifier(), "app_session");
    }

    #[test]
    fn client_secret_is_optional_with_assertion() {
        let config = ServerClientConfig::new("tenant.example.com", "client", "", "secret");
        assert!(config.validate().is_err());

        let assertion = ClientAssertion::new(
            jsonwebtoken::EncodingKey::from_secret(b"unused"),
            Algorithm::RS256,
        );
        assert!(config.with_client_assertion(assertion).validate().is_ok());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = ServerClientConfig::new(
            "tenant.example.com",
            "client",
            "client-secret-value",
            "sealing-secret-value",
        );
        let rendered = format!("{config:?}");
        assert!(rendered.contains("tenant.example.com"));
        assert!(!rendered.contains("client-secret-value"));
        assert!(!rendered.contains("sealing-secret-value"));
    }
}
