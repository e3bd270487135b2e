use url::Url;

use super::error::AuthError;
use crate::client::ServerClient;
use crate::config::ServerClientConfig;
use crate::store::{CookieStateStore, CookieTransactionStore, DEFAULT_SESSION_DURATION_SECS};

/// Route-layer settings shared with the request handlers.
#[derive(Debug, Clone)]
pub(crate) struct AuthSettings {
    pub(crate) app_base_url: Url,
    pub(crate) mount_routes: bool,
    pub(crate) mount_connect_routes: bool,
    pub(crate) cookie_name: String,
    pub(crate) secure_cookies: bool,
    pub(crate) session_expiration: i64,
}

impl AuthSettings {
    fn defaults(app_base_url: Url) -> Self {
        Self {
            secure_cookies: app_base_url.scheme() == "https",
            app_base_url,
            mount_routes: true,
            mount_connect_routes: false,
            cookie_name: "auth0_session".into(),
            session_expiration: DEFAULT_SESSION_DURATION_SECS,
        }
    }

    /// Absolute URL of `path` under the application base.
    pub(crate) fn route_url(&self, path: &str) -> Result<String, AuthError> {
        let mut base = self.app_base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path)
            .map(String::from)
            .map_err(|e| AuthError::Config(format!("invalid route url '{path}': {e}")))
    }
}

/// Authentication route configuration.
///
/// The application's public base URL is the only required field; callbacks
/// and post-login redirects are resolved against it.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub(super) settings: AuthSettings,
}

impl AuthConfig {
    #[must_use]
    pub fn new(app_base_url: Url) -> Self {
        Self {
            settings: AuthSettings::defaults(app_base_url),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `APP_BASE_URL`: public base URL of the application
    ///
    /// # Optional env vars
    /// - `AUTH_MOUNT_CONNECT_ROUTES`: `"1"` or `"true"` to mount the account-linking routes
    /// - `AUTH_COOKIE_NAME`: session cookie name
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] if `APP_BASE_URL` is missing or invalid.
    pub fn from_env() -> Result<Self, AuthError> {
        let base = std::env::var("APP_BASE_URL")
            .map_err(|_| AuthError::Config("APP_BASE_URL is required".into()))?;
        let base: Url = base
            .parse()
            .map_err(|e| AuthError::Config(format!("APP_BASE_URL: {e}")))?;

        let connect = matches!(
            std::env::var("AUTH_MOUNT_CONNECT_ROUTES").as_deref(),
            Ok("1") | Ok("true"),
        );

        let mut config = Self::new(base).with_mount_connect_routes(connect);
        if let Ok(name) = std::env::var("AUTH_COOKIE_NAME") {
            config = config.with_cookie_name(name);
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_mount_routes(mut self, mount: bool) -> Self {
        self.settings.mount_routes = mount;
        self
    }

    #[must_use]
    pub fn with_mount_connect_routes(mut self, mount: bool) -> Self {
        self.settings.mount_connect_routes = mount;
        self
    }

    #[must_use]
    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.settings.cookie_name = name.into();
        self
    }

    #[must_use]
    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.settings.secure_cookies = secure;
        self
    }

    /// Session lifetime in seconds.
    #[must_use]
    pub fn with_session_expiration(mut self, seconds: i64) -> Self {
        self.settings.session_expiration = seconds;
        self
    }

    #[must_use]
    pub fn app_base_url(&self) -> &Url {
        &self.settings.app_base_url
    }

    /// Applies the route layer's defaults to an engine config: the session
    /// cookie name, the session lifetime, and `/auth/callback` as redirect URI
    /// unless one is already set.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] if the callback URL cannot be built.
    pub fn client_config(
        &self,
        config: ServerClientConfig,
    ) -> Result<ServerClientConfig, AuthError> {
        let mut config = config
            .with_state_identifier(self.settings.cookie_name.clone())
            .with_session_duration(self.settings.session_expiration);
        if config.redirect_uri().is_none() {
            let callback = self.settings.route_url("auth/callback")?;
            config = config.with_redirect_uri(callback);
        }
        Ok(config)
    }

    /// Engine storing transactions and sessions in sealed cookies.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Config`] if the engine config is incomplete.
    pub fn cookie_client(
        &self,
        config: ServerClientConfig,
    ) -> Result<ServerClient<CookieTransactionStore, CookieStateStore>, AuthError> {
        let config = self.client_config(config)?;
        let secure = self.settings.secure_cookies;
        let transactions = CookieTransactionStore::new(config.secret()).with_secure(secure);
        let sessions = CookieStateStore::new(config.secret())
            .with_secure(secure)
            .with_duration(self.settings.session_expiration);

        ServerClient::new(config, transactions, sessions)
            .map_err(|e| AuthError::Config(e.to_string()))
    }
}
