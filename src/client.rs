use std::collections::BTreeMap;

use url::Url;

use crate::config::{DEFAULT_AUDIENCE, ServerClientConfig};
use crate::error::Error;
use crate::jwt::{JwtVerifier, has_logout_event};
use crate::oauth::{OAuthClient, TokenResponse};
use crate::pkce::{CHALLENGE_METHOD, PkcePair, random_token};
use crate::store::{
    MemoryStateStore, MemoryTransactionStore, StateStore, StoreOptions, TransactionStore,
};
use crate::types::{
    Claims, ConnectionTokenOptions, ConnectionTokenSet, InternalState, LoginBackchannelOptions,
    LoginOutcome, LogoutOptions, LogoutTokenClaims, SessionData, StartInteractiveLoginOptions,
    StartLinkUserOptions, StateData, TokenSet, TransactionData, TransactionKind, now_epoch,
};

/// Registered claims every ID token must carry.
const ID_TOKEN_CLAIMS: &[&str] = &["exp", "iss", "aud", "sub"];
const LOGOUT_TOKEN_CLAIMS: &[&str] = &["iss", "aud"];
const LINK_SCOPE: &str = "openid link_account";

/// Relying-party engine: drives login, linking and logout against the
/// identity provider and owns the session's credentials across requests.
///
/// Every operation takes a [`StoreOptions`] that is passed through to the
/// stores untouched. The client keeps no per-session state in memory.
///
/// ```rust,ignore
/// let client = ServerClient::with_memory_stores(config)?;
/// let url = client
///     .start_interactive_login(StartInteractiveLoginOptions::default(), &StoreOptions::none())
///     .await?;
/// // redirect the browser to `url`, then on the callback:
/// let outcome = client.complete_interactive_login(&callback_url, &options).await?;
/// ```
pub struct ServerClient<T, S> {
    config: ServerClientConfig,
    oauth: OAuthClient,
    verifier: JwtVerifier,
    transaction_store: T,
    state_store: S,
}

impl ServerClient<MemoryTransactionStore, MemoryStateStore> {
    /// Client backed by in-process stores sealed with the configured secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingRequiredArgument`] if a required setting is empty.
    pub fn with_memory_stores(config: ServerClientConfig) -> Result<Self, Error> {
        let transaction_store = MemoryTransactionStore::new(config.secret());
        let state_store =
            MemoryStateStore::new(config.secret()).with_duration(config.session_duration());
        Self::new(config, transaction_store, state_store)
    }
}

impl<T: TransactionStore, S: StateStore> ServerClient<T, S> {
    /// # Errors
    ///
    /// Returns [`Error::MissingRequiredArgument`] if `domain`, `client_id` or
    /// `secret` is empty, if `client_secret` is empty without a client
    /// assertion, or if the domain is not a valid URL.
    pub fn new(
        config: ServerClientConfig,
        transaction_store: T,
        state_store: S,
    ) -> Result<Self, Error> {
        config.validate()?;
        let http = config.http.clone().unwrap_or_default();
        let mut oauth = OAuthClient::new(
            config.base_url()?,
            config.client_id.clone(),
            config.client_secret.clone(),
            http,
        );
        if let Some(assertion) = config.client_assertion.clone() {
            oauth = oauth.with_client_assertion(assertion);
        }

        Ok(Self {
            verifier: JwtVerifier::new(config.jwks_refetch_interval),
            config,
            oauth,
            transaction_store,
            state_store,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ServerClientConfig {
        &self.config
    }

    #[must_use]
    pub fn oauth(&self) -> &OAuthClient {
        &self.oauth
    }

    #[must_use]
    pub fn transaction_store(&self) -> &T {
        &self.transaction_store
    }

    #[must_use]
    pub fn state_store(&self) -> &S {
        &self.state_store
    }

    // ── Interactive login ──────────────────────────────────────────

    /// Opens a login transaction and returns the authorization URL to
    /// redirect the browser to.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingRequiredArgument`] when no redirect URI is configured or passed.
    /// - [`Error::Api`] on discovery or pushed-authorization-request failure.
    pub async fn start_interactive_login(
        &self,
        options: StartInteractiveLoginOptions,
        store_options: &StoreOptions,
    ) -> Result<String, Error> {
        let mut params = self.config.authorization_params.clone();
        params.extend(options.authorization_params);
        let pushed = options
            .pushed_authorization_requests
            .unwrap_or(self.config.pushed_authorization_requests);

        self.start_transaction(
            params,
            options.app_state,
            TransactionKind::Login,
            pushed,
            store_options,
        )
        .await
    }

    /// Completes a login from the provider's callback URL and establishes a
    /// fresh session, replacing any previous one.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingTransaction`] when the transaction is absent, expired,
    ///   already used, or belongs to a link flow.
    /// - [`Error::Api`] when the provider returned an error or the exchange failed.
    pub async fn complete_interactive_login(
        &self,
        callback_url: &str,
        store_options: &StoreOptions,
    ) -> Result<LoginOutcome, Error> {
        let (key, transaction, tokens, id_token, claims) = self
            .complete_transaction(callback_url, TransactionKind::Login, store_options)
            .await?;

        let now = now_epoch();
        let audience = transaction
            .audience
            .clone()
            .unwrap_or_else(|| self.config.default_audience().to_owned());
        let state = new_session(claims, id_token, &tokens, audience, now);

        self.state_store
            .set(&self.config.state_identifier, &state, store_options)
            .await?;
        self.transaction_store.delete(&key, store_options).await?;

        tracing::info!(sid = %state.internal.sid, "Login completed");
        Ok(LoginOutcome {
            app_state: transaction.app_state,
            session: state.into(),
        })
    }

    // ── Account linking ────────────────────────────────────────────

    /// Opens a link transaction binding `options.connection` to the logged in user.
    ///
    /// # Errors
    ///
    /// - [`Error::StartLinkUser`] when there is no session with an ID token.
    /// - [`Error::MissingRequiredArgument`] when no redirect URI is configured or passed.
    pub async fn start_link_user(
        &self,
        options: StartLinkUserOptions,
        store_options: &StoreOptions,
    ) -> Result<String, Error> {
        let state = self
            .state_store
            .get(&self.config.state_identifier, store_options)
            .await?
            .filter(|state| !state.id_token.is_empty())
            .ok_or(Error::StartLinkUser)?;

        let mut params = self.config.authorization_params.clone();
        params.extend(options.authorization_params);
        params.insert("scope".into(), LINK_SCOPE.into());
        params.insert("requested_connection".into(), options.connection);
        if let Some(scope) = options.connection_scope {
            params.insert("requested_connection_scope".into(), scope);
        }
        params.insert("id_token_hint".into(), state.id_token);

        self.start_transaction(
            params,
            options.app_state,
            TransactionKind::Link,
            self.config.pushed_authorization_requests,
            store_options,
        )
        .await
    }

    /// Completes a link from the provider's callback URL, merging the result
    /// into the current session.
    ///
    /// # Errors
    ///
    /// Same as [`complete_interactive_login`](Self::complete_interactive_login).
    pub async fn complete_link_user(
        &self,
        callback_url: &str,
        store_options: &StoreOptions,
    ) -> Result<LoginOutcome, Error> {
        let (key, transaction, tokens, id_token, claims) = self
            .complete_transaction(callback_url, TransactionKind::Link, store_options)
            .await?;

        let now = now_epoch();
        let audience = transaction
            .audience
            .clone()
            .unwrap_or_else(|| self.config.default_audience().to_owned());

        let existing = self
            .state_store
            .get(&self.config.state_identifier, store_options)
            .await?;
        let state = match existing {
            Some(mut state) => {
                state.user = claims;
                state.id_token = id_token;
                if tokens.refresh_token.is_some() {
                    state.internal.refresh_token = tokens.refresh_token.clone();
                }
                state.upsert_token_set(token_set(&tokens, audience, now));
                state
            }
            None => new_session(claims, id_token, &tokens, audience, now),
        };

        self.state_store
            .set(&self.config.state_identifier, &state, store_options)
            .await?;
        self.transaction_store.delete(&key, store_options).await?;

        tracing::info!(sid = %state.internal.sid, "Account link completed");
        Ok(LoginOutcome {
            app_state: transaction.app_state,
            session: state.into(),
        })
    }

    // ── Backchannel login ──────────────────────────────────────────

    /// Authenticates a user out of band (CIBA) and merges the issued access
    /// token into the current session, creating one from the ID token if
    /// there is none.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] if the provider rejects, denies, or times out the request.
    pub async fn login_backchannel(
        &self,
        options: LoginBackchannelOptions,
        store_options: &StoreOptions,
    ) -> Result<TokenSet, Error> {
        const OPERATION: &str = "backchannel authentication";
        let issuer = self.oauth.metadata().await?.issuer.clone();
        let login_hint = serde_json::json!({
            "format": "iss_sub",
            "iss": issuer,
            "sub": options.login_hint_sub,
        });

        let mut params = self.config.authorization_params.clone();
        params.extend(options.authorization_params);
        params.remove("redirect_uri");
        params.insert("login_hint".into(), login_hint.to_string());
        params.insert("binding_message".into(), options.binding_message);

        let form = params
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect();
        let tokens = self.oauth.backchannel_authentication(form).await?;

        let now = now_epoch();
        let audience = params
            .get("audience")
            .cloned()
            .unwrap_or_else(|| self.config.default_audience().to_owned());
        let set = token_set(&tokens, audience, now);

        let existing = self
            .state_store
            .get(&self.config.state_identifier, store_options)
            .await?;
        let state = match existing {
            Some(mut state) => {
                state.upsert_token_set(set.clone());
                if tokens.refresh_token.is_some() {
                    state.internal.refresh_token = tokens.refresh_token.clone();
                }
                state
            }
            None => {
                let id_token = tokens
                    .id_token
                    .clone()
                    .ok_or_else(|| Error::api(OPERATION, "the token response has no id_token"))?;
                let claims = self
                    .verifier
                    .verify(&self.oauth, &id_token, ID_TOKEN_CLAIMS)
                    .await
                    .map_err(|detail| Error::api(OPERATION, detail))?;
                new_session(claims, id_token, &tokens, set.audience.clone(), now)
            }
        };

        self.state_store
            .set(&self.config.state_identifier, &state, store_options)
            .await?;

        tracing::info!(audience = %set.audience, "Backchannel login completed");
        Ok(set)
    }

    // ── Session access ─────────────────────────────────────────────

    /// Claims of the logged in user, or `None` without a session.
    pub async fn get_user(&self, store_options: &StoreOptions) -> Result<Option<Claims>, Error> {
        Ok(self
            .state_store
            .get(&self.config.state_identifier, store_options)
            .await?
            .map(|state| state.user))
    }

    /// The session minus its internal bookkeeping, or `None` without a session.
    pub async fn get_session(
        &self,
        store_options: &StoreOptions,
    ) -> Result<Option<SessionData>, Error> {
        Ok(self
            .state_store
            .get(&self.config.state_identifier, store_options)
            .await?
            .map(SessionData::from))
    }

    /// Access token for `audience` (the configured default when `None`).
    ///
    /// A cached token that has not expired is returned without contacting the
    /// provider; otherwise the refresh token is redeemed and the audience's
    /// entry replaced.
    ///
    /// # Errors
    ///
    /// - [`Error::AccessToken`] with code `missing_refresh_token` when a
    ///   refresh is needed but the session has no refresh token.
    /// - [`Error::Api`] when the refresh exchange fails.
    pub async fn get_access_token(
        &self,
        audience: Option<&str>,
        store_options: &StoreOptions,
    ) -> Result<String, Error> {
        const OPERATION: &str = "refresh token exchange";
        let key = audience.unwrap_or_else(|| self.config.default_audience());
        let now = now_epoch();

        let state = self
            .state_store
            .get(&self.config.state_identifier, store_options)
            .await?;
        if let Some(token) = state.as_ref().and_then(|state| state.live_token(key, now)) {
            tracing::debug!(audience = key, "Using cached access token");
            return Ok(token.to_owned());
        }

        let Some(mut state) = state.filter(|state| state.refresh_token().is_some()) else {
            return Err(Error::missing_refresh_token());
        };
        let refresh_token = state.refresh_token().unwrap_or_default().to_owned();
        let requested = (key != DEFAULT_AUDIENCE).then_some(key);
        let tokens = self.oauth.refresh(&refresh_token, requested).await?;

        if let Some(id_token) = tokens.id_token.clone() {
            let claims = self
                .verifier
                .verify(&self.oauth, &id_token, ID_TOKEN_CLAIMS)
                .await
                .map_err(|detail| Error::api(OPERATION, detail))?;
            state.user = claims;
            state.id_token = id_token;
        }
        if tokens.refresh_token.is_some() {
            state.internal.refresh_token = tokens.refresh_token.clone();
        }
        let set = token_set(&tokens, key.to_owned(), now_epoch());
        let access_token = set.access_token.clone();
        state.upsert_token_set(set);

        self.state_store
            .set(&self.config.state_identifier, &state, store_options)
            .await?;

        tracing::info!(audience = key, "Access token refreshed");
        Ok(access_token)
    }

    /// Access token for a federated connection, with the same caching policy
    /// as [`get_access_token`](Self::get_access_token).
    ///
    /// # Errors
    ///
    /// - [`Error::AccessTokenForConnection`] when no live token is cached and
    ///   the session has no refresh token.
    /// - [`Error::Api`] when the token exchange fails.
    pub async fn get_access_token_for_connection(
        &self,
        options: &ConnectionTokenOptions,
        store_options: &StoreOptions,
    ) -> Result<String, Error> {
        let now = now_epoch();
        let state = self
            .state_store
            .get(&self.config.state_identifier, store_options)
            .await?;
        if let Some(token) = state
            .as_ref()
            .and_then(|state| state.live_connection_token(&options.connection, now))
        {
            tracing::debug!(connection = %options.connection, "Using cached connection token");
            return Ok(token.to_owned());
        }

        let Some(mut state) = state.filter(|state| state.refresh_token().is_some()) else {
            return Err(Error::missing_connection_refresh_token());
        };
        let refresh_token = state.refresh_token().unwrap_or_default().to_owned();
        let tokens = self
            .oauth
            .connection_token(
                &refresh_token,
                &options.connection,
                options.login_hint.as_deref(),
            )
            .await?;

        let set = ConnectionTokenSet {
            connection: options.connection.clone(),
            access_token: tokens.access_token.clone(),
            expires_at: tokens.expires_at(now_epoch()),
            scope: tokens.scope.clone(),
        };
        state.upsert_connection_token_set(set);

        self.state_store
            .set(&self.config.state_identifier, &state, store_options)
            .await?;

        tracing::info!(connection = %options.connection, "Connection token issued");
        Ok(tokens.access_token)
    }

    // ── Logout ─────────────────────────────────────────────────────

    /// Deletes the session and returns the provider's logout URL.
    ///
    /// Succeeds when there is no session.
    pub async fn logout(
        &self,
        options: &LogoutOptions,
        store_options: &StoreOptions,
    ) -> Result<String, Error> {
        self.state_store
            .delete(&self.config.state_identifier, store_options)
            .await?;

        let mut url = self
            .oauth
            .base_url()
            .join("v2/logout")
            .map_err(|e| Error::api("logout", e))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", self.oauth.client_id());
            if let Some(return_to) = &options.return_to {
                query.append_pair("returnTo", return_to);
            }
        }

        tracing::info!("Session logged out");
        Ok(url.into())
    }

    /// Verifies a provider-issued logout token and deletes every session it names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackchannelLogout`] when the token is empty, fails
    /// verification, or is not a backchannel logout token. No session is
    /// touched in that case.
    pub async fn handle_backchannel_logout(
        &self,
        logout_token: &str,
        store_options: &StoreOptions,
    ) -> Result<(), Error> {
        if logout_token.is_empty() {
            return Err(Error::BackchannelLogout("missing logout token".into()));
        }

        let claims = self
            .verifier
            .verify(&self.oauth, logout_token, LOGOUT_TOKEN_CLAIMS)
            .await
            .map_err(Error::BackchannelLogout)?;

        if !has_logout_event(&claims) {
            return Err(Error::BackchannelLogout(
                "the token is not a backchannel logout token".into(),
            ));
        }
        if claims.contains_key("nonce") {
            return Err(Error::BackchannelLogout(
                "a logout token must not contain a nonce".into(),
            ));
        }
        let claim = |name: &str| claims.get(name).and_then(serde_json::Value::as_str);
        let (Some(sub), Some(sid)) = (claim("sub"), claim("sid")) else {
            return Err(Error::BackchannelLogout(
                "the logout token must contain both sub and sid".into(),
            ));
        };

        let target = LogoutTokenClaims {
            sub: sub.to_owned(),
            sid: sid.to_owned(),
        };
        tracing::warn!(sid = %target.sid, "Backchannel logout received");
        self.state_store
            .delete_by_logout_token(&target, store_options)
            .await
    }

    // ── Helpers ────────────────────────────────────────────────────

    async fn start_transaction(
        &self,
        mut params: BTreeMap<String, String>,
        app_state: Option<Claims>,
        kind: TransactionKind,
        pushed: bool,
        store_options: &StoreOptions,
    ) -> Result<String, Error> {
        let redirect_uri = params
            .get("redirect_uri")
            .filter(|uri| !uri.is_empty())
            .cloned()
            .ok_or(Error::MissingRequiredArgument("redirect_uri"))?;

        let pkce = PkcePair::generate();
        let state = random_token();
        let nonce = random_token();
        params.insert("response_type".into(), "code".into());
        params.insert("code_challenge".into(), pkce.challenge.clone());
        params.insert("code_challenge_method".into(), CHALLENGE_METHOD.into());
        params.insert("state".into(), state.clone());
        params.insert("nonce".into(), nonce.clone());

        let url = self.oauth.authorization_url(&params, pushed).await?;

        let transaction = TransactionData {
            code_verifier: pkce.verifier,
            state: state.clone(),
            nonce: Some(nonce),
            app_state,
            audience: params.get("audience").cloned(),
            organization: params.get("organization").cloned(),
            redirect_uri,
            kind,
        };
        self.transaction_store
            .set(&self.transaction_key(&state), &transaction, store_options)
            .await?;

        tracing::debug!(?kind, pushed, "Authorization transaction started");
        Ok(url)
    }

    /// Loads the callback's transaction, exchanges the code and verifies the
    /// ID token. The transaction is left in place for the caller to delete.
    async fn complete_transaction(
        &self,
        callback_url: &str,
        kind: TransactionKind,
        store_options: &StoreOptions,
    ) -> Result<(String, TransactionData, TokenResponse, String, Claims), Error> {
        const OPERATION: &str = "token exchange";
        let callback = parse_callback(callback_url)?;

        if let Some(code) = callback.error {
            return Err(Error::Api {
                operation: "authorization",
                status: None,
                detail: callback.error_description.unwrap_or_else(|| code.clone()),
                code: Some(code),
            });
        }
        let code = callback.code.ok_or(Error::MissingRequiredArgument("code"))?;
        let state = callback.state.ok_or(Error::MissingRequiredArgument("state"))?;

        let key = self.transaction_key(&state);
        let transaction = self
            .transaction_store
            .get(&key, store_options)
            .await?
            .filter(|transaction| transaction.kind == kind && transaction.state == state)
            .ok_or(Error::MissingTransaction)?;

        let tokens = self
            .oauth
            .exchange_code(&code, &transaction.redirect_uri, &transaction.code_verifier)
            .await?;
        let id_token = tokens
            .id_token
            .clone()
            .ok_or_else(|| Error::api(OPERATION, "the token response has no id_token"))?;
        let claims = self
            .verifier
            .verify(&self.oauth, &id_token, ID_TOKEN_CLAIMS)
            .await
            .map_err(|detail| Error::api(OPERATION, detail))?;

        if let Some(expected) = &transaction.nonce {
            let nonce = claims.get("nonce").and_then(serde_json::Value::as_str);
            if nonce != Some(expected.as_str()) {
                return Err(Error::api(OPERATION, "the ID token nonce does not match"));
            }
        }

        Ok((key, transaction, tokens, id_token, claims))
    }

    fn transaction_key(&self, state: &str) -> String {
        format!("{}.{state}", self.config.transaction_identifier)
    }
}

struct Callback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Accepts an absolute callback URL or a path with query.
fn parse_callback(callback_url: &str) -> Result<Callback, Error> {
    let url = Url::parse(callback_url)
        .or_else(|_| Url::parse("http://localhost/").and_then(|base| base.join(callback_url)))
        .map_err(|_| Error::MissingRequiredArgument("callback_url"))?;

    let mut callback = Callback {
        code: None,
        state: None,
        error: None,
        error_description: None,
    };
    for (key, value) in url.query_pairs() {
        let slot = match &*key {
            "code" => &mut callback.code,
            "state" => &mut callback.state,
            "error" => &mut callback.error,
            "error_description" => &mut callback.error_description,
            _ => continue,
        };
        *slot = Some(value.into_owned()).filter(|value| !value.is_empty());
    }
    Ok(callback)
}

fn token_set(tokens: &TokenResponse, audience: String, now: i64) -> TokenSet {
    TokenSet {
        audience,
        access_token: tokens.access_token.clone(),
        expires_at: tokens.expires_at(now),
        scope: tokens.scope.clone(),
    }
}

fn new_session(
    claims: Claims,
    id_token: String,
    tokens: &TokenResponse,
    audience: String,
    now: i64,
) -> StateData {
    let sid = claims
        .get("sid")
        .and_then(serde_json::Value::as_str)
        .map_or_else(random_token, str::to_owned);

    StateData {
        user: claims,
        id_token,
        internal: InternalState {
            sid,
            refresh_token: tokens.refresh_token.clone(),
        },
        token_sets: vec![token_set(tokens, audience, now)],
        connection_token_sets: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ServerClient<MemoryTransactionStore, MemoryStateStore> {
        let config = ServerClientConfig::new(
            "tenant.example.com",
            "client",
            "client-secret",
            "some-secret",
        );
        ServerClient::with_memory_stores(config).unwrap()
    }

    fn state(refresh_token: Option<&str>) -> StateData {
        StateData {
            user: serde_json::json!({ "sub": "user123" })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            id_token: "id".into(),
            internal: InternalState {
                sid: "sid".into(),
                refresh_token: refresh_token.map(str::to_owned),
            },
            token_sets: Vec::new(),
            connection_token_sets: Vec::new(),
        }
    }

    #[test]
    fn empty_secret_is_rejected() {
        let config = ServerClientConfig::new("tenant.example.com", "client", "client-secret", "");
        let result = ServerClient::with_memory_stores(config);
        assert!(matches!(
            result,
            Err(Error::MissingRequiredArgument("secret"))
        ));
    }

    #[tokio::test]
    async fn login_requires_redirect_uri() {
        let err = client()
            .start_interactive_login(StartInteractiveLoginOptions::default(), &StoreOptions::none())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("redirect_uri"));
    }

    #[tokio::test]
    async fn unknown_callback_state_is_missing_transaction() {
        let err = client()
            .complete_interactive_login("https://app.example/callback?code=c&state=s", &StoreOptions::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingTransaction));
    }

    #[tokio::test]
    async fn callback_error_is_reported() {
        let err = client()
            .complete_interactive_login(
                "/callback?error=access_denied&error_description=denied",
                &StoreOptions::none(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.oauth_code(), Some("access_denied"));
    }

    #[tokio::test]
    async fn link_requires_session() {
        let err = client()
            .start_link_user(StartLinkUserOptions::new("github"), &StoreOptions::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StartLinkUser));
    }

    #[tokio::test]
    async fn connection_token_without_refresh_token_fails() {
        let client = client();
        let options = StoreOptions::none();
        client
            .state_store()
            .set("_a0_session", &state(Some("")), &options)
            .await
            .unwrap();

        let err = client
            .get_access_token_for_connection(&ConnectionTokenOptions::new("my_connection"), &options)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AccessTokenForConnection { .. }));
        assert!(err.to_string().contains("refresh token was not found"));
    }

    #[tokio::test]
    async fn cached_connection_token_is_returned() {
        let client = client();
        let options = StoreOptions::none();
        let mut state = state(None);
        state.connection_token_sets.push(ConnectionTokenSet {
            connection: "my_connection".into(),
            access_token: "cached".into(),
            expires_at: now_epoch() + 500,
            scope: None,
        });
        client
            .state_store()
            .set("_a0_session", &state, &options)
            .await
            .unwrap();

        let token = client
            .get_access_token_for_connection(&ConnectionTokenOptions::new("my_connection"), &options)
            .await
            .unwrap();
        assert_eq!(token, "cached");
    }

    #[tokio::test]
    async fn access_token_without_session_fails() {
        let err = client()
            .get_access_token(None, &StoreOptions::none())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::AccessToken {
                code: "missing_refresh_token",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn logout_without_session_still_builds_url() {
        let url = client()
            .logout(
                &LogoutOptions {
                    return_to: Some("/after_logout".into()),
                },
                &StoreOptions::none(),
            )
            .await
            .unwrap();
        assert!(url.starts_with("https://tenant.example.com/v2/logout?"));
        assert!(url.contains("client_id=client"));
        assert!(url.contains("returnTo=%2Fafter_logout"));
    }

    #[tokio::test]
    async fn empty_logout_token_is_rejected() {
        let err = client()
            .handle_backchannel_logout("", &StoreOptions::none())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing logout token"));
    }

    #[test]
    fn relative_callback_is_parsed() {
        let callback = parse_callback("/auth/callback?code=abc&state=xyz").unwrap();
        assert_eq!(callback.code.as_deref(), Some("abc"));
        assert_eq!(callback.state.as_deref(), Some("xyz"));
        assert!(callback.error.is_none());
    }
}
