use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use url::Url;

use crate::error::Error;
use crate::pkce::random_token;
use crate::types::now_epoch;

/// Lifetime assumed when a token response carries no `expires_in`.
const DEFAULT_EXPIRES_IN: i64 = 3600;

const CIBA_GRANT: &str = "urn:openid:params:grant-type:ciba";
const CONNECTION_GRANT: &str =
    "urn:auth0:params:oauth:grant-type:token-exchange:federated-connection-access-token";
const REFRESH_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:refresh_token";
const CONNECTION_TOKEN_TYPE: &str =
    "http://auth0.com/oauth/token-type/federated-connection-access-token";
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Lifetime of a signed client assertion, in seconds.
const CLIENT_ASSERTION_LIFETIME_SECS: i64 = 60;

/// Upper bounds on the provider-supplied CIBA expiry and polling interval.
const BACKCHANNEL_MAX_WAIT_SECS: u64 = 3600;
const BACKCHANNEL_MAX_INTERVAL_SECS: u64 = 60;

/// OpenID Connect discovery document, as far as the engine uses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct OidcMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_session_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pushed_authorization_request_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backchannel_authentication_endpoint: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Token endpoint response shared by every grant.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Absolute expiry of the access token relative to `now` (epoch seconds).
    #[must_use]
    pub fn expires_at(&self, now: i64) -> i64 {
        now.saturating_add(self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN))
    }
}

#[derive(Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct PushedAuthorizationResponse {
    request_uri: String,
}

#[derive(Deserialize)]
struct BackchannelAuthResponse {
    auth_req_id: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    interval: Option<u64>,
}

/// Signing key for `private_key_jwt` client authentication.
///
/// When configured, token and PAR requests carry a short-lived JWT signed
/// with this key instead of the client secret.
#[derive(Clone)]
pub struct ClientAssertion {
    key: EncodingKey,
    algorithm: Algorithm,
}

impl std::fmt::Debug for ClientAssertion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAssertion")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl ClientAssertion {
    #[must_use]
    pub fn new(key: EncodingKey, algorithm: Algorithm) -> Self {
        Self { key, algorithm }
    }

    /// Parses a PEM-encoded private key for `algorithm` (RS*, PS*, ES* or EdDSA).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientAssertion`] if the key does not parse or the
    /// algorithm is not asymmetric.
    pub fn from_pem(pem: &[u8], algorithm: Algorithm) -> Result<Self, Error> {
        let key = match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => EncodingKey::from_rsa_pem(pem),
            Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(pem),
            Algorithm::EdDSA => EncodingKey::from_ed_pem(pem),
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                return Err(Error::ClientAssertion(format!(
                    "{algorithm:?} is not a private key algorithm"
                )));
            }
        }
        .map_err(|e| Error::ClientAssertion(format!("invalid signing key: {e}")))?;
        Ok(Self::new(key, algorithm))
    }

    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Signs an assertion identifying `client_id` to `audience`.
    fn sign(&self, client_id: &str, audience: &str) -> Result<String, Error> {
        let now = now_epoch();
        let claims = serde_json::json!({
            "iss": client_id,
            "sub": client_id,
            "aud": audience,
            "iat": now,
            "exp": now + CLIENT_ASSERTION_LIFETIME_SECS,
            "jti": random_token(),
        });
        encode(&Header::new(self.algorithm), &claims, &self.key)
            .map_err(|e| Error::ClientAssertion(e.to_string()))
    }
}

/// Client for the identity provider's discovery, authorization and token endpoints.
///
/// Authenticates with `client_secret_post`, or with `private_key_jwt` once a
/// [`ClientAssertion`] is set. The discovery document is fetched once and
/// cached for the life of the client.
pub struct OAuthClient {
    base_url: Url,
    client_id: String,
    client_secret: String,
    assertion: Option<ClientAssertion>,
    http: reqwest::Client,
    metadata: OnceCell<OidcMetadata>,
}

impl OAuthClient {
    #[must_use]
    pub fn new(
        base_url: Url,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            base_url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            assertion: None,
            http,
            metadata: OnceCell::new(),
        }
    }

    /// Authenticate with a signed client assertion instead of the secret.
    #[must_use]
    pub fn with_client_assertion(mut self, assertion: ClientAssertion) -> Self {
        self.assertion = Some(assertion);
        self
    }

    /// Tenant base URL, always ending in `/`.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Client secret, unless the client authenticates by assertion only.
    pub(crate) fn client_secret(&self) -> Option<&str> {
        Some(self.client_secret.as_str()).filter(|secret| !secret.is_empty())
    }

    /// Resolves (and caches) the OIDC discovery document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] if the document cannot be fetched or parsed.
    pub async fn metadata(&self) -> Result<&OidcMetadata, Error> {
        self.metadata
            .get_or_try_init(|| self.fetch_metadata())
            .await
    }

    async fn fetch_metadata(&self) -> Result<OidcMetadata, Error> {
        const OPERATION: &str = "metadata discovery";
        let url = self
            .base_url
            .join(".well-known/openid-configuration")
            .map_err(|e| Error::api(OPERATION, e))?;

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::api(OPERATION, e))?;
        let response = Self::ensure_success(response, OPERATION).await?;
        let metadata: OidcMetadata = response
            .json()
            .await
            .map_err(|e| Error::api(OPERATION, e))?;

        tracing::debug!(issuer = %metadata.issuer, "Resolved OIDC metadata");
        Ok(metadata)
    }

    /// Fetches the signing keys advertised at `jwks_uri`.
    pub(crate) async fn fetch_jwks(&self) -> Result<JwkSet, Error> {
        const OPERATION: &str = "jwks fetch";
        let jwks_uri = self
            .metadata()
            .await?
            .jwks_uri
            .clone()
            .ok_or_else(|| Error::api(OPERATION, "the discovery document has no jwks_uri"))?;

        let response = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| Error::api(OPERATION, e))?;
        let response = Self::ensure_success(response, OPERATION).await?;
        response.json().await.map_err(|e| Error::api(OPERATION, e))
    }

    /// Builds the authorization URL for `params`.
    ///
    /// With `pushed` set, the parameters are first posted to the
    /// pushed-authorization-request endpoint and the URL carries only
    /// `client_id` and the returned `request_uri`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] on discovery or PAR failure.
    pub async fn authorization_url(
        &self,
        params: &BTreeMap<String, String>,
        pushed: bool,
    ) -> Result<String, Error> {
        let metadata = self.metadata().await?;
        let mut url = Url::parse(&metadata.authorization_endpoint).map_err(|e| {
            Error::api("metadata discovery", format!("invalid authorization_endpoint: {e}"))
        })?;

        if pushed {
            let request_uri = self.push_authorization_request(metadata, params).await?;
            url.query_pairs_mut()
                .append_pair("client_id", &self.client_id)
                .append_pair("request_uri", &request_uri);
        } else {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.client_id);
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }

        Ok(url.into())
    }

    async fn push_authorization_request(
        &self,
        metadata: &OidcMetadata,
        params: &BTreeMap<String, String>,
    ) -> Result<String, Error> {
        const OPERATION: &str = "pushed authorization request";
        let endpoint = metadata
            .pushed_authorization_request_endpoint
            .as_deref()
            .ok_or_else(|| {
                Error::api(OPERATION, "the identity provider does not support PAR")
            })?;

        let mut form = self.client_credentials()?;
        form.extend(params.iter().map(|(k, v)| (k.as_str(), v.clone())));

        let response = self
            .http
            .post(endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::api(OPERATION, e))?;
        let response = Self::ensure_success(response, OPERATION).await?;
        let par: PushedAuthorizationResponse = response
            .json()
            .await
            .map_err(|e| Error::api(OPERATION, e))?;
        Ok(par.request_uri)
    }

    /// Exchanges an authorization code for tokens using the PKCE verifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] on network failure or a token endpoint error.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, Error> {
        let form = vec![
            ("grant_type", "authorization_code".to_owned()),
            ("code", code.to_owned()),
            ("redirect_uri", redirect_uri.to_owned()),
            ("code_verifier", code_verifier.to_owned()),
        ];
        self.token_request("token exchange", form).await
    }

    /// Redeems a refresh token, optionally for a specific audience.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] on network failure or a token endpoint error.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        audience: Option<&str>,
    ) -> Result<TokenResponse, Error> {
        let mut form = vec![
            ("grant_type", "refresh_token".to_owned()),
            ("refresh_token", refresh_token.to_owned()),
        ];
        if let Some(audience) = audience {
            form.push(("audience", audience.to_owned()));
        }
        self.token_request("refresh token exchange", form).await
    }

    /// Trades a refresh token for an access token of a federated connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] on network failure or a token endpoint error.
    pub async fn connection_token(
        &self,
        refresh_token: &str,
        connection: &str,
        login_hint: Option<&str>,
    ) -> Result<TokenResponse, Error> {
        let mut form = vec![
            ("grant_type", CONNECTION_GRANT.to_owned()),
            ("subject_token_type", REFRESH_TOKEN_TYPE.to_owned()),
            ("subject_token", refresh_token.to_owned()),
            ("requested_token_type", CONNECTION_TOKEN_TYPE.to_owned()),
            ("connection", connection.to_owned()),
        ];
        if let Some(hint) = login_hint {
            form.push(("login_hint", hint.to_owned()));
        }
        self.token_request("connection token exchange", form).await
    }

    /// Client-initiated backchannel authentication (CIBA).
    ///
    /// Posts the request to the backchannel authentication endpoint, then polls
    /// the token endpoint until the user approves, the provider rejects the
    /// request, or the request expires.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Api`] if the request is rejected, denied, or expires.
    pub async fn backchannel_authentication(
        &self,
        params: Vec<(&str, String)>,
    ) -> Result<TokenResponse, Error> {
        const OPERATION: &str = "backchannel authentication";
        let metadata = self.metadata().await?;
        let endpoint = metadata
            .backchannel_authentication_endpoint
            .as_deref()
            .ok_or_else(|| {
                Error::api(
                    OPERATION,
                    "the identity provider does not support backchannel authentication",
                )
            })?;

        let mut form = self.client_credentials()?;
        form.extend(params);

        let response = self
            .http
            .post(endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::api(OPERATION, e))?;
        let response = Self::ensure_success(response, OPERATION).await?;
        let auth: BackchannelAuthResponse = response
            .json()
            .await
            .map_err(|e| Error::api(OPERATION, e))?;

        let wait = auth
            .expires_in
            .unwrap_or(120)
            .min(BACKCHANNEL_MAX_WAIT_SECS);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
        let mut interval =
            Duration::from_secs(auth.interval.unwrap_or(5).min(BACKCHANNEL_MAX_INTERVAL_SECS));

        loop {
            let poll = vec![
                ("grant_type", CIBA_GRANT.to_owned()),
                ("auth_req_id", auth.auth_req_id.clone()),
            ];
            match self.token_request(OPERATION, poll).await {
                Ok(tokens) => return Ok(tokens),
                Err(err) if err.oauth_code() == Some("authorization_pending") => {}
                Err(err) if err.oauth_code() == Some("slow_down") => {
                    interval += Duration::from_secs(5);
                }
                Err(err) => return Err(err),
            }

            if tokio::time::Instant::now() + interval >= deadline {
                return Err(Error::Api {
                    operation: OPERATION,
                    status: None,
                    code: Some("expired_token".into()),
                    detail: "the backchannel authentication request expired".into(),
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    fn client_credentials(&self) -> Result<Vec<(&str, String)>, Error> {
        let mut form = vec![("client_id", self.client_id.clone())];
        match &self.assertion {
            Some(assertion) => {
                let signed = assertion.sign(&self.client_id, self.base_url.as_str())?;
                form.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_owned()));
                form.push(("client_assertion", signed));
            }
            None => form.push(("client_secret", self.client_secret.clone())),
        }
        Ok(form)
    }

    async fn token_request(
        &self,
        operation: &'static str,
        grant: Vec<(&str, String)>,
    ) -> Result<TokenResponse, Error> {
        let metadata = self.metadata().await?;
        let mut form = self.client_credentials()?;
        form.extend(grant);

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::api(operation, e))?;
        let response = Self::ensure_success(response, operation).await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::api(operation, e))
    }

    /// Checks HTTP response status; returns the response on success or an error
    /// carrying the OAuth `error` code when the body has one.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let (code, detail) = match serde_json::from_str::<OAuthErrorBody>(&body) {
            Ok(parsed) => {
                let detail = parsed
                    .error_description
                    .unwrap_or_else(|| parsed.error.clone());
                (Some(parsed.error), detail)
            }
            Err(_) => (None, body),
        };
        Err(Error::Api {
            operation,
            status: Some(status),
            code,
            detail,
        })
    }
}
