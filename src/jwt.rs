//! Verification of ID tokens and backchannel logout tokens.
//!
//! HMAC-signed tokens are checked against the client secret; asymmetric
//! signatures against the provider's JWKS. The key set is cached and refetched
//! when a token names an unknown `kid`, at most once per refetch interval.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::oauth::OAuthClient;
use crate::types::Claims;

/// `events` member identifying a backchannel logout token.
pub const BACKCHANNEL_LOGOUT_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";

/// Clock skew tolerated on `exp`/`iat`, in seconds.
const LEEWAY_SECS: u64 = 60;

/// Default minimum time between two JWKS fetches.
pub(crate) const DEFAULT_JWKS_REFETCH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct KeyCache {
    jwks: Option<Arc<JwkSet>>,
    fetched_at: Option<Instant>,
}

impl KeyCache {
    fn key(&self, kid: &str) -> Option<Result<DecodingKey, String>> {
        let jwk = self.jwks.as_ref()?.find(kid)?;
        Some(DecodingKey::from_jwk(jwk).map_err(|e| e.to_string()))
    }
}

pub(crate) struct JwtVerifier {
    cache: RwLock<KeyCache>,
    refetch_interval: Duration,
}

impl JwtVerifier {
    pub(crate) fn new(refetch_interval: Duration) -> Self {
        Self {
            cache: RwLock::new(KeyCache::default()),
            refetch_interval,
        }
    }

    /// Verifies signature, issuer and audience; `required` lists the
    /// registered claims that must be present.
    pub(crate) async fn verify(
        &self,
        oauth: &OAuthClient,
        token: &str,
        required: &[&str],
    ) -> Result<Claims, String> {
        let header = decode_header(token).map_err(|e| format!("malformed token: {e}"))?;
        let metadata = oauth.metadata().await.map_err(|e| e.to_string())?;

        let key = match header.alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = oauth
                    .client_secret()
                    .ok_or("HMAC-signed token but no client secret is configured")?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            _ => self.signing_key(oauth, header.kid.as_deref()).await?,
        };

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[metadata.issuer.as_str()]);
        validation.set_audience(&[oauth.client_id()]);
        validation.set_required_spec_claims(required);
        validation.leeway = LEEWAY_SECS;

        decode::<Claims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| format!("invalid token: {e}"))
    }

    async fn signing_key(
        &self,
        oauth: &OAuthClient,
        kid: Option<&str>,
    ) -> Result<DecodingKey, String> {
        let kid = kid.ok_or("token header has no kid")?;

        if let Some(key) = self.cache.read().await.key(kid) {
            return key;
        }

        // Holding the write lock across the fetch collapses concurrent misses
        // into one request.
        let mut cache = self.cache.write().await;
        if let Some(key) = cache.key(kid) {
            return key;
        }
        if cache
            .fetched_at
            .is_some_and(|at| at.elapsed() < self.refetch_interval)
        {
            tracing::debug!(kid, "Unknown kid; JWKS was fetched too recently to refetch");
            return Err(format!("no signing key matches kid '{kid}'"));
        }

        cache.fetched_at = Some(Instant::now());
        let fresh = oauth.fetch_jwks().await.map_err(|e| e.to_string())?;
        tracing::debug!(keys = fresh.keys.len(), "Fetched JWKS");
        cache.jwks = Some(Arc::new(fresh));
        cache
            .key(kid)
            .unwrap_or_else(|| Err(format!("no signing key matches kid '{kid}'")))
    }
}

/// True when the claims carry the backchannel logout event.
pub(crate) fn has_logout_event(claims: &Claims) -> bool {
    claims
        .get("events")
        .and_then(serde_json::Value::as_object)
        .is_some_and(|events| events.contains_key(BACKCHANNEL_LOGOUT_EVENT))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(value: serde_json::Value) -> Claims {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn logout_event_detected() {
        let with_event = claims(serde_json::json!({
            "events": { BACKCHANNEL_LOGOUT_EVENT: {} }
        }));
        assert!(has_logout_event(&with_event));
    }

    #[test]
    fn other_events_rejected() {
        let other = claims(serde_json::json!({
            "events": { "http://schemas.openid.net/event/other": {} }
        }));
        assert!(!has_logout_event(&other));
        assert!(!has_logout_event(&claims(serde_json::json!({ "sub": "x" }))));
    }
}
