use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Open JSON object: ID-token claims, caller application state.
pub type Claims = serde_json::Map<String, Value>;

/// Current time as epoch seconds.
pub(crate) fn now_epoch() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Which flow opened a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    #[default]
    Login,
    Link,
}

/// Flow state for one in-flight login or link attempt.
///
/// Written once when the flow starts and consumed by the matching callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionData {
    /// PKCE secret. Never leaves the server.
    pub code_verifier: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_state: Option<Claims>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    /// Redirect URI the authorization request was made with; the code
    /// exchange must repeat it.
    pub redirect_uri: String,
    #[serde(default)]
    pub kind: TransactionKind,
}

/// Cached access token for one audience.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub audience: String,
    pub access_token: String,
    /// Absolute expiry, epoch seconds.
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Cached access token for one federated connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTokenSet {
    pub connection: String,
    pub access_token: String,
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Bookkeeping that is persisted but never exposed through session projections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalState {
    pub sid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Long-lived state of one authenticated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateData {
    pub user: Claims,
    pub id_token: String,
    pub internal: InternalState,
    #[serde(default)]
    pub token_sets: Vec<TokenSet>,
    #[serde(default)]
    pub connection_token_sets: Vec<ConnectionTokenSet>,
}

impl StateData {
    /// Refresh token, treating an empty string as absent.
    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.internal
            .refresh_token
            .as_deref()
            .filter(|token| !token.is_empty())
    }

    /// Subject of the session's user, if the claims carry one.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.user.get("sub").and_then(Value::as_str)
    }

    /// Cached access token for `audience` that is still valid at `now`.
    #[must_use]
    pub fn live_token(&self, audience: &str, now: i64) -> Option<&str> {
        self.token_sets
            .iter()
            .find(|set| set.audience == audience && set.expires_at > now)
            .map(|set| set.access_token.as_str())
    }

    /// Cached access token for `connection` that is still valid at `now`.
    #[must_use]
    pub fn live_connection_token(&self, connection: &str, now: i64) -> Option<&str> {
        self.connection_token_sets
            .iter()
            .find(|set| set.connection == connection && set.expires_at > now)
            .map(|set| set.access_token.as_str())
    }

    /// Replaces the entry for `set.audience`, or appends it when there is none.
    pub fn upsert_token_set(&mut self, set: TokenSet) {
        match self
            .token_sets
            .iter_mut()
            .find(|existing| existing.audience == set.audience)
        {
            Some(existing) => *existing = set,
            None => self.token_sets.push(set),
        }
    }

    /// Replaces the entry for `set.connection`, or appends it when there is none.
    pub fn upsert_connection_token_set(&mut self, set: ConnectionTokenSet) {
        match self
            .connection_token_sets
            .iter_mut()
            .find(|existing| existing.connection == set.connection)
        {
            Some(existing) => *existing = set,
            None => self.connection_token_sets.push(set),
        }
    }
}

/// Session projection handed to callers: everything except `internal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub user: Claims,
    pub id_token: String,
    pub token_sets: Vec<TokenSet>,
    pub connection_token_sets: Vec<ConnectionTokenSet>,
}

impl From<StateData> for SessionData {
    fn from(state: StateData) -> Self {
        Self {
            user: state.user,
            id_token: state.id_token,
            token_sets: state.token_sets,
            connection_token_sets: state.connection_token_sets,
        }
    }
}

/// Claims of a verified backchannel logout token that select sessions to end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogoutTokenClaims {
    pub sub: String,
    pub sid: String,
}

/// Result of a completed login or link callback.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginOutcome {
    /// Application state passed to the start of the flow.
    pub app_state: Option<Claims>,
    pub session: SessionData,
}

/// Options for [`ServerClient::start_interactive_login`](crate::ServerClient::start_interactive_login).
#[derive(Debug, Clone, Default)]
pub struct StartInteractiveLoginOptions {
    /// Extra authorization parameters; override the configured defaults.
    /// `redirect_uri`, `audience` and `organization` are recognized here too.
    pub authorization_params: BTreeMap<String, String>,
    pub app_state: Option<Claims>,
    /// Overrides the configured pushed-authorization-request setting.
    pub pushed_authorization_requests: Option<bool>,
}

impl StartInteractiveLoginOptions {
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.authorization_params.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_app_state(mut self, app_state: Claims) -> Self {
        self.app_state = Some(app_state);
        self
    }
}

/// Options for [`ServerClient::start_link_user`](crate::ServerClient::start_link_user).
#[derive(Debug, Clone, Default)]
pub struct StartLinkUserOptions {
    pub connection: String,
    pub connection_scope: Option<String>,
    pub authorization_params: BTreeMap<String, String>,
    pub app_state: Option<Claims>,
}

impl StartLinkUserOptions {
    #[must_use]
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            ..Self::default()
        }
    }
}

/// Options for [`ServerClient::get_access_token_for_connection`](crate::ServerClient::get_access_token_for_connection).
#[derive(Debug, Clone, Default)]
pub struct ConnectionTokenOptions {
    pub connection: String,
    pub login_hint: Option<String>,
}

impl ConnectionTokenOptions {
    #[must_use]
    pub fn new(connection: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            login_hint: None,
        }
    }
}

/// Options for [`ServerClient::logout`](crate::ServerClient::logout).
#[derive(Debug, Clone, Default)]
pub struct LogoutOptions {
    pub return_to: Option<String>,
}

/// Options for [`ServerClient::login_backchannel`](crate::ServerClient::login_backchannel).
#[derive(Debug, Clone, Default)]
pub struct LoginBackchannelOptions {
    /// Message shown on the user's authentication device.
    pub binding_message: String,
    /// Subject of the user to authenticate.
    pub login_hint_sub: String,
    pub authorization_params: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> StateData {
        StateData {
            user: serde_json::json!({ "sub": "user123" })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            id_token: "id".into(),
            internal: InternalState {
                sid: "sid".into(),
                refresh_token: Some(String::new()),
            },
            token_sets: vec![
                TokenSet {
                    audience: "default".into(),
                    access_token: "a".into(),
                    expires_at: 100,
                    scope: None,
                },
                TokenSet {
                    audience: "api".into(),
                    access_token: "b".into(),
                    expires_at: 100,
                    scope: None,
                },
            ],
            connection_token_sets: Vec::new(),
        }
    }

    #[test]
    fn empty_refresh_token_is_absent() {
        assert_eq!(state().refresh_token(), None);
    }

    #[test]
    fn live_token_requires_strictly_future_expiry() {
        let state = state();
        assert_eq!(state.live_token("default", 99), Some("a"));
        assert_eq!(state.live_token("default", 100), None);
        assert_eq!(state.live_token("missing", 0), None);
    }

    #[test]
    fn upsert_replaces_only_matching_audience() {
        let mut state = state();
        state.upsert_token_set(TokenSet {
            audience: "default".into(),
            access_token: "fresh".into(),
            expires_at: 500,
            scope: Some("read".into()),
        });
        assert_eq!(state.token_sets.len(), 2);
        assert_eq!(state.token_sets[0].access_token, "fresh");
        assert_eq!(state.token_sets[1].access_token, "b");
    }

    #[test]
    fn upsert_connection_appends_new_key() {
        let mut state = state();
        let set = ConnectionTokenSet {
            connection: "github".into(),
            access_token: "gh".into(),
            expires_at: 10,
            scope: None,
        };
        state.upsert_connection_token_set(set.clone());
        state.upsert_connection_token_set(set);
        assert_eq!(state.connection_token_sets.len(), 1);
    }

    #[test]
    fn session_projection_drops_internal() {
        let session = SessionData::from(state());
        let json = serde_json::to_value(&session).unwrap_or_default();
        assert!(json.get("internal").is_none());
        assert_eq!(json["user"]["sub"], "user123");
    }

    #[test]
    fn transaction_kind_defaults_to_login() {
        let tx: TransactionData = serde_json::from_value(serde_json::json!({
            "code_verifier": "v",
            "state": "s",
            "redirect_uri": "https://app.example/callback",
        }))
        .unwrap();
        assert_eq!(tx.kind, TransactionKind::Login);
        assert!(tx.app_state.is_none());
    }
}
