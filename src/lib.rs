#![doc = include_str!("../README.md")]

pub mod client;
pub mod config;
pub mod error;
mod jwt;
#[cfg(feature = "axum")]
pub mod middleware;
pub mod oauth;
pub mod pkce;
pub mod seal;
pub mod store;
pub mod types;

// Re-exports for convenient access
pub use client::ServerClient;
pub use config::{DEFAULT_AUDIENCE, DEFAULT_SCOPE, ServerClientConfig};
pub use error::Error;
pub use jwt::BACKCHANNEL_LOGOUT_EVENT;
pub use oauth::{ClientAssertion, OAuthClient, OidcMetadata, TokenResponse};
pub use seal::{ChaChaSealer, Sealer};
pub use store::{
    MemoryStateStore, MemoryTransactionStore, StateStore, StoreOptions, TransactionStore,
    Unsealed,
};
#[cfg(feature = "axum")]
pub use store::{CookieBuffer, CookieStateStore, CookieTransactionStore};
pub use types::{
    Claims, ConnectionTokenOptions, ConnectionTokenSet, InternalState, LoginBackchannelOptions,
    LoginOutcome, LogoutOptions, LogoutTokenClaims, SessionData, StartInteractiveLoginOptions,
    StartLinkUserOptions, StateData, TokenSet, TransactionData, TransactionKind,
};
