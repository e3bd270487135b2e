//! Plug-and-play authentication routes for Axum.
//!
//! Mounts the login, callback, logout and backchannel-logout endpoints (and
//! optionally the account-linking ones) on top of a [`ServerClient`], with
//! transactions and sessions sealed into cookies.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use auth0_server::ServerClientConfig;
//! use auth0_server::middleware::{AuthConfig, auth_routes};
//!
//! // 1. Configure from environment
//! let auth = AuthConfig::from_env()?;
//! let client = auth.cookie_client(ServerClientConfig::from_env()?)?;
//!
//! // 2. Mount auth routes
//! let app = axum::Router::new().merge(auth_routes(auth, client));
//! ```
//!
//! [`ServerClient`]: crate::ServerClient

mod config;
mod error;
mod extractor;
mod routes;
mod state;

pub use config::AuthConfig;
pub use error::AuthError;
pub use extractor::AuthUser;
pub use routes::auth_routes;
