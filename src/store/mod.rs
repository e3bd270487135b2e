//! Persistence contracts for flow state and session state.
//!
//! Both stores seal their records (see [`crate::seal`]) and self-heal: a
//! record that fails to unseal is deleted and reported as absent.

use std::future::Future;
use std::sync::Arc;

use crate::error::Error;
use crate::types::{LogoutTokenClaims, StateData, TransactionData};

#[cfg(feature = "axum")]
pub mod cookie;
pub mod memory;

pub use crate::seal::Unsealed;
#[cfg(feature = "axum")]
pub use cookie::{CookieBuffer, CookieStateStore, CookieTransactionStore};
pub use memory::{MemoryStateStore, MemoryTransactionStore};

/// Fixed lifetime of a login/link transaction, in seconds.
pub const TRANSACTION_DURATION_SECS: i64 = 60;

/// Default lifetime of a session, in seconds (3 days).
pub const DEFAULT_SESSION_DURATION_SECS: i64 = 259_200;

/// Per-request context handed through to store calls.
///
/// The engine never reads it; stores that persist into the HTTP exchange
/// (cookies) take their request/response handle from here.
#[derive(Clone, Default)]
pub struct StoreOptions {
    #[cfg(feature = "axum")]
    cookies: Option<CookieBuffer>,
}

impl std::fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreOptions").finish_non_exhaustive()
    }
}

impl StoreOptions {
    /// Options carrying no request context (enough for server-side stores).
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    #[cfg(feature = "axum")]
    #[must_use]
    pub fn with_cookies(mut self, cookies: CookieBuffer) -> Self {
        self.cookies = Some(cookies);
        self
    }

    /// Cookie buffer of the current request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreOptions`] when the caller did not attach one.
    #[cfg(feature = "axum")]
    pub fn cookies(&self) -> Result<&CookieBuffer, Error> {
        self.cookies.as_ref().ok_or_else(|| {
            Error::StoreOptions("a cookie buffer is required in the store options".into())
        })
    }
}

/// Storage for short-lived, single-use login/link transactions.
pub trait TransactionStore: Send + Sync + 'static {
    /// Seal and persist `data` under `identifier`.
    fn set(
        &self,
        identifier: &str,
        data: &TransactionData,
        options: &StoreOptions,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Load the transaction, or `None` when absent, expired, or corrupt.
    fn get(
        &self,
        identifier: &str,
        options: &StoreOptions,
    ) -> impl Future<Output = Result<Option<TransactionData>, Error>> + Send;

    /// Remove the transaction. Absent records are not an error.
    fn delete(
        &self,
        identifier: &str,
        options: &StoreOptions,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Storage for long-lived session state.
pub trait StateStore: Send + Sync + 'static {
    /// Seal and persist `data` under `identifier`.
    fn set(
        &self,
        identifier: &str,
        data: &StateData,
        options: &StoreOptions,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Load the session, or `None` when absent, expired, or corrupt.
    fn get(
        &self,
        identifier: &str,
        options: &StoreOptions,
    ) -> impl Future<Output = Result<Option<StateData>, Error>> + Send;

    /// Remove the session. Absent records are not an error.
    fn delete(
        &self,
        identifier: &str,
        options: &StoreOptions,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Delete every session whose `internal.sid` and `user.sub` match `claims`.
    ///
    /// Records that cannot be unsealed during the scan are deleted as well.
    fn delete_by_logout_token(
        &self,
        claims: &LogoutTokenClaims,
        options: &StoreOptions,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

impl<T: TransactionStore> TransactionStore for Arc<T> {
    fn set(
        &self,
        identifier: &str,
        data: &TransactionData,
        options: &StoreOptions,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        (**self).set(identifier, data, options)
    }

    fn get(
        &self,
        identifier: &str,
        options: &StoreOptions,
    ) -> impl Future<Output = Result<Option<TransactionData>, Error>> + Send {
        (**self).get(identifier, options)
    }

    fn delete(
        &self,
        identifier: &str,
        options: &StoreOptions,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        (**self).delete(identifier, options)
    }
}

impl<S: StateStore> StateStore for Arc<S> {
    fn set(
        &self,
        identifier: &str,
        data: &StateData,
        options: &StoreOptions,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        (**self).set(identifier, data, options)
    }

    fn get(
        &self,
        identifier: &str,
        options: &StoreOptions,
    ) -> impl Future<Output = Result<Option<StateData>, Error>> + Send {
        (**self).get(identifier, options)
    }

    fn delete(
        &self,
        identifier: &str,
        options: &StoreOptions,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        (**self).delete(identifier, options)
    }

    fn delete_by_logout_token(
        &self,
        claims: &LogoutTokenClaims,
        options: &StoreOptions,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        (**self).delete_by_logout_token(claims, options)
    }
}
