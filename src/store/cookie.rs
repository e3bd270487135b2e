//! Stores that keep their sealed records in the browser's cookies.
//!
//! Each request carries a [`CookieBuffer`] in its [`StoreOptions`]; reads
//! come from the request cookies and writes are queued as `Set-Cookie`
//! changes that the handler returns with its response.

use std::sync::{Arc, Mutex, PoisonError};

use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, SameSite};
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::Duration;

use super::{
    DEFAULT_SESSION_DURATION_SECS, StateStore, StoreOptions, TRANSACTION_DURATION_SECS,
    TransactionStore,
};
use crate::error::Error;
use crate::seal::{ChaChaSealer, Sealer, Unsealed, seal_record, unseal_record};
use crate::types::{LogoutTokenClaims, StateData, TransactionData, now_epoch};

/// Request-scoped cookie jar shared between a handler and the stores it calls.
///
/// Cloning is cheap; all clones see the same jar.
#[derive(Clone, Default)]
pub struct CookieBuffer {
    jar: Arc<Mutex<CookieJar>>,
}

impl std::fmt::Debug for CookieBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieBuffer").finish_non_exhaustive()
    }
}

impl CookieBuffer {
    #[must_use]
    pub fn new(jar: CookieJar) -> Self {
        Self {
            jar: Arc::new(Mutex::new(jar)),
        }
    }

    /// Current value of cookie `name`, including changes queued on this buffer.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<String> {
        self.lock().get(name).map(|cookie| cookie.value().to_owned())
    }

    pub fn add(&self, cookie: Cookie<'static>) {
        let mut jar = self.lock();
        *jar = jar.clone().add(cookie);
    }

    pub fn remove(&self, cookie: Cookie<'static>) {
        let mut jar = self.lock();
        *jar = jar.clone().remove(cookie);
    }

    /// Snapshot of the jar, to be returned from the handler so the queued
    /// changes become `Set-Cookie` headers.
    #[must_use]
    pub fn jar(&self) -> CookieJar {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CookieJar> {
        self.jar.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cookie holding one sealed record.
pub(crate) fn record_cookie(
    name: &str,
    sealed: String,
    ttl_secs: i64,
    secure: bool,
) -> Cookie<'static> {
    Cookie::build((name.to_owned(), sealed))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(Duration::seconds(ttl_secs))
        .build()
}

/// Removal cookie for a record.
pub(crate) fn removal_cookie(name: &str) -> Cookie<'static> {
    Cookie::build((name.to_owned(), ""))
        .path("/")
        .max_age(Duration::ZERO)
        .build()
}

/// Sealing and cookie settings shared by both cookie stores.
struct CookieRecords {
    sealer: Arc<dyn Sealer>,
    secure: bool,
}

impl CookieRecords {
    fn put<T: Serialize>(
        &self,
        identifier: &str,
        data: &T,
        ttl: i64,
        options: &StoreOptions,
    ) -> Result<(), Error> {
        let cookies = options.cookies()?;
        let sealed = seal_record(&*self.sealer, identifier, data, now_epoch().saturating_add(ttl))?;
        cookies.add(record_cookie(identifier, sealed, ttl, self.secure));
        Ok(())
    }

    fn read<T: DeserializeOwned>(
        &self,
        identifier: &str,
        options: &StoreOptions,
    ) -> Result<Option<T>, Error> {
        let cookies = options.cookies()?;
        let sealed = cookies.value(identifier);
        let outcome = unseal_record(&*self.sealer, identifier, sealed.as_deref(), now_epoch());
        if matches!(outcome, Unsealed::Corrupt) {
            tracing::warn!(identifier, "Discarding cookie that failed to unseal");
            cookies.remove(removal_cookie(identifier));
        }
        Ok(outcome.into_option())
    }

    fn remove(&self, identifier: &str, options: &StoreOptions) -> Result<(), Error> {
        options.cookies()?.remove(removal_cookie(identifier));
        Ok(())
    }
}

/// [`TransactionStore`] keeping each transaction in its own short-lived cookie.
pub struct CookieTransactionStore {
    records: CookieRecords,
}

impl CookieTransactionStore {
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self::with_sealer(Arc::new(ChaChaSealer::new(secret)))
    }

    #[must_use]
    pub fn with_sealer(sealer: Arc<dyn Sealer>) -> Self {
        Self {
            records: CookieRecords {
                sealer,
                secure: true,
            },
        }
    }

    /// Set the `Secure` attribute on written cookies (default `true`).
    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.records.secure = secure;
        self
    }
}

impl TransactionStore for CookieTransactionStore {
    async fn set(
        &self,
        identifier: &str,
        data: &TransactionData,
        options: &StoreOptions,
    ) -> Result<(), Error> {
        self.records
            .put(identifier, data, TRANSACTION_DURATION_SECS, options)
    }

    async fn get(
        &self,
        identifier: &str,
        options: &StoreOptions,
    ) -> Result<Option<TransactionData>, Error> {
        self.records.read(identifier, options)
    }

    async fn delete(&self, identifier: &str, options: &StoreOptions) -> Result<(), Error> {
        self.records.remove(identifier, options)
    }
}

/// [`StateStore`] keeping the whole session sealed in one cookie.
pub struct CookieStateStore {
    records: CookieRecords,
    duration: i64,
}

impl CookieStateStore {
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self::with_sealer(Arc::new(ChaChaSealer::new(secret)))
    }

    #[must_use]
    pub fn with_sealer(sealer: Arc<dyn Sealer>) -> Self {
        Self {
            records: CookieRecords {
                sealer,
                secure: true,
            },
            duration: DEFAULT_SESSION_DURATION_SECS,
        }
    }

    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.records.secure = secure;
        self
    }

    /// Session lifetime in seconds, for both the seal and the cookie `Max-Age`.
    #[must_use]
    pub fn with_duration(mut self, seconds: i64) -> Self {
        self.duration = seconds;
        self
    }
}

impl StateStore for CookieStateStore {
    async fn set(
        &self,
        identifier: &str,
        data: &StateData,
        options: &StoreOptions,
    ) -> Result<(), Error> {
        self.records.put(identifier, data, self.duration, options)
    }

    async fn get(
        &self,
        identifier: &str,
        options: &StoreOptions,
    ) -> Result<Option<StateData>, Error> {
        self.records.read(identifier, options)
    }

    async fn delete(&self, identifier: &str, options: &StoreOptions) -> Result<(), Error> {
        self.records.remove(identifier, options)
    }

    /// Sessions live in other browsers' cookies and cannot be reached from
    /// here; they expire on their own.
    async fn delete_by_logout_token(
        &self,
        claims: &LogoutTokenClaims,
        _options: &StoreOptions,
    ) -> Result<(), Error> {
        tracing::warn!(
            sid = %claims.sid,
            "Cookie sessions cannot be deleted by backchannel logout"
        );
        Ok(())
    }
}
