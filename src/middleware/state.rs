use std::sync::Arc;

use axum::http::HeaderMap;
use axum_extra::extract::CookieJar;

use super::config::AuthSettings;
use super::error::AuthError;
use crate::client::ServerClient;
use crate::store::{CookieBuffer, StoreOptions};

/// Shared state for auth route handlers.
pub(super) struct AuthState<T, S> {
    pub(super) client: Arc<ServerClient<T, S>>,
    pub(super) settings: Arc<AuthSettings>,
}

// Manual Clone: avoid derive adding `T: Clone, S: Clone` bounds.
impl<T, S> Clone for AuthState<T, S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            settings: self.settings.clone(),
        }
    }
}

/// Store options for one request, reading from the request cookies.
///
/// Return `buffer.jar()` with the response to emit the queued cookie changes.
pub(super) fn request_store(headers: &HeaderMap) -> (CookieBuffer, StoreOptions) {
    let buffer = CookieBuffer::new(CookieJar::from_headers(headers));
    let options = StoreOptions::none().with_cookies(buffer.clone());
    (buffer, options)
}

/// Handler result that carries the queued cookie changes on failure as well.
pub(super) type CookieResult<T> = Result<(CookieJar, T), (CookieJar, AuthError)>;

/// `map_err` adapter pairing an error with the buffer's cookie changes.
pub(super) fn with_jar<E: Into<AuthError>>(
    buffer: &CookieBuffer,
) -> impl FnOnce(E) -> (CookieJar, AuthError) + '_ {
    move |error| (buffer.jar(), error.into())
}
