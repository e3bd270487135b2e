//! In-process stores. Suitable for tests and single-instance deployments.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use super::{
    DEFAULT_SESSION_DURATION_SECS, StateStore, StoreOptions, TRANSACTION_DURATION_SECS,
    TransactionStore,
};
use crate::error::Error;
use crate::seal::{ChaChaSealer, Sealer, Unsealed, seal_record, unseal_record};
use crate::types::{LogoutTokenClaims, StateData, TransactionData, now_epoch};

/// A sealed value plus its expiry, kept in the clear so `put` can prune.
struct Record {
    sealed: String,
    expires_at: i64,
}

/// Map of identifier to sealed record.
struct SealedRecords {
    records: RwLock<HashMap<String, Record>>,
    sealer: Arc<dyn Sealer>,
}

impl SealedRecords {
    fn new(sealer: Arc<dyn Sealer>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            sealer,
        }
    }

    /// Seals and stores `data`, dropping every record already past its expiry.
    async fn put<T: Serialize>(&self, identifier: &str, data: &T, ttl: i64) -> Result<(), Error> {
        let now = now_epoch();
        let expires_at = now.saturating_add(ttl);
        let sealed = seal_record(&*self.sealer, identifier, data, expires_at)?;

        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        let pruned = before - records.len();
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned expired records");
        }
        records.insert(identifier.to_owned(), Record { sealed, expires_at });
        Ok(())
    }

    async fn read<T: DeserializeOwned>(&self, identifier: &str) -> Unsealed<T> {
        let sealed = self.snapshot(identifier).await;
        let outcome = unseal_record(&*self.sealer, identifier, sealed.as_deref(), now_epoch());
        if let (Unsealed::Corrupt, Some(sealed)) = (&outcome, sealed.as_deref()) {
            // A `set` may have replaced the record while it was being unsealed.
            if self.remove_if_unchanged(identifier, sealed).await {
                tracing::warn!(identifier, "Discarded record that failed to unseal");
            }
        }
        outcome
    }

    async fn remove(&self, identifier: &str) {
        self.records.write().await.remove(identifier);
    }

    /// Removes `identifier` only if it still holds `expected`.
    async fn remove_if_unchanged(&self, identifier: &str, expected: &str) -> bool {
        let mut records = self.records.write().await;
        if records
            .get(identifier)
            .is_some_and(|current| current.sealed == expected)
        {
            records.remove(identifier);
            return true;
        }
        false
    }

    async fn snapshot(&self, identifier: &str) -> Option<String> {
        self.records
            .read()
            .await
            .get(identifier)
            .map(|record| record.sealed.clone())
    }

    async fn identifiers(&self) -> Vec<String> {
        self.records.read().await.keys().cloned().collect()
    }

    async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

/// In-memory [`TransactionStore`] with the fixed 60 second transaction lifetime.
pub struct MemoryTransactionStore {
    records: SealedRecords,
}

impl MemoryTransactionStore {
    /// Store sealing records with [`ChaChaSealer`] under `secret`.
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self::with_sealer(Arc::new(ChaChaSealer::new(secret)))
    }

    #[must_use]
    pub fn with_sealer(sealer: Arc<dyn Sealer>) -> Self {
        Self {
            records: SealedRecords::new(sealer),
        }
    }

    /// Number of stored records. Expired ones linger until the next `set`.
    pub async fn len(&self) -> usize {
        self.records.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl TransactionStore for MemoryTransactionStore {
    async fn set(
        &self,
        identifier: &str,
        data: &TransactionData,
        _options: &StoreOptions,
    ) -> Result<(), Error> {
        self.records
            .put(identifier, data, TRANSACTION_DURATION_SECS)
            .await
    }

    async fn get(
        &self,
        identifier: &str,
        _options: &StoreOptions,
    ) -> Result<Option<TransactionData>, Error> {
        Ok(self.records.read(identifier).await.into_option())
    }

    async fn delete(&self, identifier: &str, _options: &StoreOptions) -> Result<(), Error> {
        self.records.remove(identifier).await;
        Ok(())
    }
}

/// In-memory [`StateStore`] with a configurable absolute session lifetime.
pub struct MemoryStateStore {
    records: SealedRecords,
    duration: i64,
}

impl MemoryStateStore {
    /// Store sealing records with [`ChaChaSealer`] under `secret`; sessions last 3 days.
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self::with_sealer(Arc::new(ChaChaSealer::new(secret)))
    }

    #[must_use]
    pub fn with_sealer(sealer: Arc<dyn Sealer>) -> Self {
        Self {
            records: SealedRecords::new(sealer),
            duration: DEFAULT_SESSION_DURATION_SECS,
        }
    }

    /// Override the session lifetime, in seconds.
    #[must_use]
    pub fn with_duration(mut self, seconds: i64) -> Self {
        self.duration = seconds;
        self
    }

    pub async fn len(&self) -> usize {
        self.records.len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl StateStore for MemoryStateStore {
    async fn set(
        &self,
        identifier: &str,
        data: &StateData,
        _options: &StoreOptions,
    ) -> Result<(), Error> {
        self.records.put(identifier, data, self.duration).await
    }

    async fn get(
        &self,
        identifier: &str,
        _options: &StoreOptions,
    ) -> Result<Option<StateData>, Error> {
        Ok(self.records.read(identifier).await.into_option())
    }

    async fn delete(&self, identifier: &str, _options: &StoreOptions) -> Result<(), Error> {
        self.records.remove(identifier).await;
        Ok(())
    }

    async fn delete_by_logout_token(
        &self,
        claims: &LogoutTokenClaims,
        _options: &StoreOptions,
    ) -> Result<(), Error> {
        let mut deleted = 0usize;

        // One record at a time: the lock is never held across an unseal.
        for identifier in self.records.identifiers().await {
            let Some(sealed) = self.records.snapshot(&identifier).await else {
                continue;
            };
            let matches = match unseal_record::<StateData>(
                &*self.records.sealer,
                &identifier,
                Some(&sealed),
                now_epoch(),
            ) {
                Unsealed::Found(state) => {
                    state.internal.sid == claims.sid && state.subject() == Some(claims.sub.as_str())
                }
                Unsealed::Corrupt => true,
                Unsealed::NotFound => false,
            };
            if matches && self.records.remove_if_unchanged(&identifier, &sealed).await {
                deleted += 1;
            }
        }

        tracing::info!(deleted, "Sessions removed by backchannel logout");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{OnceLock, Weak};

    use super::*;
    use crate::types::{InternalState, TokenSet, TransactionKind};

    /// Sealer whose first `unseal` stores a fresh session under the same key
    /// before failing, the way a concurrent `set` would.
    struct InterleavedWriteSealer {
        inner: ChaChaSealer,
        store: OnceLock<Weak<MemoryStateStore>>,
        fired: AtomicBool,
    }

    impl Sealer for InterleavedWriteSealer {
        fn seal(&self, identifier: &str, plaintext: &[u8]) -> Result<String, Error> {
            self.inner.seal(identifier, plaintext)
        }

        fn unseal(&self, identifier: &str, sealed: &str) -> Result<Vec<u8>, Error> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                let store = self.store.get().and_then(Weak::upgrade).unwrap();
                let expires_at = now_epoch() + 3600;
                let fresh =
                    seal_record(&self.inner, identifier, &state("user1", "fresh"), expires_at)
                        .unwrap();
                store
                    .records
                    .records
                    .try_write()
                    .unwrap()
                    .insert(identifier.into(), Record { sealed: fresh, expires_at });
                return Err(Error::Seal("authentication failed".into()));
            }
            self.inner.unseal(identifier, sealed)
        }
    }

    fn state(sub: &str, sid: &str) -> StateData {
        let user = serde_json::json!({ "sub": sub })
            .as_object()
            .cloned()
            .unwrap_or_default();
        StateData {
            user,
            id_token: "id_token".into(),
            internal: InternalState {
                sid: sid.into(),
                refresh_token: Some("rt".into()),
            },
            token_sets: vec![TokenSet {
                audience: "default".into(),
                access_token: "at".into(),
                expires_at: 4_000_000_000,
                scope: Some("openid".into()),
            }],
            connection_token_sets: Vec::new(),
        }
    }

    fn raw(sealed: &str) -> Record {
        Record {
            sealed: sealed.into(),
            expires_at: i64::MAX,
        }
    }

    fn transaction() -> TransactionData {
        TransactionData {
            code_verifier: "verifier".into(),
            state: "state".into(),
            nonce: Some("nonce".into()),
            app_state: None,
            audience: None,
            organization: None,
            redirect_uri: "https://app.example/callback".into(),
            kind: TransactionKind::Login,
        }
    }

    #[tokio::test]
    async fn state_round_trip() {
        let store = MemoryStateStore::new("secret");
        let options = StoreOptions::none();
        let data = state("user1", "sid1");

        store.set("_a0_session", &data, &options).await.unwrap();
        let loaded = store.get("_a0_session", &options).await.unwrap();

        assert_eq!(loaded, Some(data));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryTransactionStore::new("secret");
        let options = StoreOptions::none();
        store.set("tx", &transaction(), &options).await.unwrap();

        store.delete("tx", &options).await.unwrap();
        store.delete("tx", &options).await.unwrap();

        assert!(store.get("tx", &options).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_record_is_deleted_on_read() {
        let store = MemoryStateStore::new("secret");
        store
            .records
            .records
            .write()
            .await
            .insert("_a0_session".into(), raw("garbage"));

        let loaded = store
            .get("_a0_session", &StoreOptions::none())
            .await
            .unwrap();

        assert!(loaded.is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn expired_session_reads_as_absent() {
        let store = MemoryStateStore::new("secret").with_duration(0);
        let options = StoreOptions::none();
        store
            .set("_a0_session", &state("u", "s"), &options)
            .await
            .unwrap();

        assert!(store.get("_a0_session", &options).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn logout_token_deletes_only_matching_sessions() {
        let store = MemoryStateStore::new("secret");
        let options = StoreOptions::none();
        store.set("a", &state("user1", "sid1"), &options).await.unwrap();
        store.set("b", &state("user1", "sid2"), &options).await.unwrap();
        store.set("c", &state("user2", "sid1"), &options).await.unwrap();

        let claims = LogoutTokenClaims {
            sub: "user1".into(),
            sid: "sid1".into(),
        };
        store.delete_by_logout_token(&claims, &options).await.unwrap();

        assert!(store.get("a", &options).await.unwrap().is_none());
        assert!(store.get("b", &options).await.unwrap().is_some());
        assert!(store.get("c", &options).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn logout_scan_removes_undecryptable_records() {
        let store = MemoryStateStore::new("secret");
        let options = StoreOptions::none();
        store.set("keep", &state("user9", "sid9"), &options).await.unwrap();
        store
            .records
            .records
            .write()
            .await
            .insert("broken".into(), raw("not-a-seal"));

        let claims = LogoutTokenClaims {
            sub: "user1".into(),
            sid: "sid1".into(),
        };
        store.delete_by_logout_token(&claims, &options).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert!(store.get("keep", &options).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn records_are_bound_to_their_identifier() {
        let store = MemoryTransactionStore::new("secret");
        let options = StoreOptions::none();
        store.set("tx.one", &transaction(), &options).await.unwrap();

        let sealed = store.records.snapshot("tx.one").await.unwrap();
        store
            .records
            .records
            .write()
            .await
            .insert("tx.two".into(), raw(&sealed));

        assert!(store.get("tx.two", &options).await.unwrap().is_none());
        assert!(store.get("tx.one", &options).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn self_heal_keeps_record_written_during_unseal() {
        let sealer = Arc::new(InterleavedWriteSealer {
            inner: ChaChaSealer::new("secret"),
            store: OnceLock::new(),
            fired: AtomicBool::new(false),
        });
        let store = Arc::new(MemoryStateStore::with_sealer(sealer.clone()));
        sealer.store.set(Arc::downgrade(&store)).ok();
        store
            .records
            .records
            .write()
            .await
            .insert("_a0_session".into(), raw("garbage"));
        let options = StoreOptions::none();

        assert!(store.get("_a0_session", &options).await.unwrap().is_none());

        let fresh = store.get("_a0_session", &options).await.unwrap().unwrap();
        assert_eq!(fresh.internal.sid, "fresh");
    }

    #[tokio::test]
    async fn expired_transactions_are_pruned_on_write() {
        let store = MemoryTransactionStore::new("secret");
        let options = StoreOptions::none();
        let abandoned = seal_record(&*store.records.sealer, "tx.old", &transaction(), 1).unwrap();
        store.records.records.write().await.insert(
            "tx.old".into(),
            Record {
                sealed: abandoned,
                expires_at: 1,
            },
        );
        store.set("tx.live", &transaction(), &options).await.unwrap();

        store.set("tx.new", &transaction(), &options).await.unwrap();

        assert_eq!(store.len().await, 2);
        assert!(store.records.snapshot("tx.old").await.is_none());
        assert!(store.get("tx.live", &options).await.unwrap().is_some());
    }
}
