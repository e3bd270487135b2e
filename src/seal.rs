//! Sealed record primitive shared by every store.
//!
//! A record is the JSON envelope `{"exp": <epoch seconds>, "data": <payload>}`
//! encrypted by a [`Sealer`]. Expiry lives inside the seal: a record past its
//! `exp` unseals exactly like a tampered one, so stores never keep separate
//! TTL bookkeeping.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::Error;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const KEY_INFO: &[u8] = b"auth0-server sealed record v1";

/// Encryption capability injected into the stores.
///
/// `identifier` is the record key; implementations bind it into the
/// ciphertext so a sealed value cannot be replayed under another key.
pub trait Sealer: Send + Sync + 'static {
    /// Encrypts `plaintext` for storage under `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Seal`] if encryption fails.
    fn seal(&self, identifier: &str, plaintext: &[u8]) -> Result<String, Error>;

    /// Decrypts a value produced by [`seal`](Sealer::seal).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Seal`] if the value is malformed, tampered with, or
    /// was sealed under another identifier or secret.
    fn unseal(&self, identifier: &str, sealed: &str) -> Result<Vec<u8>, Error>;
}

/// ChaCha20-Poly1305 sealer keyed by HKDF-SHA256(secret, salt = identifier).
#[derive(Clone)]
pub struct ChaChaSealer {
    secret: Vec<u8>,
}

impl std::fmt::Debug for ChaChaSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaChaSealer").finish_non_exhaustive()
    }
}

impl ChaChaSealer {
    #[must_use]
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn cipher(&self, identifier: &str) -> Result<ChaCha20Poly1305, Error> {
        let hk = Hkdf::<Sha256>::new(Some(identifier.as_bytes()), &self.secret);
        let mut key = [0u8; 32];
        hk.expand(KEY_INFO, &mut key)
            .map_err(|e| Error::Seal(format!("key derivation: {e}")))?;
        ChaCha20Poly1305::new_from_slice(&key).map_err(|e| Error::Seal(e.to_string()))
    }
}

impl Sealer for ChaChaSealer {
    fn seal(&self, identifier: &str, plaintext: &[u8]) -> Result<String, Error> {
        let cipher = self.cipher(identifier)?;
        let nonce: [u8; NONCE_SIZE] = rand::rng().random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::Seal(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    fn unseal(&self, identifier: &str, sealed: &str) -> Result<Vec<u8>, Error> {
        let bytes = URL_SAFE_NO_PAD
            .decode(sealed)
            .map_err(|_| Error::Seal("invalid encoding".into()))?;
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Seal("sealed value too short".into()));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        self.cipher(identifier)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Seal("authentication failed".into()))
    }
}

/// Outcome of reading one sealed record.
///
/// Stores collapse this to `Option<T>` at their public boundary; `Corrupt`
/// always triggers deletion of the record first.
#[derive(Debug, Clone, PartialEq)]
pub enum Unsealed<T> {
    Found(T),
    NotFound,
    /// Undecryptable, undecodable, or expired.
    Corrupt,
}

impl<T> Unsealed<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Found(data) => Some(data),
            Self::NotFound | Self::Corrupt => None,
        }
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    exp: i64,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    exp: i64,
    data: T,
}

/// Serializes `data` with its absolute expiry and seals it.
pub fn seal_record<T: Serialize>(
    sealer: &dyn Sealer,
    identifier: &str,
    data: &T,
    expires_at: i64,
) -> Result<String, Error> {
    let plaintext = serde_json::to_vec(&EnvelopeRef {
        exp: expires_at,
        data,
    })
    .map_err(|e| Error::Seal(format!("serialize: {e}")))?;
    sealer.seal(identifier, &plaintext)
}

/// Unseals a stored value, rejecting envelopes whose `exp` is not after `now`.
pub fn unseal_record<T: DeserializeOwned>(
    sealer: &dyn Sealer,
    identifier: &str,
    sealed: Option<&str>,
    now: i64,
) -> Unsealed<T> {
    let Some(sealed) = sealed.filter(|value| !value.is_empty()) else {
        return Unsealed::NotFound;
    };
    let Ok(plaintext) = sealer.unseal(identifier, sealed) else {
        return Unsealed::Corrupt;
    };
    match serde_json::from_slice::<Envelope<T>>(&plaintext) {
        Ok(envelope) if envelope.exp > now => Unsealed::Found(envelope.data),
        _ => Unsealed::Corrupt,
    }
}
