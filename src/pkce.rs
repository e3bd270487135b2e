use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

/// PKCE challenge method sent with every authorization request.
pub const CHALLENGE_METHOD: &str = "S256";

/// A PKCE verifier and its derived S256 challenge.
///
/// The verifier stays server-side in the transaction record; only the
/// challenge is placed on the authorization URL.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// Generates a fresh 64-character verifier (RFC 7636 allows 43-128).
    #[must_use]
    pub fn generate() -> Self {
        let random_bytes: [u8; 48] = rand::rng().random();
        let verifier = URL_SAFE_NO_PAD.encode(random_bytes);
        let challenge = code_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

/// `BASE64URL(SHA256(verifier))`
#[must_use]
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Random URL-safe token for `state`, `nonce` and session ids (22 chars).
#[must_use]
pub fn random_token() -> String {
    let random_bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}
