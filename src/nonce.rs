use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Generates the per-attempt anti-forgery `state` value.
///
/// Returns a 22-character URL-safe string (16 random bytes → base64url).
/// Echoed back by the provider and required on every accepted callback
/// message.
#[must_use]
pub fn generate_state() -> String {
    let random_bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Generates the raw `nonce` bound into the provider's `id_token`.
///
/// Returns a 43-character URL-safe string (32 random bytes).
#[must_use]
pub fn generate_nonce() -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Hashes a raw nonce for the authorization request.
///
/// `hashed = BASE64URL(SHA256(nonce))`. Only the hash goes into the
/// authorization URL; the raw value stays with the attempt (see
/// [`SignInTransport::nonce`](crate::transport::SignInTransport::nonce)) and
/// matches the `nonce` claim once hashed.
#[must_use]
pub fn hash_nonce(nonce: &str) -> String {
    let hash = Sha256::digest(nonce.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}
