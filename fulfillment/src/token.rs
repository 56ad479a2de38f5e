//! Capability tokens: opaque random secrets compared only by digest.
//!
//! Possession of the raw token *is* the authorization (accepting a transfer,
//! redeeming a ticket). Only digests are persisted; the raw token is returned
//! to the caller exactly once and is never logged.

use base64::Engine;
use constant_time_eq::constant_time_eq;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// A freshly generated raw token.
///
/// `Debug` is redacted so the secret cannot leak through logging; callers get
/// at the value through [`RawToken::expose`] when handing it to the holder.
#[derive(Clone, PartialEq, Eq)]
pub struct RawToken(String);

impl RawToken {
    /// The secret itself. Hand it to the capability holder, nowhere else.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RawToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawToken(<redacted>)")
    }
}

impl Serialize for RawToken {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// SHA-256 digest of a token, base64url encoded. This is what gets stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenHash(String);

impl TokenHash {
    /// Wrap a digest loaded from storage.
    #[must_use]
    pub const fn from_stored(digest: String) -> Self {
        Self(digest)
    }

    /// Digest string for persistence.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token generation and digesting.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokenCrypto;

impl TokenCrypto {
    /// Generate a 256-bit random token, base64url encoded (43 characters).
    #[must_use]
    pub fn generate() -> RawToken {
        let mut rng = rand::thread_rng();
        let mut random_bytes = [0u8; 32];
        rng.fill_bytes(&mut random_bytes);
        RawToken(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes))
    }

    /// Digest a presented token for storage or lookup.
    #[must_use]
    pub fn hash(raw: &str) -> TokenHash {
        let digest = Sha256::digest(raw.as_bytes());
        TokenHash(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest))
    }

    /// Constant-time comparison of a presented token against a stored digest.
    #[must_use]
    pub fn verify(raw: &str, stored: &TokenHash) -> bool {
        let presented = Self::hash(raw);
        constant_time_eq(presented.0.as_bytes(), stored.0.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique_and_url_safe() {
        let a = TokenCrypto::generate();
        let b = TokenCrypto::generate();
        assert_ne!(a.expose(), b.expose());
        assert_eq!(a.expose().len(), 43);
        assert!(!a.expose().contains(['+', '/', '=']));
    }

    #[test]
    fn hash_round_trip_verifies() {
        let raw = TokenCrypto::generate();
        let stored = TokenCrypto::hash(raw.expose());
        assert!(TokenCrypto::verify(raw.expose(), &stored));
        assert!(!TokenCrypto::verify("wrong-token", &stored));
    }

    #[test]
    fn hash_is_deterministic_and_not_the_token() {
        let stored = TokenCrypto::hash("abc123");
        assert_eq!(stored, TokenCrypto::hash("abc123"));
        assert_ne!(stored.as_str(), "abc123");
    }

    #[test]
    fn debug_never_prints_the_secret() {
        let raw = TokenCrypto::generate();
        let printed = format!("{raw:?}");
        assert!(!printed.contains(raw.expose()));
    }
}
