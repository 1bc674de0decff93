//! Demo broker - Session token minting and verification
//!
//! A session token is an HMAC of the session id under the configured
//! process secret (spec §3, §4.4, GLOSSARY). The reference stack has no
//! HMAC crate; keyed BLAKE3 hashing under a domain-separated derived key
//! is this crate's substitute, following the same keyed/domain-derived
//! pattern used elsewhere in the corpus for content authentication.

use uuid::Uuid;

const TOKEN_DOMAIN: &str = "demo-broker.session-token.v1";

/// Derives a 32-byte keyed-hash key from the configured session secret.
///
/// Domain separation means this key can never collide with a key derived
/// for an unrelated purpose from the same secret.
fn derive_key(session_secret: &str) -> [u8; 32] {
    blake3::derive_key(TOKEN_DOMAIN, session_secret.as_bytes())
}

/// Mint the opaque session token bound to `session_id`.
pub fn mint(session_secret: &str, session_id: Uuid) -> String {
    let key = derive_key(session_secret);
    let hash = blake3::keyed_hash(&key, session_id.as_bytes());
    hash.to_hex().to_string()
}

/// Verify that `token` is the HMAC of `session_id` under the configured secret.
///
/// Comparison happens over the full hex string; both sides are
/// constant-length so there is no early-exit timing signal from length.
pub fn verify(session_secret: &str, session_id: Uuid, token: &str) -> bool {
    let expected = mint(session_secret, session_id);
    constant_time_eq(expected.as_bytes(), token.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_is_deterministic() {
        let secret = "k".repeat(40);
        let id = Uuid::new_v4();
        assert_eq!(mint(&secret, id), mint(&secret, id));
    }

    #[test]
    fn verify_accepts_own_token() {
        let secret = "k".repeat(40);
        let id = Uuid::new_v4();
        let token = mint(&secret, id);
        assert!(verify(&secret, id, &token));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let id = Uuid::new_v4();
        let token = mint(&"k".repeat(40), id);
        assert!(!verify(&"j".repeat(40), id, &token));
    }

    #[test]
    fn verify_rejects_wrong_session_id() {
        let secret = "k".repeat(40);
        let token = mint(&secret, Uuid::new_v4());
        assert!(!verify(&secret, Uuid::new_v4(), &token));
    }

    #[test]
    fn different_secrets_produce_different_tokens() {
        let id = Uuid::new_v4();
        let t1 = mint(&"k".repeat(40), id);
        let t2 = mint(&"j".repeat(40), id);
        assert_ne!(t1, t2);
    }
}
