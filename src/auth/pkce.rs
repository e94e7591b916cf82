//! PKCE material for the authorization-code flow (RFC 7636, S256 only)

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

const VERIFIER_LENGTH: usize = 64;
const STATE_LENGTH: usize = 32;

/// Characters RFC 7636 allows in a code verifier
const UNRESERVED: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Verifier and derived challenge for one authorization attempt
#[derive(Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let verifier = random_string(VERIFIER_LENGTH);
        let challenge = challenge_for(&verifier);
        Self { verifier, challenge }
    }
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The verifier is a credential until the exchange completes.
        f.debug_struct("PkcePair")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// S256 challenge: base64url (no padding) of the SHA-256 of the verifier.
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Anti-CSRF state parameter for the authorize redirect.
pub fn generate_state() -> String {
    random_string(STATE_LENGTH)
}

/// A verifier must be 43-128 characters drawn from the unreserved set.
pub fn is_valid_verifier(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier.bytes().all(|b| UNRESERVED.contains(&b))
}

fn random_string(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..UNRESERVED.len());
            UNRESERVED[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_verifier_is_valid() {
        let pair = PkcePair::generate();
        assert!(is_valid_verifier(&pair.verifier));
        assert_eq!(pair.challenge, challenge_for(&pair.verifier));
    }

    #[test]
    fn rfc7636_appendix_b_vector() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            challenge_for(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn challenge_has_no_padding() {
        let pair = PkcePair::generate();
        assert!(!pair.challenge.contains('='));
        assert!(!pair.challenge.contains('+'));
        assert!(!pair.challenge.contains('/'));
    }

    #[test]
    fn verifier_length_bounds() {
        assert!(!is_valid_verifier(&"a".repeat(42)));
        assert!(is_valid_verifier(&"a".repeat(43)));
        assert!(is_valid_verifier(&"a".repeat(128)));
        assert!(!is_valid_verifier(&"a".repeat(129)));
        assert!(!is_valid_verifier("short"));
        assert!(!is_valid_verifier(&"a!".repeat(30)));
    }

    #[test]
    fn state_values_differ() {
        assert_ne!(generate_state(), generate_state());
        assert_eq!(generate_state().len(), 32);
    }

    #[test]
    fn debug_never_prints_verifier() {
        let pair = PkcePair::generate();
        let rendered = format!("{:?}", pair);
        assert!(!rendered.contains(&pair.verifier));
        assert!(rendered.contains("<redacted>"));
    }
}
