//! Connection token generation and politeness ordering.
//!
//! A token is a 5-character, human-typable connection address drawn from an
//! alphabet without visually confusable characters (no `I`, `O`, or `0`).
//! Tokens double as the input to negotiation politeness: the peer holding
//! the lexicographically smaller token is the polite one.

use rand::Rng;

// ── Constants ───────────────────────────────────────────────

/// Token alphabet. Excludes `I`, `O`, and `0` so tokens survive being read
/// aloud or typed from a screen.
pub const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ123456789";

/// Token length in characters.
pub const TOKEN_LENGTH: usize = 5;

/// A connection token. Opaque to everything except the registry (lookup key)
/// and the negotiation engine (politeness input).
pub type ClientToken = String;

// ── Generation ──────────────────────────────────────────────

/// Generate a random token candidate.
///
/// Uniqueness among live connections is the registry's job; it retries
/// generation until the insert succeeds.
pub fn generate_token() -> ClientToken {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LENGTH)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

// ── Politeness ──────────────────────────────────────────────

/// Whether the peer holding `local` is the polite one in a session with
/// `remote`. Both peers compute this independently and must agree, so the
/// rule is pure lexicographic comparison, fixed for the session's lifetime.
pub fn is_polite(local: &str, remote: &str) -> bool {
    local < remote
}

// ── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_has_expected_length() {
        assert_eq!(generate_token().len(), TOKEN_LENGTH);
    }

    #[test]
    fn token_uses_only_alphabet_characters() {
        for _ in 0..100 {
            let token = generate_token();
            for b in token.bytes() {
                assert!(
                    TOKEN_ALPHABET.contains(&b),
                    "character {:?} outside alphabet in {token}",
                    b as char
                );
            }
        }
    }

    #[test]
    fn alphabet_excludes_confusable_characters() {
        assert!(!TOKEN_ALPHABET.contains(&b'I'));
        assert!(!TOKEN_ALPHABET.contains(&b'O'));
        assert!(!TOKEN_ALPHABET.contains(&b'0'));
    }

    #[test]
    fn politeness_is_deterministic_and_asymmetric() {
        // Smaller token is polite on both sides of the comparison.
        assert!(is_polite("AAAAA", "BBBBB"));
        assert!(!is_polite("BBBBB", "AAAAA"));
    }

    #[test]
    fn politeness_agrees_when_computed_independently() {
        let (a, b) = ("HJ4K2", "ZZZ99");
        let a_thinks_a_polite = is_polite(a, b);
        let b_thinks_a_polite = !is_polite(b, a);
        assert_eq!(a_thinks_a_polite, b_thinks_a_polite);
    }
}
