//! Single-pre-shared-key authentication (§4.8). There is no per-subdomain
//! capability model: every control connection authenticates with the same
//! key, compared in constant time so that timing does not leak which byte of
//! the guess first diverged from the real key.

use subtle::ConstantTimeEq;

/// Compare `candidate` against `expected` in constant time. Returns `false`
/// immediately (not in constant time) only on length mismatch, which is not
/// considered sensitive — the key length itself is not a secret here.
pub fn keys_match(candidate: &str, expected: &str) -> bool {
    if candidate.len() != expected.len() {
        return false;
    }
    candidate.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_keys_match() {
        assert!(keys_match("sk-1234567890", "sk-1234567890"));
    }

    #[test]
    fn different_keys_do_not_match() {
        assert!(!keys_match("sk-1234567890", "sk-0000000000"));
    }

    #[test]
    fn different_lengths_do_not_match() {
        assert!(!keys_match("short", "much-longer-key"));
    }

    #[test]
    fn empty_candidate_against_empty_expected_matches() {
        assert!(keys_match("", ""));
    }
}
