//! Authentication utilities

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Hex SHA-256 of a user key, the form persisted by the user store
pub fn hash_user_key(user_key: &str) -> String {
    hex::encode(Sha256::digest(user_key.as_bytes()))
}

/// Verify a presented user key against a stored hash
///
/// The comparison is constant-time over the hex digests.
pub fn verify_user_key(user_key: &str, stored_hash: &str) -> bool {
    let presented = hash_user_key(user_key);
    if presented.len() != stored_hash.len() {
        return false;
    }
    presented.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

/// Both credential fields present and non-blank
pub fn has_credentials(user_id: &str, user_key: &str) -> bool {
    !user_id.trim().is_empty() && !user_key.is_empty()
}

/// Mask a secret for logs: `ab...yz(12)`
pub fn mask(value: &str) -> String {
    let len = value.chars().count();
    if len == 0 {
        return "-".to_string();
    }
    if len <= 6 {
        return format!("***({len})");
    }
    let head: String = value.chars().take(2).collect();
    let tail: String = value.chars().skip(len - 2).collect();
    format!("{head}...{tail}({len})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hash_roundtrip() {
        let stored = hash_user_key("s3cret");
        assert_eq!(stored.len(), 64);
        assert!(verify_user_key("s3cret", &stored));
        assert!(!verify_user_key("s3cret ", &stored));
        assert!(!verify_user_key("s3cret", "short"));
    }

    #[test]
    fn test_mask() {
        assert_eq!(mask(""), "-");
        assert_eq!(mask("abc"), "***(3)");
        assert_eq!(mask("abcdefghij"), "ab...ij(10)");
    }
}
