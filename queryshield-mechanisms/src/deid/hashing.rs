use sha2::{Digest, Sha256};

pub const DEFAULT_HASH_LENGTH: usize = 16;

/// Salted SHA-256 of `value`, hex encoded and truncated to `length`
/// characters (clamped to the full 64-character digest).
pub fn hash_value(value: &str, salt: &str, length: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hasher.update(salt.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(length.clamp(1, 64));
    digest
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn deterministic_for_same_salt() {
        let a = hash_value("alice@example.com", "pepper", DEFAULT_HASH_LENGTH);
        let b = hash_value("alice@example.com", "pepper", DEFAULT_HASH_LENGTH);
        assert_eq!(a, b);
        assert_eq!(a.len(), DEFAULT_HASH_LENGTH);
        assert_ne!(a, hash_value("alice@example.com", "other", DEFAULT_HASH_LENGTH));
    }

    #[test]
    fn no_collisions_across_ten_thousand_inputs() {
        let digests: HashSet<String> = (0..10_000)
            .map(|idx| hash_value(&format!("user-{idx}"), "salt", DEFAULT_HASH_LENGTH))
            .collect();
        assert_eq!(digests.len(), 10_000);
    }

    #[test]
    fn length_is_clamped() {
        assert_eq!(hash_value("x", "s", 500).len(), 64);
        assert_eq!(hash_value("x", "s", 0).len(), 1);
    }
}
