use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};

use crate::error::{MechanismError, MechanismResult};

const NONCE_LEN: usize = 12;

/// Parses a 64-character hex string into a 256-bit key.
pub fn key_from_hex(hex_key: &str) -> MechanismResult<[u8; 32]> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|_| MechanismError::Cipher("key is not valid hex"))?;
    bytes
        .try_into()
        .map_err(|_| MechanismError::Cipher("key must be 32 bytes"))
}

/// AES-256-GCM with a synthetic nonce derived from the plaintext, so equal
/// plaintexts encrypt to equal tokens under the same key and joins on the
/// encrypted column still line up.
#[derive(Clone)]
pub struct DeterministicCipher {
    nonce_key: [u8; 32],
    cipher: Aes256Gcm,
}

impl DeterministicCipher {
    pub fn new(key: [u8; 32]) -> MechanismResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| MechanismError::Cipher("invalid aes-256 key length"))?;
        Ok(Self {
            nonce_key: blake3::derive_key("queryshield deterministic nonce v1", &key),
            cipher,
        })
    }

    pub fn from_hex(hex_key: &str) -> MechanismResult<Self> {
        Self::new(key_from_hex(hex_key)?)
    }

    fn nonce_for(&self, plaintext: &[u8]) -> [u8; NONCE_LEN] {
        let digest = blake3::keyed_hash(&self.nonce_key, plaintext);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest.as_bytes()[..NONCE_LEN]);
        nonce
    }

    /// Returns `hex(nonce || ciphertext || tag)`.
    pub fn encrypt(&self, plaintext: &str) -> MechanismResult<String> {
        let nonce = self.nonce_for(plaintext.as_bytes());
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| MechanismError::Cipher("aes-gcm encryption failed"))?;
        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&ciphertext);
        Ok(hex::encode(token))
    }

    pub fn decrypt(&self, token: &str) -> MechanismResult<String> {
        let bytes =
            hex::decode(token).map_err(|_| MechanismError::Cipher("token is not valid hex"))?;
        if bytes.len() <= NONCE_LEN {
            return Err(MechanismError::Cipher("token too short"));
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| MechanismError::Cipher("aes-gcm authentication failed"))?;
        String::from_utf8(plaintext).map_err(|_| MechanismError::Cipher("plaintext is not utf-8"))
    }
}

/// Keyed, reversible transform that keeps each character inside its class:
/// digits stay digits, ASCII letters keep their case, everything else passes
/// through. Each shift is drawn from a BLAKE3 keystream bound to the tweak and
/// length, and chained on the preceding plaintext characters.
#[derive(Clone)]
pub struct FormatPreservingCipher {
    key: [u8; 32],
}

#[derive(Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

fn classify(c: char) -> Option<(u32, u32, u32)> {
    match c {
        '0'..='9' => Some(('0' as u32, 10, c as u32 - '0' as u32)),
        'a'..='z' => Some(('a' as u32, 26, c as u32 - 'a' as u32)),
        'A'..='Z' => Some(('A' as u32, 26, c as u32 - 'A' as u32)),
        _ => None,
    }
}

impl FormatPreservingCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key: blake3::derive_key("queryshield format preserving v1", &key),
        }
    }

    pub fn from_hex(hex_key: &str) -> MechanismResult<Self> {
        Ok(Self::new(key_from_hex(hex_key)?))
    }

    pub fn encrypt(&self, value: &str, tweak: &str) -> String {
        self.transform(value, tweak, Direction::Encrypt)
    }

    pub fn decrypt(&self, value: &str, tweak: &str) -> String {
        self.transform(value, tweak, Direction::Decrypt)
    }

    fn transform(&self, value: &str, tweak: &str, direction: Direction) -> String {
        let length = value.chars().count() as u64;
        let mut hasher = blake3::Hasher::new_keyed(&self.key);
        hasher.update(tweak.as_bytes());
        hasher.update(&length.to_le_bytes());
        let mut keystream = hasher.finalize_xof();
        let mut carry: u32 = 0;
        let mut out = String::with_capacity(value.len());
        for c in value.chars() {
            let Some((base, radix, index)) = classify(c) else {
                out.push(c);
                continue;
            };
            let mut word = [0u8; 4];
            keystream.fill(&mut word);
            let shift = u32::from_le_bytes(word).wrapping_add(carry) % radix;
            let (plain, mapped) = match direction {
                Direction::Encrypt => (index, (index + shift) % radix),
                Direction::Decrypt => {
                    let plain = (index + radix - shift) % radix;
                    (plain, plain)
                }
            };
            carry = carry.wrapping_mul(31).wrapping_add(plain + 1);
            out.push(char::from_u32(base + mapped).unwrap_or(c));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [42u8; 32];

    #[test]
    fn aes_round_trip_is_deterministic() {
        let cipher = DeterministicCipher::new(KEY).unwrap();
        let token = cipher.encrypt("123-45-6789").unwrap();
        assert_eq!(token, cipher.encrypt("123-45-6789").unwrap());
        assert_ne!(token, cipher.encrypt("123-45-6780").unwrap());
        assert_eq!(cipher.decrypt(&token).unwrap(), "123-45-6789");
    }

    #[test]
    fn aes_rejects_tampered_or_foreign_tokens() {
        let cipher = DeterministicCipher::new(KEY).unwrap();
        let other = DeterministicCipher::new([7u8; 32]).unwrap();
        let token = cipher.encrypt("alice").unwrap();
        assert!(other.decrypt(&token).is_err());
        assert!(cipher.decrypt("zz").is_err());
        assert!(cipher.decrypt("00ff").is_err());
    }

    #[test]
    fn hex_keys_must_be_32_bytes() {
        assert!(DeterministicCipher::from_hex(&"ab".repeat(32)).is_ok());
        assert!(DeterministicCipher::from_hex("abcd").is_err());
        assert!(FormatPreservingCipher::from_hex("not hex").is_err());
    }

    #[test]
    fn fpe_preserves_format_and_reverses() {
        let fpe = FormatPreservingCipher::new(KEY);
        let plain = "4111-1111-1111-1111";
        let token = fpe.encrypt(plain, "card");
        assert_eq!(token.len(), plain.len());
        for (a, b) in plain.chars().zip(token.chars()) {
            assert_eq!(a.is_ascii_digit(), b.is_ascii_digit());
            if a == '-' {
                assert_eq!(b, '-');
            }
        }
        assert_ne!(token, plain);
        assert_eq!(fpe.decrypt(&token, "card"), plain);
    }

    #[test]
    fn fpe_keeps_letter_case() {
        let fpe = FormatPreservingCipher::new(KEY);
        let token = fpe.encrypt("AbC-12z", "t");
        let classes: Vec<(bool, bool, bool)> = token
            .chars()
            .map(|c| (c.is_ascii_uppercase(), c.is_ascii_lowercase(), c.is_ascii_digit()))
            .collect();
        assert_eq!(
            classes,
            vec![
                (true, false, false),
                (false, true, false),
                (true, false, false),
                (false, false, false),
                (false, false, true),
                (false, false, true),
                (false, true, false),
            ]
        );
        assert_eq!(fpe.decrypt(&token, "t"), "AbC-12z");
    }
}
