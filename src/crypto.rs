//! Cookie vault encryption
//!
//! Refresh tokens never reach the browser in the clear: they are sealed
//! with AES-GCM under the configured encryption key and base64url-encoded
//! for cookie transport. A 12-byte random nonce is prepended to the
//! ciphertext.

use aes_gcm::{
    Aes128Gcm, Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;

use crate::{Error, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

enum Vault {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl Vault {
    fn new(key: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Aes128Gcm::new_from_slice(key)
                .map(|c| Self::Aes128(Box::new(c)))
                .map_err(|_| Error::Crypto("invalid 16-byte key".to_string())),
            32 => Aes256Gcm::new_from_slice(key)
                .map(|c| Self::Aes256(Box::new(c)))
                .map_err(|_| Error::Crypto("invalid 32-byte key".to_string())),
            n => Err(Error::Crypto(format!(
                "encryption key must be 16 or 32 bytes, got {n}"
            ))),
        }
    }

    fn seal(&self, nonce: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            Self::Aes128(c) => c.encrypt(nonce, plain),
            Self::Aes256(c) => c.encrypt(nonce, plain),
        }
        .map_err(|_| Error::Crypto("encryption failed".to_string()))
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            Self::Aes128(c) => c.decrypt(nonce, ciphertext),
            Self::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| Error::Crypto("decryption failed".to_string()))
    }
}

/// Encrypt a UTF-8 string for cookie transport
pub fn encode_text(plain: &str, key: &[u8]) -> Result<String> {
    let vault = Vault::new(key)?;
    let nonce: [u8; NONCE_LEN] = rand::rng().random();
    let ciphertext = vault.seal(&nonce, plain.as_bytes())?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);

    Ok(URL_SAFE_NO_PAD.encode(out))
}

/// Decrypt a blob previously produced by [`encode_text`]
pub fn decode_text(encoded: &str, key: &[u8]) -> Result<String> {
    let vault = Vault::new(key)?;
    let raw = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| Error::Crypto("invalid base64 ciphertext".to_string()))?;

    if raw.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::Crypto("ciphertext too short".to_string()));
    }

    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    let plain = vault.open(nonce, ciphertext)?;

    String::from_utf8(plain).map_err(|_| Error::Crypto("plaintext is not UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_16: &[u8] = b"0123456789abcdef";
    const KEY_32: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn round_trip_with_both_key_sizes() {
        for key in [KEY_16, KEY_32] {
            let blob = encode_text("a refresh token", key).unwrap();
            assert_eq!(decode_text(&blob, key).unwrap(), "a refresh token");
        }
    }

    #[test]
    fn round_trip_arbitrary_text() {
        let cases = ["", "x", "日本語のトークン", &"long ".repeat(500)];
        for plain in cases {
            let blob = encode_text(plain, KEY_32).unwrap();
            assert_eq!(decode_text(&blob, KEY_32).unwrap(), plain);
        }
    }

    #[test]
    fn ciphertext_is_cookie_safe() {
        let blob = encode_text("token+with/chars=", KEY_32).unwrap();
        assert!(!blob.contains('+'));
        assert!(!blob.contains('/'));
        assert!(!blob.contains('='));
        assert!(!blob.contains(';'));
    }

    #[test]
    fn nonce_makes_output_unique() {
        let a = encode_text("same", KEY_32).unwrap();
        let b = encode_text("same", KEY_32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let blob = encode_text("secret", KEY_32).unwrap();
        assert!(decode_text(&blob, KEY_16).is_err());
        assert!(decode_text(&blob, b"ffffffffffffffffffffffffffffffff").is_err());
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let blob = encode_text("secret", KEY_32).unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(raw);
        assert!(decode_text(&tampered, KEY_32).is_err());
    }

    #[test]
    fn invalid_key_length_is_rejected() {
        assert!(encode_text("x", b"short").is_err());
        assert!(decode_text("anything", b"short").is_err());
    }

    #[test]
    fn truncated_blob_is_rejected() {
        assert!(decode_text("AAAA", KEY_32).is_err());
    }
}
