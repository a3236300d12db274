//! Passphrase to key/IV derivation
//!
//! Reproduces OpenSSL's legacy `EVP_BytesToKey` with SHA-1, no salt and
//! five rounds. `openssl enc` cannot select a round count for this KDF
//! (`-iter` switches to PBKDF2), but given the derived key and IV as `-K` and
//! `-iv`, `openssl enc -aes-256-cbc` reads and writes the same ciphertext.

use crate::crypto::{IV_SIZE, KDF_ROUNDS, KEY_SIZE};
use crate::error::{Error, Result};
use sha1::{Digest, Sha1};
use zeroize::Zeroizing;

/// Key and IV derived from a passphrase (zeroized on drop)
pub struct DerivedKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
    iv: Zeroizing<[u8; IV_SIZE]>,
}

impl DerivedKey {
    /// Get the key bytes
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// Get the IV bytes
    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }
}

/// Derive an AES-256-CBC key and IV from a passphrase
///
/// `D_0 = ""`, `D_i = H^rounds(D_{i-1} || passphrase)`; the concatenation
/// `D_1 || D_2 || ...` is split into key then IV.
pub fn derive_key(passphrase: &[u8]) -> Result<DerivedKey> {
    if passphrase.is_empty() {
        return Err(Error::InvalidKey);
    }

    let mut material = Zeroizing::new(Vec::with_capacity(KEY_SIZE + IV_SIZE + 20));
    let mut prev: Zeroizing<Vec<u8>> = Zeroizing::new(Vec::new());

    while material.len() < KEY_SIZE + IV_SIZE {
        let mut hasher = Sha1::new();
        hasher.update(prev.as_slice());
        hasher.update(passphrase);
        let mut digest = hasher.finalize();

        for _ in 1..KDF_ROUNDS {
            digest = Sha1::digest(digest);
        }

        material.extend_from_slice(&digest);
        *prev = digest.to_vec();
    }

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    let mut iv = Zeroizing::new([0u8; IV_SIZE]);
    key.copy_from_slice(&material[..KEY_SIZE]);
    iv.copy_from_slice(&material[KEY_SIZE..KEY_SIZE + IV_SIZE]);

    Ok(DerivedKey { key, iv })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_openssl_bytes_to_key() {
        let derived = derive_key(b"secret").unwrap();
        assert_eq!(
            hex::encode(derived.key()),
            "fe093e77c05352d4cc8ff67c38099cdefbcc1f20900a7d520481b90f04ec84e1"
        );
        assert_eq!(hex::encode(derived.iv()), "71f796c953772728f4efb83100ed4c00");
    }

    #[test]
    fn test_second_vector() {
        let derived = derive_key(b"Password").unwrap();
        assert_eq!(
            hex::encode(derived.key()),
            "2400d209854a03533fd1316c38f9d5a1303430e19c6568248410d0e88a51a894"
        );
        assert_eq!(hex::encode(derived.iv()), "2c573db3a3e157b9b82e404d171e63df");
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(matches!(derive_key(b""), Err(Error::InvalidKey)));
    }

    #[test]
    fn test_different_passphrases_different_keys() {
        let a = derive_key(b"password1").unwrap();
        let b = derive_key(b"password2").unwrap();
        assert_ne!(a.key(), b.key());
        assert_ne!(a.iv(), b.iv());
    }
}
