//! AES-256-GCM primitives
//!
//! Records, images and the header verifier are all sealed here. The caller
//! supplies the associated data that binds a ciphertext to its identity.
//! Any tag verification failure, whatever its cause, is reported as the same
//! [`Error::AuthenticationFailed`].

use crate::crypto::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use serde::{Deserialize, Serialize};

/// Encrypted data container: nonce, ciphertext and authentication tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    /// Nonce used for encryption (fresh per call)
    pub nonce: Vec<u8>,
    /// Ciphertext without the tag
    pub ciphertext: Vec<u8>,
    /// GCM authentication tag
    pub tag: Vec<u8>,
}

impl EncryptedData {
    /// Bytes taken by nonce, ciphertext and tag together
    pub fn size(&self) -> usize {
        self.nonce.len() + self.ciphertext.len() + self.tag.len()
    }
}

fn aead_key(key: &[u8; KEY_SIZE]) -> Result<LessSafeKey> {
    let unbound_key = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| Error::Internal("Failed to create AES-256-GCM key".to_string()))?;
    Ok(LessSafeKey::new(unbound_key))
}

/// Seal `plaintext` under `key` with a fresh random nonce. `aad` is
/// authenticated but not encrypted.
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<EncryptedData> {
    let sealing_key = aead_key(key)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    let tag = sealing_key
        .seal_in_place_separate_tag(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| Error::Encryption("Encryption failed".to_string()))?;

    Ok(EncryptedData {
        nonce: nonce_bytes.to_vec(),
        ciphertext: in_out,
        tag: tag.as_ref().to_vec(),
    })
}

/// Open a sealed payload
///
/// Structural problems are reported as [`Error::MalformedInput`]; the tag is
/// verified before any plaintext is returned.
pub fn decrypt(key: &[u8; KEY_SIZE], encrypted: &EncryptedData, aad: &[u8]) -> Result<Vec<u8>> {
    if encrypted.nonce.len() != NONCE_SIZE {
        return Err(Error::MalformedInput(format!(
            "Invalid nonce length: {}",
            encrypted.nonce.len()
        )));
    }

    if encrypted.tag.len() != TAG_SIZE {
        return Err(Error::MalformedInput(format!(
            "Invalid tag length: {}",
            encrypted.tag.len()
        )));
    }

    let opening_key = aead_key(key)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&encrypted.nonce);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = Vec::with_capacity(encrypted.ciphertext.len() + TAG_SIZE);
    in_out.extend_from_slice(&encrypted.ciphertext);
    in_out.extend_from_slice(&encrypted.tag);

    let plaintext = opening_key
        .open_in_place(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| Error::AuthenticationFailed)?;

    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = test_key();
        let plaintext = b"Hello, cardvault!";

        let encrypted = encrypt(&key, plaintext, b"record:1").unwrap();
        let decrypted = decrypt(&key, &encrypted, b"record:1").unwrap();

        assert_eq!(decrypted, plaintext);
        assert_eq!(encrypted.tag.len(), TAG_SIZE);
        assert_eq!(encrypted.ciphertext.len(), plaintext.len());
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = test_key();
        let a = encrypt(&key, b"same", b"").unwrap();
        let b = encrypt(&key, b"same", b"").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = test_key();
        let encrypted = encrypt(&key, b"Secret data", b"record:1234").unwrap();
        let result = decrypt(&key, &encrypted, b"record:5678");
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = encrypt(&test_key(), b"Secret data", b"").unwrap();
        let result = decrypt(&test_key(), &encrypted, b"");
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn test_any_bit_flip_fails_authentication() {
        let key = test_key();
        let encrypted = encrypt(&key, b"4111111111111111", b"aad").unwrap();

        fn field(data: &mut EncryptedData, which: usize) -> &mut Vec<u8> {
            match which {
                0 => &mut data.nonce,
                1 => &mut data.ciphertext,
                _ => &mut data.tag,
            }
        }

        for which in 0..3 {
            let len = field(&mut encrypted.clone(), which).len();
            for byte in 0..len {
                for bit in 0..8 {
                    let mut tampered = encrypted.clone();
                    field(&mut tampered, which)[byte] ^= 1 << bit;
                    let result = decrypt(&key, &tampered, b"aad");
                    assert!(matches!(result, Err(Error::AuthenticationFailed)));
                }
            }
        }
    }

    #[test]
    fn test_truncated_tag_is_malformed() {
        let key = test_key();
        let mut encrypted = encrypt(&key, b"data", b"").unwrap();
        encrypted.tag.pop();
        assert!(matches!(
            decrypt(&key, &encrypted, b""),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_bad_nonce_length_is_malformed() {
        let key = test_key();
        let mut encrypted = encrypt(&key, b"data", b"").unwrap();
        encrypted.nonce.push(0);
        assert!(matches!(
            decrypt(&key, &encrypted, b""),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_empty_plaintext() {
        let key = test_key();
        let encrypted = encrypt(&key, b"", b"").unwrap();
        let decrypted = decrypt(&key, &encrypted, b"").unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_large_plaintext() {
        let key = test_key();
        let plaintext = vec![0x42u8; 1024 * 1024];

        let encrypted = encrypt(&key, &plaintext, b"").unwrap();
        let decrypted = decrypt(&key, &encrypted, b"").unwrap();

        assert_eq!(decrypted, plaintext);
    }
}
