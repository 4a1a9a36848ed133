//! Vault key material
//!
//! Implements a small key hierarchy:
//! - Vault key: Argon2id output from the passphrase and the vault salt
//! - Record key: encrypts serialized card payloads
//! - Asset key: encrypts attached image bytes
//! - Fingerprint key: keys the BLAKE3 content fingerprints published in
//!   remote listings, so they reveal nothing about plaintext

use crate::config::EncryptionConfig;
use crate::crypto::{derive_key, KEY_SIZE};
use crate::error::{Error, Result};
use ring::hkdf::{self, Salt, HKDF_SHA256};
use std::fmt;
use zeroize::Zeroizing;

/// Short, non-secret reference to the salt a record was encrypted under
pub type SaltRef = [u8; 8];

/// Key material derived for one session
pub struct VaultKeyMaterial {
    record_key: Zeroizing<[u8; KEY_SIZE]>,
    asset_key: Zeroizing<[u8; KEY_SIZE]>,
    fingerprint_key: Zeroizing<[u8; KEY_SIZE]>,
    /// Salt used for derivation (persisted, not secret)
    salt: Vec<u8>,
}

impl VaultKeyMaterial {
    /// Derive key material from a passphrase and the vault salt
    pub fn derive(passphrase: &[u8], salt: &[u8], config: &EncryptionConfig) -> Result<Self> {
        let master = derive_key(passphrase, salt, config)?;
        Self::from_master(&master, salt)
    }

    fn from_master(master: &[u8; KEY_SIZE], salt: &[u8]) -> Result<Self> {
        let hkdf_salt = Salt::new(HKDF_SHA256, salt);
        let prk = hkdf_salt.extract(master);

        let expand = |purpose: &[u8]| -> Result<Zeroizing<[u8; KEY_SIZE]>> {
            let mut output = Zeroizing::new([0u8; KEY_SIZE]);
            prk.expand(&[purpose], HkdfKeyType)
                .map_err(|_| Error::KeyDerivation("HKDF expansion failed".to_string()))?
                .fill(output.as_mut())
                .map_err(|_| Error::KeyDerivation("HKDF fill failed".to_string()))?;
            Ok(output)
        };

        Ok(VaultKeyMaterial {
            record_key: expand(b"cardvault-record-v1")?,
            asset_key: expand(b"cardvault-asset-v1")?,
            fingerprint_key: expand(b"cardvault-fingerprint-v1")?,
            salt: salt.to_vec(),
        })
    }

    pub fn record_key(&self) -> &[u8; KEY_SIZE] {
        &self.record_key
    }

    pub fn asset_key(&self) -> &[u8; KEY_SIZE] {
        &self.asset_key
    }

    pub fn fingerprint_key(&self) -> &[u8; KEY_SIZE] {
        &self.fingerprint_key
    }

    /// Get the salt
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Reference to the salt, stored in every record envelope
    pub fn salt_ref(&self) -> SaltRef {
        salt_ref(&self.salt)
    }
}

impl fmt::Debug for VaultKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultKeyMaterial")
            .field("salt_ref", &hex::encode(self.salt_ref()))
            .finish_non_exhaustive()
    }
}

/// Compute the salt reference: the first 8 bytes of BLAKE3(salt)
pub fn salt_ref(salt: &[u8]) -> SaltRef {
    let hash = blake3::hash(salt);
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash.as_bytes()[..8]);
    out
}

/// HKDF key type for ring
struct HkdfKeyType;

impl hkdf::KeyType for HkdfKeyType {
    fn len(&self) -> usize {
        KEY_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SALT_SIZE;

    fn test_config() -> EncryptionConfig {
        EncryptionConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
            salt: Vec::new(),
        }
    }

    #[test]
    fn test_key_material_deterministic() {
        let salt = [9u8; SALT_SIZE];
        let a = VaultKeyMaterial::derive(b"passphrase", &salt, &test_config()).unwrap();
        let b = VaultKeyMaterial::derive(b"passphrase", &salt, &test_config()).unwrap();

        assert_eq!(a.record_key(), b.record_key());
        assert_eq!(a.asset_key(), b.asset_key());
        assert_eq!(a.fingerprint_key(), b.fingerprint_key());
        assert_eq!(a.salt_ref(), b.salt_ref());
    }

    #[test]
    fn test_subkeys_are_distinct() {
        let salt = [9u8; SALT_SIZE];
        let km = VaultKeyMaterial::derive(b"passphrase", &salt, &test_config()).unwrap();

        assert_ne!(km.record_key(), km.asset_key());
        assert_ne!(km.record_key(), km.fingerprint_key());
        assert_ne!(km.asset_key(), km.fingerprint_key());
    }

    #[test]
    fn test_debug_hides_keys() {
        let salt = [9u8; SALT_SIZE];
        let km = VaultKeyMaterial::derive(b"passphrase", &salt, &test_config()).unwrap();
        let rendered = format!("{:?}", km);
        assert!(!rendered.contains(&hex::encode(km.record_key())));
        assert!(rendered.contains("salt_ref"));
    }

    #[test]
    fn test_salt_ref_depends_on_salt() {
        assert_ne!(salt_ref(&[1u8; SALT_SIZE]), salt_ref(&[2u8; SALT_SIZE]));
    }
}
