//! Argon2id key derivation

use crate::config::EncryptionConfig;
use crate::crypto::{KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use zeroize::Zeroizing;

/// Derive a 256-bit key from a passphrase and salt.
///
/// Pure function of its inputs: the same passphrase, salt and Argon2
/// parameters always produce the same key.
pub fn derive_key(
    passphrase: &[u8],
    salt: &[u8],
    config: &EncryptionConfig,
) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    if salt.len() < 8 {
        return Err(Error::KeyDerivation(format!(
            "Salt too short: {} bytes",
            salt.len()
        )));
    }

    let params = Params::new(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::KeyDerivation(format!("Invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(passphrase, salt, output.as_mut())
        .map_err(|e| Error::KeyDerivation(format!("Argon2 failed: {}", e)))?;

    Ok(output)
}

/// Generate a fresh random vault salt
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}
