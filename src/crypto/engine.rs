//! Session-bound encryption of records and assets
//!
//! Every call fetches the key material from the [`PassphraseSession`] it is
//! given, so once the session has ended all of them fail with
//! [`Error::NoActiveSession`].

use crate::crypto::{decrypt, encrypt, EncryptedData, RecordEnvelope};
use crate::error::{Error, Result};
use crate::session::PassphraseSession;
use zeroize::Zeroizing;

/// Known plaintext sealed into the vault header to check a passphrase
const VERIFIER_PLAINTEXT: &[u8] = b"cardvault verifier v1";

const VERIFIER_AAD: &[u8] = b"cardvault:verifier";

fn record_aad(record_id: &str) -> Vec<u8> {
    format!("cardvault:record:v1:{}", record_id).into_bytes()
}

fn asset_aad(record_id: &str, asset_id: &str) -> Vec<u8> {
    format!("cardvault:asset:v1:{}:{}", record_id, asset_id).into_bytes()
}

/// Authenticated encryption bound to a passphrase session
#[derive(Debug, Clone, Copy, Default)]
pub struct CryptoEngine;

impl CryptoEngine {
    pub fn new() -> Self {
        CryptoEngine
    }

    /// Encrypt a serialized record payload; the record id is bound into the
    /// tag so the blob cannot be relabelled to another id
    pub fn seal_record(
        &self,
        session: &PassphraseSession,
        record_id: &str,
        plaintext: &[u8],
    ) -> Result<RecordEnvelope> {
        let keys = session.keys()?;
        let data = encrypt(keys.record_key(), plaintext, &record_aad(record_id))?;
        Ok(RecordEnvelope::new(keys.salt_ref(), data))
    }

    /// Decrypt a record payload
    pub fn open_record(
        &self,
        session: &PassphraseSession,
        record_id: &str,
        envelope: &RecordEnvelope,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let keys = session.keys()?;
        if envelope.salt_ref != keys.salt_ref() {
            return Err(Error::AuthenticationFailed);
        }
        let plaintext = decrypt(
            keys.record_key(),
            &envelope.encrypted_data(),
            &record_aad(record_id),
        )?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Encrypt the bytes of one image attached to a record
    pub fn seal_asset(
        &self,
        session: &PassphraseSession,
        record_id: &str,
        asset_id: &str,
        bytes: &[u8],
    ) -> Result<RecordEnvelope> {
        let keys = session.keys()?;
        let data = encrypt(keys.asset_key(), bytes, &asset_aad(record_id, asset_id))?;
        Ok(RecordEnvelope::new(keys.salt_ref(), data))
    }

    /// Decrypt the bytes of one image
    pub fn open_asset(
        &self,
        session: &PassphraseSession,
        record_id: &str,
        asset_id: &str,
        envelope: &RecordEnvelope,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let keys = session.keys()?;
        if envelope.salt_ref != keys.salt_ref() {
            return Err(Error::AuthenticationFailed);
        }
        let plaintext = decrypt(
            keys.asset_key(),
            &envelope.encrypted_data(),
            &asset_aad(record_id, asset_id),
        )?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Keyed BLAKE3 fingerprint over length-framed parts, hex encoded.
    ///
    /// Equal plaintext yields equal fingerprints under the same key, which
    /// lets an unchanged record be recognised from listing metadata alone.
    pub fn fingerprint(&self, session: &PassphraseSession, parts: &[&[u8]]) -> Result<String> {
        let keys = session.keys()?;
        let mut hasher = blake3::Hasher::new_keyed(keys.fingerprint_key());
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Produce the passphrase verifier stored in the vault header
    pub fn seal_verifier(&self, session: &PassphraseSession) -> Result<EncryptedData> {
        let keys = session.keys()?;
        encrypt(keys.record_key(), VERIFIER_PLAINTEXT, VERIFIER_AAD)
    }

    /// Check the session's key against a stored verifier
    pub fn check_verifier(&self, session: &PassphraseSession, verifier: &EncryptedData) -> Result<()> {
        let keys = session.keys()?;
        let plaintext = decrypt(keys.record_key(), verifier, VERIFIER_AAD)?;
        if plaintext != VERIFIER_PLAINTEXT {
            return Err(Error::AuthenticationFailed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncryptionConfig;
    use crate::crypto::SALT_SIZE;
    use crate::session::NonEmptyPolicy;

    fn test_config() -> EncryptionConfig {
        EncryptionConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
            salt: Vec::new(),
        }
    }

    fn session(passphrase: &str, salt: &[u8]) -> PassphraseSession {
        let session = PassphraseSession::begin(passphrase, &NonEmptyPolicy).unwrap();
        session.derive_keys(salt, &test_config()).unwrap();
        session
    }

    #[test]
    fn test_record_roundtrip() {
        let engine = CryptoEngine::new();
        let s = session("pass", &[1u8; SALT_SIZE]);

        let envelope = engine.seal_record(&s, "card-1", b"payload").unwrap();
        let plain = engine.open_record(&s, "card-1", &envelope).unwrap();
        assert_eq!(plain.as_slice(), b"payload");
    }

    #[test]
    fn test_relabelled_record_fails() {
        let engine = CryptoEngine::new();
        let s = session("pass", &[1u8; SALT_SIZE]);

        let envelope = engine.seal_record(&s, "card-1", b"payload").unwrap();
        let result = engine.open_record(&s, "card-2", &envelope);
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
    }

    #[test]
    fn test_wrong_passphrase_fails_authentication() {
        let engine = CryptoEngine::new();
        let salt = [1u8; SALT_SIZE];
        let right = session("right passphrase", &salt);
        let wrong = session("wrong passphrase", &salt);

        let envelope = engine.seal_record(&right, "card-1", b"payload").unwrap();
        assert!(matches!(
            engine.open_record(&wrong, "card-1", &envelope),
            Err(Error::AuthenticationFailed)
        ));

        let verifier = engine.seal_verifier(&right).unwrap();
        assert!(engine.check_verifier(&right, &verifier).is_ok());
        assert!(matches!(
            engine.check_verifier(&wrong, &verifier),
            Err(Error::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_asset_bound_to_record_and_asset_id() {
        let engine = CryptoEngine::new();
        let s = session("pass", &[1u8; SALT_SIZE]);

        let envelope = engine.seal_asset(&s, "card-1", "img-1", &[9u8; 100]).unwrap();
        assert_eq!(
            engine.open_asset(&s, "card-1", "img-1", &envelope).unwrap().as_slice(),
            &[9u8; 100][..]
        );
        assert!(engine.open_asset(&s, "card-1", "img-2", &envelope).is_err());
        assert!(engine.open_asset(&s, "card-2", "img-1", &envelope).is_err());
        // Asset blobs are not valid records
        assert!(engine.open_record(&s, "card-1", &envelope).is_err());
    }

    #[test]
    fn test_ended_session_refuses_crypto() {
        let engine = CryptoEngine::new();
        let s = session("pass", &[1u8; SALT_SIZE]);
        let envelope = engine.seal_record(&s, "card-1", b"payload").unwrap();

        s.end();

        assert!(matches!(
            engine.seal_record(&s, "card-1", b"payload"),
            Err(Error::NoActiveSession)
        ));
        assert!(matches!(
            engine.open_record(&s, "card-1", &envelope),
            Err(Error::NoActiveSession)
        ));
        assert!(matches!(
            engine.fingerprint(&s, &[&b"x"[..]]),
            Err(Error::NoActiveSession)
        ));
    }

    #[test]
    fn test_fingerprint_keyed_and_framed() {
        let engine = CryptoEngine::new();
        let a = session("pass-a", &[1u8; SALT_SIZE]);
        let b = session("pass-b", &[1u8; SALT_SIZE]);

        let fa = engine.fingerprint(&a, &[&b"ab"[..], &b"c"[..]]).unwrap();
        assert_eq!(fa, engine.fingerprint(&a, &[&b"ab"[..], &b"c"[..]]).unwrap());
        assert_ne!(fa, engine.fingerprint(&a, &[&b"a"[..], &b"bc"[..]]).unwrap());
        assert_ne!(fa, engine.fingerprint(&b, &[&b"ab"[..], &b"c"[..]]).unwrap());
    }
}
