//! Persisted record container
//!
//! Every remote record object is one bincode-encoded [`RecordEnvelope`]:
//! magic, format version, salt reference, nonce, ciphertext and tag.

use crate::crypto::{EncryptedData, SaltRef};
use crate::error::{Error, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Magic bytes identifying a cardvault record
pub const ENVELOPE_MAGIC: [u8; 4] = *b"CVR1";

/// Current record format version
pub const FORMAT_VERSION: u8 = 1;

/// Upper bound on a decoded envelope
const MAX_ENVELOPE_SIZE: u64 = 64 * 1024 * 1024;

/// Versioned container around an encrypted payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub magic: [u8; 4],
    pub version: u8,
    pub salt_ref: SaltRef,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_ENVELOPE_SIZE)
}

impl RecordEnvelope {
    pub fn new(salt_ref: SaltRef, data: EncryptedData) -> Self {
        RecordEnvelope {
            magic: ENVELOPE_MAGIC,
            version: FORMAT_VERSION,
            salt_ref,
            nonce: data.nonce,
            ciphertext: data.ciphertext,
            tag: data.tag,
        }
    }

    /// Serialize to bytes for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec()
            .serialize(self)
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes, rejecting anything that is not a well-formed
    /// envelope of a known version
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: RecordEnvelope = codec()
            .deserialize(bytes)
            .map_err(|e| Error::MalformedInput(format!("Undecodable record: {}", e)))?;

        if envelope.magic != ENVELOPE_MAGIC {
            return Err(Error::MalformedInput("Bad record magic".to_string()));
        }

        if envelope.version != FORMAT_VERSION {
            return Err(Error::MalformedInput(format!(
                "Unsupported record format version {}",
                envelope.version
            )));
        }

        Ok(envelope)
    }

    /// The encrypted payload carried by this envelope
    pub fn encrypted_data(&self) -> EncryptedData {
        EncryptedData {
            nonce: self.nonce.clone(),
            ciphertext: self.ciphertext.clone(),
            tag: self.tag.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RecordEnvelope {
        RecordEnvelope::new(
            [1, 2, 3, 4, 5, 6, 7, 8],
            EncryptedData {
                nonce: vec![0u8; 12],
                ciphertext: vec![0xaa; 40],
                tag: vec![0xbb; 16],
            },
        )
    }

    #[test]
    fn test_serialization() {
        let envelope = sample();
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"CVR1");
        assert_eq!(RecordEnvelope::from_bytes(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_truncated_is_malformed() {
        let bytes = sample().to_bytes().unwrap();
        let result = RecordEnvelope::from_bytes(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(Error::MalformedInput(_))));
    }

    #[test]
    fn test_trailing_garbage_is_malformed() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes.push(0);
        assert!(matches!(
            RecordEnvelope::from_bytes(&bytes),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_unknown_version_is_malformed() {
        let mut envelope = sample();
        envelope.version = 9;
        let bytes = envelope.to_bytes().unwrap();
        assert!(matches!(
            RecordEnvelope::from_bytes(&bytes),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_bad_magic_is_malformed() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            RecordEnvelope::from_bytes(&bytes),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_huge_length_prefix_is_malformed() {
        let mut bytes = sample().to_bytes().unwrap();
        // nonce length prefix follows magic(4) + version(1) + salt_ref(8)
        bytes[13..21].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            RecordEnvelope::from_bytes(&bytes),
            Err(Error::MalformedInput(_))
        ));
    }
}
