//! Remote object layout
//!
//! ```text
//! vault.json                      unencrypted header (salt, KDF params, verifier)
//! records/<card-id>               one encrypted record per card
//! assets/<card-id>/<asset-id>-<version>
//!                                 one encrypted object per image version
//! ```
//!
//! An asset version is derived from the image content, so a changed image
//! never overwrites the object the current record points at.

use crate::config::EncryptionConfig;
use crate::crypto::{EncryptedData, FORMAT_VERSION};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const HEADER_KEY: &str = "vault.json";
pub const RECORD_PREFIX: &str = "records/";
pub const ASSET_PREFIX: &str = "assets/";

/// Stable remote identifier of a record, derived from the card id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn for_card(card_id: &Uuid) -> Self {
        RemoteId(card_id.to_string())
    }

    /// Parse an id taken from a listing
    pub fn parse(id: &str) -> Result<Self> {
        Uuid::parse_str(id)
            .map(|uuid| RemoteId::for_card(&uuid))
            .map_err(|_| Error::MalformedInput(format!("Invalid record id: {}", id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn card_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.0).ok()
    }

    pub fn record_key(&self) -> String {
        format!("{}{}", RECORD_PREFIX, self.0)
    }

    pub fn asset_prefix(&self) -> String {
        format!("{}{}/", ASSET_PREFIX, self.0)
    }

    /// Key of one asset object, `name` as given by `AssetRef::object_name`
    pub fn asset_key(&self, name: &str) -> String {
        format!("{}{}/{}", ASSET_PREFIX, self.0, name)
    }

    /// Record an asset key belongs to
    pub fn owning_asset(key: &str) -> Option<Self> {
        let (id, _) = key.strip_prefix(ASSET_PREFIX)?.split_once('/')?;
        RemoteId::parse(id).ok()
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Argon2 parameters recorded in the header, so every session derives the
/// key with the parameters the vault was created with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    pub fn to_config(&self, salt: &[u8]) -> EncryptionConfig {
        EncryptionConfig {
            argon2_memory_kib: self.memory_kib,
            argon2_iterations: self.iterations,
            argon2_parallelism: self.parallelism,
            salt: salt.to_vec(),
        }
    }
}

/// Unencrypted vault header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultHeader {
    pub format_version: u8,
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    pub kdf: KdfParams,
    pub created_at: DateTime<Utc>,
    /// Known plaintext encrypted under the vault key
    pub verifier: EncryptedData,
}

impl VaultHeader {
    pub fn new(salt: Vec<u8>, config: &EncryptionConfig, verifier: EncryptedData) -> Self {
        VaultHeader {
            format_version: FORMAT_VERSION,
            salt,
            kdf: KdfParams {
                memory_kib: config.argon2_memory_kib,
                iterations: config.argon2_iterations,
                parallelism: config.argon2_parallelism,
            },
            created_at: Utc::now(),
            verifier,
        }
    }

    pub fn encryption_config(&self) -> EncryptionConfig {
        self.kdf.to_config(&self.salt)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: VaultHeader = serde_json::from_slice(bytes)
            .map_err(|e| Error::MalformedInput(format!("Invalid vault header: {}", e)))?;
        if header.format_version != FORMAT_VERSION {
            return Err(Error::MalformedInput(format!(
                "Unsupported vault format version {}",
                header.format_version
            )));
        }
        Ok(header)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
