//! Cryptography module for cardvault
//!
//! Provides AES-256-GCM encryption with Argon2id key derivation.
//! All card data is encrypted before it reaches a remote store, and the
//! key never leaves process memory.

mod encryption;
mod engine;
mod envelope;
mod kdf;
mod keys;

pub use encryption::{decrypt, encrypt, EncryptedData};
pub use engine::CryptoEngine;
pub use envelope::{RecordEnvelope, ENVELOPE_MAGIC, FORMAT_VERSION};
pub use kdf::{derive_key, generate_salt};
pub use keys::{SaltRef, VaultKeyMaterial};

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Size of salt for key derivation
pub const SALT_SIZE: usize = 32;
