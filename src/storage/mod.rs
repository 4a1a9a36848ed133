//! Remote storage module
//!
//! A [`RemoteStore`] is a dumb provider of named byte objects (a cloud
//! bucket, a synced folder, memory). [`StorageAdapter`] layers the vault's
//! object layout, encryption, rate limiting and retries on top of it.

mod adapter;
mod directory;
mod layout;
mod memory;
mod rate_limit;

pub use adapter::{EncryptedRecord, RecordMeta, StorageAdapter, StoreOutcome};
pub use directory::DirectoryStore;
pub use layout::{RemoteId, VaultHeader, ASSET_PREFIX, HEADER_KEY, RECORD_PREFIX};
pub use memory::{MemoryStore, StoreOp};
pub use rate_limit::{ExponentialBackoff, RateLimiter};

use crate::config::{BackendConfig, StorageConfig};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Metadata of one remote object, available without transferring it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    /// Opaque content fingerprint supplied by the writer
    pub fingerprint: Option<String>,
}

/// Object body plus its metadata
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    pub meta: ObjectMeta,
}

/// One page of a listing, ordered by key
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    /// Pass back to fetch the next page; `None` on the last page
    pub next_cursor: Option<String>,
}

/// Provider of named byte objects
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List objects whose key starts with `prefix` and sorts after `cursor`
    async fn list_page(&self, prefix: &str, cursor: Option<&str>, limit: usize) -> Result<ListPage>;

    /// Metadata of one object, `None` if absent
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;

    /// Fetch one object; `Error::NotFound` if absent
    async fn get(&self, key: &str) -> Result<StoredObject>;

    /// Create or replace an object. Readers never observe a partial body.
    async fn put(&self, key: &str, body: Bytes, fingerprint: Option<String>) -> Result<ObjectMeta>;

    /// Delete an object, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Build the provider selected in the configuration
pub fn open_backend(config: &StorageConfig) -> Result<Arc<dyn RemoteStore>> {
    match &config.backend {
        BackendConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        BackendConfig::Directory { root } => Ok(Arc::new(DirectoryStore::open(root)?)),
    }
}
