//! Vault-aware access to a remote store
//!
//! [`StorageAdapter`] knows the object layout and the record format but never
//! sees plaintext outside of [`store`](StorageAdapter::store), which seals a
//! card before anything leaves the process. Every provider call requires a
//! signed-in identity and goes through the rate limiter and retry policy.

use crate::card::{AssetRef, Card};
use crate::config::StorageConfig;
use crate::crypto::{CryptoEngine, RecordEnvelope, SaltRef};
use crate::error::{Error, Result};
use crate::session::{PassphraseSession, SessionHandle, SessionProvider};
use crate::storage::layout::{RemoteId, VaultHeader, ASSET_PREFIX, HEADER_KEY, RECORD_PREFIX};
use crate::storage::rate_limit::{ExponentialBackoff, RateLimiter};
use crate::storage::{ListPage, ObjectMeta, RemoteStore};
use crate::usage::UsageStats;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Hex digits of the content fingerprint that name an asset version
const ASSET_VERSION_LEN: usize = 16;

/// Listing entry for one remote record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub remote_id: RemoteId,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub fingerprint: Option<String>,
}

impl RecordMeta {
    fn from_object(meta: ObjectMeta) -> Option<Self> {
        let id = meta.key.strip_prefix(RECORD_PREFIX)?;
        let remote_id = RemoteId::parse(id).ok()?;
        Some(RecordMeta {
            remote_id,
            size: meta.size,
            last_modified: meta.last_modified,
            fingerprint: meta.fingerprint,
        })
    }
}

/// One record as persisted remotely, still encrypted
#[derive(Debug, Clone)]
pub struct EncryptedRecord {
    pub remote_id: RemoteId,
    pub format_version: u8,
    pub salt_ref: SaltRef,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
    pub content_length: u64,
    pub last_modified: DateTime<Utc>,
}

impl EncryptedRecord {
    fn from_envelope(
        remote_id: RemoteId,
        envelope: RecordEnvelope,
        content_length: u64,
        last_modified: DateTime<Utc>,
    ) -> Self {
        EncryptedRecord {
            remote_id,
            format_version: envelope.version,
            salt_ref: envelope.salt_ref,
            nonce: envelope.nonce,
            ciphertext: envelope.ciphertext,
            tag: envelope.tag,
            content_length,
            last_modified,
        }
    }

    /// Envelope to hand to [`CryptoEngine::open_record`]
    pub fn envelope(&self) -> RecordEnvelope {
        RecordEnvelope {
            magic: crate::crypto::ENVELOPE_MAGIC,
            version: self.format_version,
            salt_ref: self.salt_ref,
            nonce: self.nonce.clone(),
            ciphertext: self.ciphertext.clone(),
            tag: self.tag.clone(),
        }
    }
}

/// Result of storing one card
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    pub remote_id: RemoteId,
    /// False when the remote record already matched and nothing was written
    pub written: bool,
    pub assets_written: usize,
    pub assets_removed: usize,
}

/// Encrypted record storage on top of a [`RemoteStore`]
pub struct StorageAdapter {
    store: Arc<dyn RemoteStore>,
    identity: Arc<dyn SessionProvider>,
    limiter: RateLimiter,
    config: StorageConfig,
}

impl StorageAdapter {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        identity: Arc<dyn SessionProvider>,
        config: StorageConfig,
    ) -> Self {
        let limiter = RateLimiter::new(config.max_concurrent_requests, config.requests_per_second);
        StorageAdapter {
            store,
            identity,
            limiter,
            config,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn authorize(&self) -> Result<SessionHandle> {
        self.identity.current().ok_or(Error::NotAuthenticated)
    }

    /// Run one provider call under the identity check, the rate limiter and
    /// the retry policy
    async fn call<T, F, Fut>(&self, what: &str, key: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.authorize()?;

        let mut backoff =
            ExponentialBackoff::new(self.config.retry_base_delay_ms, self.config.retry_attempts);

        loop {
            let result = {
                let _permit = self.limiter.acquire().await?;
                op().await
            };

            match result {
                Err(e) if e.is_retryable() => {
                    if let Some(delay) = backoff.next_delay() {
                        warn!("{} {} failed, retrying in {:?}: {}", what, key, delay, e);
                        tokio::time::sleep(delay).await;
                    } else {
                        error!("{} {} failed after {} retries: {}", what, key, backoff.attempts(), e);
                        return Err(e);
                    }
                }
                other => return other,
            }
        }
    }

    async fn list_page(&self, prefix: &str, cursor: Option<&str>) -> Result<ListPage> {
        let limit = self.config.list_page_size;
        self.call("List", prefix, || self.store.list_page(prefix, cursor, limit))
            .await
    }

    /// Every object under `prefix`
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.list_page(prefix, cursor.as_deref()).await?;
            objects.extend(page.objects);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(objects),
            }
        }
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        self.call("Head", key, || self.store.head(key)).await
    }

    async fn put(&self, key: &str, body: Vec<u8>, fingerprint: Option<String>) -> Result<ObjectMeta> {
        let body = Bytes::from(body);
        self.call("Put", key, || {
            self.store.put(key, body.clone(), fingerprint.clone())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.call("Delete", key, || self.store.delete(key)).await
    }

    /// Lazily list remote records, one page at a time.
    ///
    /// The stream is finite and can be restarted by calling `list` again.
    /// Objects under the record prefix that are not record ids are skipped.
    pub fn list(&self) -> impl Stream<Item = Result<RecordMeta>> + '_ {
        stream::try_unfold(Some(None::<String>), move |state| async move {
            let cursor = match state {
                Some(cursor) => cursor,
                None => return Ok::<_, Error>(None),
            };

            let page = self.list_page(RECORD_PREFIX, cursor.as_deref()).await?;
            let records: Vec<RecordMeta> = page
                .objects
                .into_iter()
                .filter_map(|meta| {
                    let key = meta.key.clone();
                    let record = RecordMeta::from_object(meta);
                    if record.is_none() {
                        warn!("Ignoring unexpected object {}", key);
                    }
                    record
                })
                .collect();

            Ok(Some((records, page.next_cursor.map(Some))))
        })
        .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, Error>)))
        .try_flatten()
    }

    /// Fetch one encrypted record
    pub async fn fetch(&self, remote_id: &RemoteId) -> Result<EncryptedRecord> {
        let key = remote_id.record_key();
        let object = self.call("Get", &key, || self.store.get(&key)).await?;
        let envelope = RecordEnvelope::from_bytes(&object.body)?;

        Ok(EncryptedRecord::from_envelope(
            remote_id.clone(),
            envelope,
            object.meta.size,
            object.meta.last_modified,
        ))
    }

    /// Fetch the encrypted images a decrypted record refers to, in order
    pub async fn fetch_assets(
        &self,
        remote_id: &RemoteId,
        assets: &[AssetRef],
    ) -> Result<Vec<RecordEnvelope>> {
        let mut envelopes = Vec::with_capacity(assets.len());
        for asset in assets {
            let key = remote_id.asset_key(&asset.object_name());
            let object = self.call("Get", &key, || self.store.get(&key)).await?;
            envelopes.push(RecordEnvelope::from_bytes(&object.body)?);
        }
        Ok(envelopes)
    }

    /// Encrypt and persist a card.
    ///
    /// Every image version gets its own object, written before the record,
    /// so the record already on the store keeps pointing at the images it
    /// was written with until the new record replaces it. If the record
    /// write fails the new image versions are deleted again; once it
    /// succeeds, versions the record no longer names are swept. When `known`
    /// (or the remote metadata) carries the same content fingerprint
    /// nothing is written.
    pub async fn store(
        &self,
        card: &Card,
        engine: &CryptoEngine,
        session: &PassphraseSession,
        known: Option<&RecordMeta>,
    ) -> Result<StoreOutcome> {
        self.authorize()?;

        let remote_id = RemoteId::for_card(&card.id);
        let record_id = remote_id.as_str();
        let record_key = remote_id.record_key();

        let mut versions = Vec::with_capacity(card.images.len());
        for image in &card.images {
            let asset_id = image.id.to_string();
            let digest = engine.fingerprint(
                session,
                &[record_id.as_bytes(), asset_id.as_bytes(), image.bytes.as_slice()],
            )?;
            versions.push(digest[..ASSET_VERSION_LEN].to_string());
        }
        let payload = card.to_payload(&versions);
        let body = Zeroizing::new(serde_json::to_vec(&payload)?);
        let fingerprint = engine.fingerprint(session, &[body.as_slice()])?;

        let remote_fingerprint = match known {
            Some(meta) => meta.fingerprint.clone(),
            None => self.head(&record_key).await?.and_then(|m| m.fingerprint),
        };
        let live: HashSet<String> = payload.assets.iter().map(AssetRef::object_name).collect();
        if remote_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            debug!("Record {} unchanged, skipping", remote_id);
            // Without a listing to go by, finish a sweep an earlier store
            // may have left behind
            let assets_removed = match known {
                Some(_) => 0,
                None => self.sweep_assets(&remote_id, &live).await,
            };
            return Ok(StoreOutcome {
                remote_id,
                written: false,
                assets_written: 0,
                assets_removed,
            });
        }

        let mut written = Vec::new();
        let result: Result<()> = async {
            for (image, asset) in card.images.iter().zip(&payload.assets) {
                let name = asset.object_name();
                let key = remote_id.asset_key(&name);
                // Same name means same content
                if self.head(&key).await?.is_some() {
                    continue;
                }

                let envelope = engine.seal_asset(session, record_id, &name, &image.bytes)?;
                self.put(&key, envelope.to_bytes()?, None).await?;
                written.push(key);
            }

            let envelope = engine.seal_record(session, record_id, &body)?;
            self.put(&record_key, envelope.to_bytes()?, Some(fingerprint))
                .await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            self.discard(&written).await;
            return Err(e);
        }

        let assets_removed = self.sweep_assets(&remote_id, &live).await;
        info!(
            "Stored record {} ({} assets written, {} removed)",
            remote_id,
            written.len(),
            assets_removed
        );
        Ok(StoreOutcome {
            remote_id,
            written: true,
            assets_written: written.len(),
            assets_removed,
        })
    }

    /// Best-effort delete of assets written by a store that did not complete
    async fn discard(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.delete(key).await {
                warn!("Could not discard unreferenced asset {}: {}", key, e);
            }
        }
    }

    /// Delete asset objects of a record whose name is not in `keep`
    async fn remove_assets(&self, remote_id: &RemoteId, keep: &HashSet<String>) -> Result<usize> {
        let prefix = remote_id.asset_prefix();
        let mut removed = 0;
        for object in self.list_objects(&prefix).await? {
            let live = object
                .key
                .strip_prefix(&prefix)
                .map_or(false, |name| keep.contains(name));
            if !live && self.delete(&object.key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// [`remove_assets`](Self::remove_assets) after a committed record write.
    /// The record is already in place, so a failure here only leaves
    /// unreferenced objects behind.
    async fn sweep_assets(&self, remote_id: &RemoteId, keep: &HashSet<String>) -> usize {
        match self.remove_assets(remote_id, keep).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Could not sweep stale assets of {}: {}", remote_id, e);
                0
            }
        }
    }

    /// Records that own at least one asset object, whether or not the
    /// record itself exists
    pub async fn asset_owners(&self) -> Result<BTreeSet<RemoteId>> {
        Ok(self
            .list_objects(ASSET_PREFIX)
            .await?
            .iter()
            .filter_map(|object| RemoteId::owning_asset(&object.key))
            .collect())
    }

    /// Delete a record and its images. Removing an absent record succeeds
    /// and returns `false`.
    pub async fn remove(&self, remote_id: &RemoteId) -> Result<bool> {
        let existed = self.delete(&remote_id.record_key()).await?;
        let assets = self.remove_assets(remote_id, &HashSet::new()).await?;
        if existed || assets > 0 {
            info!("Removed record {} and {} assets", remote_id, assets);
        }
        Ok(existed)
    }

    /// Storage statistics computed from listing metadata only
    pub async fn usage(&self) -> Result<UsageStats> {
        let mut stats = UsageStats::default();
        for object in self.list_objects(RECORD_PREFIX).await? {
            stats.total_bytes += object.size;
            stats.record_count += 1;
        }
        for object in self.list_objects(ASSET_PREFIX).await? {
            stats.total_bytes += object.size;
            stats.asset_count += 1;
        }
        Ok(stats)
    }

    /// Read the vault header, `None` if the vault was never initialized
    pub async fn read_header(&self) -> Result<Option<VaultHeader>> {
        let object = match self.call("Get", HEADER_KEY, || self.store.get(HEADER_KEY)).await {
            Ok(object) => object,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(VaultHeader::from_bytes(&object.body)?))
    }

    /// Write the header of a new vault; refuses to replace an existing one
    pub async fn write_header(&self, header: &VaultHeader) -> Result<()> {
        if self.head(HEADER_KEY).await?.is_some() {
            return Err(Error::VaultAlreadyInitialized);
        }
        self.put(HEADER_KEY, header.to_bytes()?, None).await?;
        info!("Vault header written");
        Ok(())
    }
}
