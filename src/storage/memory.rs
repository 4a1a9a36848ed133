//! In-process remote store
//!
//! Holds objects in a sorted map. Besides serving as a throwaway backend it
//! can inject failures per key and operation, which the reconciliation
//! tests rely on to exercise partial failure.

use crate::error::{Error, Result};
use crate::storage::{ListPage, ObjectMeta, RemoteStore, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Provider operation, used to target injected faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    List,
    Head,
    Get,
    Put,
    Delete,
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    /// Fail with a network error
    Fail,
    /// Never complete
    Stall,
}

/// In-memory object store
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    faults: Mutex<HashMap<(StoreOp, String), Fault>>,
    writes: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` on `key` fail with a network error until cleared.
    /// For [`StoreOp::List`] the key is the listing prefix.
    pub fn fail_on(&self, op: StoreOp, key: &str) {
        self.faults.lock().insert((op, key.to_string()), Fault::Fail);
    }

    /// Make `op` on `key` hang forever until cleared
    pub fn stall_on(&self, op: StoreOp, key: &str) {
        self.faults.lock().insert((op, key.to_string()), Fault::Stall);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Successful puts since creation
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Successful deletes of existing objects since creation
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// All keys currently stored
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    /// Raw body of an object
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).map(|o| o.body.clone())
    }

    /// Replace the body of an existing object in place, bypassing `put`,
    /// to simulate corruption or tampering on the provider side
    pub fn overwrite_raw(&self, key: &str, body: Bytes) -> bool {
        match self.objects.write().get_mut(key) {
            Some(object) => {
                object.meta.size = body.len() as u64;
                object.body = body;
                true
            }
            None => false,
        }
    }

    async fn check_fault(&self, op: StoreOp, key: &str) -> Result<()> {
        let fault = self.faults.lock().get(&(op, key.to_string())).copied();
        match fault {
            None => Ok(()),
            Some(Fault::Fail) => Err(Error::NetworkFailure(format!(
                "injected {:?} failure for {}",
                op, key
            ))),
            Some(Fault::Stall) => {
                futures::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list_page(&self, prefix: &str, cursor: Option<&str>, limit: usize) -> Result<ListPage> {
        self.check_fault(StoreOp::List, prefix).await?;

        let objects = self.objects.read();
        let mut page: Vec<ObjectMeta> = objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| cursor.map_or(true, |c| key.as_str() > c))
            .take(limit.saturating_add(1))
            .map(|(_, object)| object.meta.clone())
            .collect();

        let next_cursor = if page.len() > limit {
            page.truncate(limit);
            page.last().map(|meta| meta.key.clone())
        } else {
            None
        };

        Ok(ListPage {
            objects: page,
            next_cursor,
        })
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        self.check_fault(StoreOp::Head, key).await?;
        Ok(self.objects.read().get(key).map(|o| o.meta.clone()))
    }

    async fn get(&self, key: &str) -> Result<StoredObject> {
        self.check_fault(StoreOp::Get, key).await?;
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, body: Bytes, fingerprint: Option<String>) -> Result<ObjectMeta> {
        self.check_fault(StoreOp::Put, key).await?;

        let meta = ObjectMeta {
            key: key.to_string(),
            size: body.len() as u64,
            last_modified: Utc::now(),
            fingerprint,
        };
        self.objects.write().insert(
            key.to_string(),
            StoredObject {
                body,
                meta: meta.clone(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(meta)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_fault(StoreOp::Delete, key).await?;
        let existed = self.objects.write().remove(key).is_some();
        if existed {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();
        store
            .put("records/a", Bytes::from_static(b"hello"), Some("fp".to_string()))
            .await
            .unwrap();

        let object = store.get("records/a").await.unwrap();
        assert_eq!(&object.body[..], b"hello");
        assert_eq!(object.meta.size, 5);
        assert_eq!(object.meta.fingerprint.as_deref(), Some("fp"));

        assert!(store.delete("records/a").await.unwrap());
        assert!(!store.delete("records/a").await.unwrap());
        assert!(matches!(store.get("records/a").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_listing_pages_by_prefix() {
        let store = MemoryStore::new();
        for key in ["records/1", "records/2", "records/3", "assets/1/x", "vault.json"] {
            store.put(key, Bytes::from_static(b"x"), None).await.unwrap();
        }

        let first = store.list_page("records/", None, 2).await.unwrap();
        let keys: Vec<_> = first.objects.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["records/1", "records/2"]);
        assert_eq!(first.next_cursor.as_deref(), Some("records/2"));

        let second = store
            .list_page("records/", first.next_cursor.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(second.objects.len(), 1);
        assert_eq!(second.objects[0].key, "records/3");
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = MemoryStore::new();
        store.put("records/a", Bytes::from_static(b"x"), None).await.unwrap();
        store.fail_on(StoreOp::Get, "records/a");

        assert!(matches!(
            store.get("records/a").await,
            Err(Error::NetworkFailure(_))
        ));

        store.clear_faults();
        assert!(store.get("records/a").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_stall() {
        let store = MemoryStore::new();
        store.stall_on(StoreOp::Head, "records/a");
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            store.head("records/a"),
        )
        .await;
        assert!(result.is_err());
    }
}
