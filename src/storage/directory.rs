//! Directory-backed remote store
//!
//! Maps object keys onto a directory tree, e.g. inside a folder mirrored by
//! a cloud sync client. Each object `k` has an optional sidecar `k.meta`
//! holding its fingerprint. Bodies are written to a temporary file and
//! renamed into place, so a failed write never leaves a partial object.

use crate::error::{Error, Result};
use crate::storage::{ListPage, ObjectMeta, RemoteStore, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

const META_SUFFIX: &str = ".meta";
const TMP_MARKER: &str = ".tmp-";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Sidecar {
    fingerprint: Option<String>,
}

/// Remote store rooted at a local directory
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Open a store, creating the root directory if needed
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        Ok(DirectoryStore {
            root: root.as_ref().to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(META_SUFFIX);
        PathBuf::from(name)
    }

    async fn read_meta(&self, key: &str, path: &Path) -> Result<Option<ObjectMeta>> {
        let metadata = match fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(map_io(e)),
        };

        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let fingerprint = match fs::read(Self::sidecar_path(path)).await {
            Ok(bytes) => serde_json::from_slice::<Sidecar>(&bytes)
                .ok()
                .and_then(|s| s.fingerprint),
            Err(_) => None,
        };

        Ok(Some(ObjectMeta {
            key: key.to_string(),
            size: metadata.len(),
            last_modified,
            fingerprint,
        }))
    }

    /// Collect object keys under `dir`, relative to the root
    async fn walk(&self, dir: PathBuf, keys: &mut Vec<String>) -> Result<()> {
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(map_io(e)),
            };

            while let Some(entry) = entries.next_entry().await.map_err(map_io)? {
                let file_type = entry.file_type().await.map_err(map_io)?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }

                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.ends_with(META_SUFFIX) || name.contains(TMP_MARKER) {
                    continue;
                }

                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }

    async fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::Internal(format!("No parent for {}", path.display())))?;
        fs::create_dir_all(parent).await.map_err(map_io)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{}{}{}", file_name, TMP_MARKER, Uuid::new_v4()));

        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(body).await?;
            file.sync_all().await?;
            fs::rename(&tmp, path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(map_io(e));
        }
        Ok(())
    }
}

/// Keys are relative, `/`-separated, and free of `.`/`..` segments
fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('/')
        && key.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && !segment.ends_with(META_SUFFIX)
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        });

    if valid {
        Ok(())
    } else {
        Err(Error::MalformedInput(format!("Invalid object key: {}", key)))
    }
}

fn map_io(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            Error::NetworkFailure(e.to_string())
        }
        _ => Error::Io(e),
    }
}

#[async_trait]
impl RemoteStore for DirectoryStore {
    async fn list_page(&self, prefix: &str, cursor: Option<&str>, limit: usize) -> Result<ListPage> {
        // Walk the deepest directory fully named by the prefix
        let dir = match prefix.rfind('/') {
            Some(idx) => self.root.join(&prefix[..idx]),
            None => self.root.clone(),
        };

        let mut keys = Vec::new();
        self.walk(dir, &mut keys).await?;
        keys.retain(|k| k.starts_with(prefix) && cursor.map_or(true, |c| k.as_str() > c));
        keys.sort();

        let has_more = keys.len() > limit;
        keys.truncate(limit);

        let mut objects = Vec::with_capacity(keys.len());
        for key in &keys {
            // Objects deleted between walk and stat are skipped
            if let Some(meta) = self.read_meta(key, &self.root.join(key)).await? {
                objects.push(meta);
            }
        }

        let next_cursor = if has_more { keys.last().cloned() } else { None };
        Ok(ListPage {
            objects,
            next_cursor,
        })
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let path = self.object_path(key)?;
        self.read_meta(key, &path).await
    }

    async fn get(&self, key: &str) -> Result<StoredObject> {
        let path = self.object_path(key)?;
        let body = match fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(key.to_string()))
            }
            Err(e) => return Err(map_io(e)),
        };
        let meta = self
            .read_meta(key, &path)
            .await?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;

        Ok(StoredObject {
            body: Bytes::from(body),
            meta,
        })
    }

    async fn put(&self, key: &str, body: Bytes, fingerprint: Option<String>) -> Result<ObjectMeta> {
        let path = self.object_path(key)?;
        let sidecar = Self::sidecar_path(&path);

        // Drop the old fingerprint first: a body without a sidecar is
        // simply rewritten on the next push, a stale sidecar is not
        match fs::remove_file(&sidecar).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(map_io(e)),
        }

        Self::write_atomic(&path, &body).await?;

        if fingerprint.is_some() {
            let meta = serde_json::to_vec(&Sidecar {
                fingerprint: fingerprint.clone(),
            })?;
            Self::write_atomic(&sidecar, &meta).await?;
        }

        debug!("Wrote {} ({} bytes)", key, body.len());
        self.read_meta(key, &path)
            .await?
            .ok_or_else(|| Error::Internal(format!("Object {} vanished after write", key)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.object_path(key)?;

        let existed = match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(map_io(e)),
        };
        let _ = fs::remove_file(Self::sidecar_path(&path)).await;

        // Prune directories left empty, stopping at the root
        let mut dir = path.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == self.root || fs::remove_dir(&d).await.is_err() {
                break;
            }
            dir = d.parent().map(Path::to_path_buf);
        }

        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_with_fingerprint() {
        let temp = TempDir::new().unwrap();
        let store = DirectoryStore::open(temp.path()).unwrap();

        store
            .put("records/abc", Bytes::from_static(b"cipher"), Some("f1".to_string()))
            .await
            .unwrap();

        let object = store.get("records/abc").await.unwrap();
        assert_eq!(&object.body[..], b"cipher");
        assert_eq!(object.meta.fingerprint.as_deref(), Some("f1"));
        assert_eq!(object.meta.size, 6);

        // Rewrite without a fingerprint clears the old one
        store
            .put("records/abc", Bytes::from_static(b"cipher2"), None)
            .await
            .unwrap();
        let meta = store.head("records/abc").await.unwrap().unwrap();
        assert_eq!(meta.fingerprint, None);
        assert_eq!(meta.size, 7);
    }

    #[tokio::test]
    async fn test_listing_skips_sidecars_and_recurses() {
        let temp = TempDir::new().unwrap();
        let store = DirectoryStore::open(temp.path()).unwrap();

        for key in ["assets/c1/a1", "assets/c1/a2", "assets/c2/a1", "records/c1"] {
            store
                .put(key, Bytes::from_static(b"x"), Some("fp".to_string()))
                .await
                .unwrap();
        }

        let page = store.list_page("assets/", None, 10).await.unwrap();
        let keys: Vec<_> = page.objects.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["assets/c1/a1", "assets/c1/a2", "assets/c2/a1"]);

        let page = store.list_page("assets/c1/", None, 1).await.unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("assets/c1/a1"));
        let page = store
            .list_page("assets/c1/", page.next_cursor.as_deref(), 1)
            .await
            .unwrap();
        assert_eq!(page.objects[0].key, "assets/c1/a2");
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_prunes() {
        let temp = TempDir::new().unwrap();
        let store = DirectoryStore::open(temp.path()).unwrap();

        store
            .put("assets/c1/a1", Bytes::from_static(b"x"), Some("fp".to_string()))
            .await
            .unwrap();
        assert!(store.delete("assets/c1/a1").await.unwrap());
        assert!(!store.delete("assets/c1/a1").await.unwrap());
        assert!(!temp.path().join("assets").exists());
        assert!(temp.path().exists());
    }

    #[tokio::test]
    async fn test_missing_object_not_found() {
        let temp = TempDir::new().unwrap();
        let store = DirectoryStore::open(temp.path()).unwrap();
        assert!(matches!(store.get("records/none").await, Err(Error::NotFound(_))));
        assert!(store.head("records/none").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let temp = TempDir::new().unwrap();
        let store = DirectoryStore::open(temp.path()).unwrap();
        for key in ["../x", "/abs", "records//x", "records/x.meta", ""] {
            assert!(matches!(
                store.put(key, Bytes::new(), None).await,
                Err(Error::MalformedInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let temp = TempDir::new().unwrap();
        let store = DirectoryStore::open(temp.path()).unwrap();
        store
            .put("records/abc", Bytes::from_static(b"x"), Some("fp".to_string()))
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(temp.path().join("records"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.contains(TMP_MARKER)));
        assert_eq!(names.len(), 2);
    }
}
