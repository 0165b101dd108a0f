use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::StoreError;

/// Append-friendly blob namespace rooted at `jobs/{owner_id}/{job_id}/…`.
/// Writes are full-blob replacements; stable keys make retries overwrite
/// rather than duplicate.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

pub async fn put_json<T: Serialize>(
    store: &dyn ObjectStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.put(key, bytes).await
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<T, StoreError> {
    let bytes = store.get(key).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub async fn get_string(store: &dyn ObjectStore, key: &str) -> Result<String, StoreError> {
    let bytes = store.get(key).await?;
    String::from_utf8(bytes).map_err(|_| StoreError::InvalidKey(key.to_string()))
}

/// Filesystem-backed object store. Each blob is a file under the base
/// directory; writes go through a temp file and rename so a canonical key
/// never holds a partial blob.
pub struct FsObjectStore {
    base: PathBuf,
}

impl FsObjectStore {
    pub async fn new(base: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        Ok(Self { base })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.base.join(key))
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = key.starts_with("jobs/")
        && !key.ends_with('/')
        && key
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.resolve(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        validate_key(prefix.trim_end_matches('/'))?;
        let root = self.base.join(prefix);
        if !fs::try_exists(&root).await? {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.base) {
                    let key = relative.to_string_lossy().replace('\\', "/");
                    if !key.contains(".tmp-") {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
