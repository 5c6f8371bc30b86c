use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;

use crate::config::{StorageKind, StorageSettings};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid blob key: {0}")]
    InvalidKey(String),
    #[error("storage backend {0:?} is not available in this build")]
    Unsupported(StorageKind),
}

/// Where attachment payloads live. Rows in the database only carry blob
/// keys.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

pub fn from_settings(settings: &StorageSettings) -> Result<Arc<dyn BlobStore>, StorageError> {
    match settings.kind {
        StorageKind::Local => Ok(Arc::new(LocalStore::new(&settings.path))),
        StorageKind::S3 => Err(StorageError::Unsupported(StorageKind::S3)),
    }
}

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        Ok(fs::read(path).await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use uuid::Uuid;

    fn store() -> LocalStore {
        LocalStore::new(std::env::temp_dir().join(format!("sendmill-test-{}", Uuid::new_v4())))
    }

    #[tokio::test]
    async fn blobs_round_trip() {
        let store = store();
        store.put("inbound/abc/report.pdf", b"payload").await.unwrap();
        assert_eq!(store.get("inbound/abc/report.pdf").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn path_traversal_keys_are_rejected() {
        let store = store();
        for key in ["../escape", "/absolute", "a//b", "a/./b", ""] {
            assert!(
                matches!(store.put(key, b"x").await, Err(StorageError::InvalidKey(_))),
                "key {key:?} should be rejected"
            );
        }
    }

    #[test]
    fn s3_is_rejected_at_startup() {
        let settings = StorageSettings {
            kind: StorageKind::S3,
            path: String::new(),
        };
        assert!(matches!(
            from_settings(&settings),
            Err(StorageError::Unsupported(StorageKind::S3))
        ));
    }
}
