//! Filesystem implementation of ObjectStore
//!
//! Objects live at `<root>/<container>/<key>`. Writes go to a temporary
//! sibling first and are renamed into place, so readers never observe a
//! partially written object.

use crate::{validate_location, ContentStoreError, ContentStoreResult};
use async_trait::async_trait;
use rivulet_core::{CoreError, ObjectStore};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Object store rooted at a local directory
#[derive(Debug, Clone)]
pub struct FileObjectStore {
    root: PathBuf,
}

impl FileObjectStore {
    /// Create a store rooted at `root`; the directory is created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, container: &str, key: &str) -> ContentStoreResult<PathBuf> {
        validate_location(container, key)?;
        let mut path = self.root.join(container);
        for segment in key.split('/') {
            path.push(segment);
        }
        Ok(path)
    }

    /// Write an object
    pub async fn write(&self, container: &str, key: &str, bytes: &[u8]) -> ContentStoreResult<()> {
        let path = self.path_for(container, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut temp = path.clone().into_os_string();
        temp.push(format!(".tmp-{}", Uuid::new_v4()));
        let temp = PathBuf::from(temp);

        tokio::fs::write(&temp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!(container = %container, key = %key, bytes = bytes.len(), "Object written");
        Ok(())
    }

    /// Read an object
    pub async fn read(&self, container: &str, key: &str) -> ContentStoreResult<Vec<u8>> {
        let path = self.path_for(container, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ContentStoreError::NotFound {
                container: container.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    async fn put(&self, container: &str, key: &str, bytes: Vec<u8>) -> Result<(), CoreError> {
        Ok(self.write(container, key, &bytes).await?)
    }

    async fn get(&self, container: &str, key: &str) -> Result<Vec<u8>, CoreError> {
        Ok(self.read(container, key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_and_get() {
        let dir = TempDir::new().unwrap();
        let store = FileObjectStore::new(dir.path());

        store
            .put("large", "exec-1/report/abc.json", b"\"hello\"".to_vec())
            .await
            .unwrap();
        let bytes = store.get("large", "exec-1/report/abc.json").await.unwrap();
        assert_eq!(bytes, b"\"hello\"");
        assert!(dir.path().join("large/exec-1/report/abc.json").exists());
    }

    #[tokio::test]
    async fn test_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = FileObjectStore::new(dir.path());

        store.put("c", "k", b"one".to_vec()).await.unwrap();
        store.put("c", "k", b"two".to_vec()).await.unwrap();
        assert_eq!(store.get("c", "k").await.unwrap(), b"two");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("c")).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_object_is_infrastructure_error() {
        let dir = TempDir::new().unwrap();
        let store = FileObjectStore::new(dir.path());

        assert!(matches!(
            store.read("c", "missing").await,
            Err(ContentStoreError::NotFound { .. })
        ));
        let err = store.get("c", "missing").await.unwrap_err();
        assert!(err.is_infrastructure());
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let store = FileObjectStore::new(dir.path().join("root"));

        let err = store.write("c", "../../escape", b"x").await.unwrap_err();
        assert!(matches!(err, ContentStoreError::InvalidLocation(_)));
    }
}
