//! Local filesystem backend.
//!
//! Blobs live directly under a base directory mirroring the key
//! hierarchy, with a `.meta` JSON sidecar. Writes land in a temp file and
//! are renamed into place so a concurrent reader never sees a partial
//! blob.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;

use crate::{validate_key, BlobMetadata, MultipartWriter, ObjectStore, Result, StoreError};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct LocalStore {
    base_dir: PathBuf,
}

impl LocalStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.base_dir.join(key))
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".meta");
        path.with_file_name(name)
    }

    fn temp_path(&self, path: &Path) -> PathBuf {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(&format!(".tmp-{}-{seq}", std::process::id()));
        path.with_file_name(name)
    }

    async fn write_meta(path: &Path, metadata: &BlobMetadata) -> Result<()> {
        let json = serde_json::to_vec(metadata)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        tokio::fs::write(Self::meta_path(path), json).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, key: &str, content: Bytes, mut metadata: BlobMetadata) -> Result<String> {
        let path = self.blob_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = self.temp_path(&path);
        tokio::fs::write(&temp, &content).await?;
        tokio::fs::rename(&temp, &path).await?;

        metadata.size = content.len() as u64;
        metadata.modified_at = Some(Utc::now());
        Self::write_meta(&path, &metadata).await?;

        tracing::debug!(key, size = content.len(), "stored local blob");
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.blob_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_url(&self, key: &str, _ttl: Duration) -> Result<String> {
        let path = self.blob_path(key)?;
        if !path.exists() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(path.to_string_lossy().into_owned())
    }

    async fn delete(&self, key: &str) -> bool {
        let Ok(path) = self.blob_path(key) else {
            return false;
        };
        let removed = tokio::fs::remove_file(&path).await.is_ok();
        let _ = tokio::fs::remove_file(Self::meta_path(&path)).await;
        removed
    }

    async fn exists(&self, key: &str) -> bool {
        self.blob_path(key).map(|p| p.exists()).unwrap_or(false)
    }

    async fn stat(&self, key: &str) -> Result<BlobMetadata> {
        let path = self.blob_path(key)?;
        let fs_meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut metadata = match tokio::fs::read(Self::meta_path(&path)).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => BlobMetadata::default(),
        };
        metadata.size = fs_meta.len();
        Ok(metadata)
    }

    async fn begin_multipart(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<Box<dyn MultipartWriter>> {
        let path = self.blob_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.temp_path(&path);
        let file = tokio::fs::File::create(&temp).await?;
        Ok(Box::new(LocalMultipart {
            file: Some(file),
            temp,
            path,
            key: key.to_string(),
            content_type: content_type.to_string(),
            written: 0,
        }))
    }
}

struct LocalMultipart {
    file: Option<tokio::fs::File>,
    temp: PathBuf,
    path: PathBuf,
    key: String,
    content_type: String,
    written: u64,
}

#[async_trait::async_trait]
impl MultipartWriter for LocalMultipart {
    async fn write_part(&mut self, part: Bytes) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("multipart already closed".to_string()))?;
        file.write_all(&part).await?;
        self.written += part.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<String> {
        use tokio::io::AsyncWriteExt;
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        tokio::fs::rename(&self.temp, &self.path).await?;

        let metadata = BlobMetadata {
            size: self.written,
            content_type: self.content_type.clone(),
            modified_at: Some(Utc::now()),
            custom: Default::default(),
        };
        LocalStore::write_meta(&self.path, &metadata).await?;
        Ok(self.key.clone())
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        self.file.take();
        let _ = tokio::fs::remove_file(&self.temp).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (_dir, store) = store();
        let meta = BlobMetadata {
            content_type: "audio/wav".to_string(),
            ..Default::default()
        };
        store
            .put("sessions/s1/chunks/0000", Bytes::from_static(b"abc"), meta)
            .await
            .unwrap();

        let data = store.get("sessions/s1/chunks/0000").await.unwrap();
        assert_eq!(&data[..], b"abc");

        let stat = store.stat("sessions/s1/chunks/0000").await.unwrap();
        assert_eq!(stat.size, 3);
        assert_eq!(stat.content_type, "audio/wav");
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get("jobs/nope/a").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(!store.exists("jobs/nope/a").await);
    }

    #[tokio::test]
    async fn test_delete_is_best_effort() {
        let (_dir, store) = store();
        assert!(!store.delete("jobs/missing/blob").await);
        store
            .put("jobs/j/blob", Bytes::from_static(b"x"), BlobMetadata::default())
            .await
            .unwrap();
        assert!(store.delete("jobs/j/blob").await);
        assert!(!store.exists("jobs/j/blob").await);
    }

    #[tokio::test]
    async fn test_multipart_assembles_in_order() {
        let (_dir, store) = store();
        let mut writer = store.begin_multipart("jobs/j/full", "audio/wav").await.unwrap();
        writer.write_part(Bytes::from_static(b"hello ")).await.unwrap();
        writer.write_part(Bytes::from_static(b"world")).await.unwrap();
        let key = writer.finish().await.unwrap();

        let data = store.get(&key).await.unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn test_multipart_abort_leaves_nothing() {
        let (_dir, store) = store();
        let mut writer = store.begin_multipart("jobs/j/gone", "audio/wav").await.unwrap();
        writer.write_part(Bytes::from_static(b"partial")).await.unwrap();
        writer.abort().await.unwrap();
        assert!(!store.exists("jobs/j/gone").await);
    }

    #[tokio::test]
    async fn test_get_url_is_absolute_path() {
        let (_dir, store) = store();
        store
            .put("temp/t.txt", Bytes::from_static(b"x"), BlobMetadata::default())
            .await
            .unwrap();
        let url = store
            .get_url("temp/t.txt", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with('/'));
        assert!(url.ends_with("temp/t.txt"));
    }
}
