//! Object-storage abstraction.
//!
//! One [`ObjectStore`] trait with interchangeable backends: a local
//! filesystem store (absolute paths as URLs) and an S3 store (presigned
//! URLs). Puts are atomic from a reader's perspective; large blobs are
//! assembled through [`MultipartWriter`] so memory stays bounded by the
//! part size.

mod local;
mod s3;

pub use local::LocalStore;
pub use s3::S3Store;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(err.to_string())
        } else {
            StoreError::Unavailable(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Metadata returned by `stat` and attached on `put`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub size: u64,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
    /// Backend-opaque key/value pairs carried alongside the blob.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
}

/// Incremental writer for assembling one blob from many parts.
///
/// Nothing is observable under the final key until `finish` returns; an
/// aborted upload leaves no trace.
#[async_trait::async_trait]
pub trait MultipartWriter: Send {
    async fn write_part(&mut self, part: Bytes) -> Result<()>;
    async fn finish(self: Box<Self>) -> Result<String>;
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Content-addressed blob operations shared by all backends.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a blob, returning the key it is reachable under.
    async fn put(&self, key: &str, content: Bytes, metadata: BlobMetadata) -> Result<String>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    /// A local absolute path or a time-limited signed URL.
    async fn get_url(&self, key: &str, ttl: Duration) -> Result<String>;

    /// Best-effort delete. Returns whether the blob was removed; never
    /// fails on a missing key.
    async fn delete(&self, key: &str) -> bool;

    async fn exists(&self, key: &str) -> bool;

    async fn stat(&self, key: &str) -> Result<BlobMetadata>;

    /// Begin a streaming multi-part write under `key`.
    async fn begin_multipart(&self, key: &str, content_type: &str)
        -> Result<Box<dyn MultipartWriter>>;
}

/// Derive a content type from the filename extension; opaque binary when
/// unknown.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "txt" => "text/plain",
        "json" => "application/json",
        "srt" => "application/x-subrip",
        "vtt" => "text/vtt",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        "mp4" => "video/mp4",
        "webm" => "audio/webm",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

/// Reject traversal and absolute keys before they reach a backend.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Hierarchical key layout used across the plane.
pub mod keys {
    use chrono::{DateTime, Datelike, Utc};

    /// Blob belonging to a batch job.
    pub fn job(job_id: &str, name: &str) -> String {
        format!("jobs/{job_id}/{name}")
    }

    /// User-owned blob, partitioned by upload date.
    pub fn user(user_id: &str, at: DateTime<Utc>, name: &str) -> String {
        format!(
            "users/{user_id}/{:04}/{:02}/{:02}/{name}",
            at.year(),
            at.month(),
            at.day()
        )
    }

    /// Chunk of a resumable upload session.
    pub fn upload_chunk(upload_id: &str, idx: u32) -> String {
        format!("sessions/{upload_id}/chunks/{idx:04}")
    }

    /// Audio chunk of a live streaming session.
    pub fn live_chunk(session_id: &str, idx: u32) -> String {
        format!("sessions/{session_id}/chunks/{idx}.wav")
    }

    pub fn temp(name: &str) -> String {
        format!("temp/{name}")
    }
}

/// Running counters surfaced under the `system:metrics` cache key.
#[derive(Debug, Default)]
pub struct UsageCounters {
    files_stored: AtomicU64,
    bytes_stored: AtomicU64,
    files_retrieved: AtomicU64,
    bytes_retrieved: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub files_stored: u64,
    pub bytes_stored: u64,
    pub files_retrieved: u64,
    pub bytes_retrieved: u64,
}

/// Backend plus usage accounting; the handle services share.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn ObjectStore>,
    usage: Arc<UsageCounters>,
}

impl Storage {
    pub fn new(backend: Arc<dyn ObjectStore>) -> Self {
        Self {
            backend,
            usage: Arc::new(UsageCounters::default()),
        }
    }

    pub async fn put(&self, key: &str, content: Bytes, metadata: BlobMetadata) -> Result<String> {
        let size = content.len() as u64;
        let key = self.backend.put(key, content, metadata).await?;
        self.usage.files_stored.fetch_add(1, Ordering::Relaxed);
        self.usage.bytes_stored.fetch_add(size, Ordering::Relaxed);
        Ok(key)
    }

    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let content = self.backend.get(key).await?;
        self.usage.files_retrieved.fetch_add(1, Ordering::Relaxed);
        self.usage
            .bytes_retrieved
            .fetch_add(content.len() as u64, Ordering::Relaxed);
        Ok(content)
    }

    pub async fn get_url(&self, key: &str, ttl: Duration) -> Result<String> {
        self.backend.get_url(key, ttl).await
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.backend.delete(key).await
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.backend.exists(key).await
    }

    pub async fn stat(&self, key: &str) -> Result<BlobMetadata> {
        self.backend.stat(key).await
    }

    pub async fn begin_multipart(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<Box<dyn MultipartWriter>> {
        self.backend.begin_multipart(key, content_type).await
    }

    pub fn usage(&self) -> UsageSnapshot {
        UsageSnapshot {
            files_stored: self.usage.files_stored.load(Ordering::Relaxed),
            bytes_stored: self.usage.bytes_stored.load(Ordering::Relaxed),
            files_retrieved: self.usage.files_retrieved.load(Ordering::Relaxed),
            bytes_retrieved: self.usage.bytes_retrieved.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_mapping() {
        assert_eq!(content_type_for("a.wav"), "audio/wav");
        assert_eq!(content_type_for("a.srt"), "application/x-subrip");
        assert_eq!(content_type_for("weird.bin"), "application/octet-stream");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(keys::upload_chunk("u1", 7), "sessions/u1/chunks/0007");
        assert_eq!(keys::live_chunk("s1", 7), "sessions/s1/chunks/7.wav");
        assert_eq!(keys::job("j1", "audio.wav"), "jobs/j1/audio.wav");
    }

    #[test]
    fn test_validate_key_rejects_traversal() {
        assert!(validate_key("jobs/j1/a.wav").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/abs/path").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("").is_err());
    }
}
