//! Short-TTL result cache.
//!
//! Fixed key namespaces with per-namespace default TTLs, behind a
//! [`CacheBackend`] trait with Redis, in-memory, and disabled
//! implementations. The in-memory backend evicts in
//! least-recently-inserted order when full.

mod memory;
mod redis_backend;

pub use memory::MemoryCache;
pub use redis_backend::RedisCache;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// TTL for a set. `Default` resolves from the key's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Default,
    Seconds(u64),
    /// Persist until eviction.
    None,
}

/// The fixed cache namespaces and their default TTLs.
pub mod keys {
    pub fn job_status(job_id: &str) -> String {
        format!("job_status:{job_id}")
    }

    pub fn transcription(job_id: &str, format: &str) -> String {
        format!("transcription:{job_id}:{format}")
    }

    pub fn user_jobs(user_id: &str) -> String {
        format!("user_jobs:{user_id}")
    }

    pub fn system_metrics() -> String {
        "system:metrics".to_string()
    }

    pub fn file_meta(storage_key: &str) -> String {
        format!("file_meta:{}", sanitize(storage_key))
    }

    fn sanitize(key: &str) -> String {
        key.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }

    /// Default TTL in seconds for a namespaced key.
    pub fn default_ttl_s(key: &str) -> u64 {
        if key.starts_with("job_status:") {
            3600
        } else if key.starts_with("transcription:") {
            86_400
        } else if key.starts_with("user_jobs:") {
            300
        } else if key == "system:metrics" {
            60
        } else if key.starts_with("file_meta:") {
            21_600
        } else {
            3600
        }
    }
}

#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// `ttl_s = 0` persists the entry until eviction.
    async fn set(&self, key: &str, value: Vec<u8>, ttl_s: u64) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn clear(&self) -> Result<()>;
}

/// Cache handle shared by services. Disabled mode turns every get into a
/// miss and every set into a no-op success.
#[derive(Clone)]
pub struct Cache {
    backend: Option<Arc<dyn CacheBackend>>,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn disabled() -> Self {
        Self { backend: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let backend = self.backend.as_ref()?;
        match backend.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache get failed, treating as miss");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Ttl) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return true;
        };
        let ttl_s = match ttl {
            Ttl::Default => keys::default_ttl_s(key),
            Ttl::Seconds(s) => s,
            Ttl::None => 0,
        };
        match backend.set(key, value, ttl_s).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache set failed");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        backend.delete(key).await.unwrap_or(false)
    }

    pub async fn exists(&self, key: &str) -> bool {
        let Some(backend) = self.backend.as_ref() else {
            return false;
        };
        backend.exists(key).await.unwrap_or(false)
    }

    pub async fn clear(&self) {
        if let Some(backend) = self.backend.as_ref() {
            if let Err(e) = backend.clear().await {
                tracing::warn!(error = %e, "cache clear failed");
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        serde_json::from_slice(&raw).ok()
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Ttl) -> bool {
        match serde_json::to_vec(value) {
            Ok(raw) => self.set(key, raw, ttl).await,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache serialization failed");
                false
            }
        }
    }

    /// Drop the caller's job-list entry; called on every job create,
    /// delete, and terminal-state transition.
    pub async fn invalidate_user_jobs(&self, user_id: &str) {
        self.delete(&keys::user_jobs(user_id)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_defaults() {
        assert_eq!(keys::default_ttl_s(&keys::job_status("j1")), 3600);
        assert_eq!(keys::default_ttl_s(&keys::transcription("j1", "srt")), 86_400);
        assert_eq!(keys::default_ttl_s(&keys::user_jobs("u1")), 300);
        assert_eq!(keys::default_ttl_s(&keys::system_metrics()), 60);
        assert_eq!(keys::default_ttl_s(&keys::file_meta("jobs/j1/a.wav")), 21_600);
    }

    #[test]
    fn test_file_meta_sanitized() {
        assert_eq!(
            keys::file_meta("jobs/j1/audio.wav"),
            "file_meta:jobs_j1_audio_wav"
        );
    }

    #[tokio::test]
    async fn test_disabled_mode() {
        let cache = Cache::disabled();
        assert!(cache.set("job_status:j1", b"x".to_vec(), Ttl::Default).await);
        assert_eq!(cache.get("job_status:j1").await, None);
        assert!(!cache.exists("job_status:j1").await);
    }

    #[tokio::test]
    async fn test_enabled_round_trip() {
        let cache = Cache::new(Arc::new(MemoryCache::new(16)));
        assert!(cache.set("job_status:j1", b"done".to_vec(), Ttl::Default).await);
        assert_eq!(cache.get("job_status:j1").await, Some(b"done".to_vec()));
        assert!(cache.delete("job_status:j1").await);
        assert_eq!(cache.get("job_status:j1").await, None);
    }
}
