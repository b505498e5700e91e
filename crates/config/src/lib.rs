//! Typed configuration for the processing plane.
//!
//! Every recognized environment key has a default, so a bare process comes
//! up with local storage, in-memory caching, and limits enabled. Services
//! receive their sub-config by value at construction; nothing reads the
//! environment after startup.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Which object-storage backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub s3_bucket: String,
    pub s3_region: String,
    pub local_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Local,
            s3_bucket: "murmur-transcription-storage".to_string(),
            s3_region: "us-east-1".to_string(),
            local_dir: "/tmp/murmur_storage".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub kind: CacheKind,
    /// Applied when a set carries no explicit TTL and the key matches no
    /// namespace default.
    pub default_ttl_s: u64,
    /// Entry cap for the in-memory backend.
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: CacheKind::Memory,
            default_ttl_s: 3600,
            max_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub rate_limiting_enabled: bool,
    pub quota_enabled: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_limiting_enabled: true,
            quota_enabled: true,
        }
    }
}

/// Streaming time constants (§ live transcription).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub chunk_ms: u64,
    pub overlap_ms: u64,
    pub commit_window_ms: u64,
    /// A session with no chunk activity for this long is considered idle
    /// and its dispatcher worker shuts down.
    pub idle_timeout_s: u64,
    /// TTL applied to every per-session Redis key.
    pub state_ttl_s: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            chunk_ms: 5000,
            overlap_ms: 750,
            commit_window_ms: 2500,
            idle_timeout_s: 90,
            state_ttl_s: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    pub primary_key: Option<String>,
    pub fallback_key: Option<String>,
    /// Per-call timeout for streaming chunks.
    pub streaming_timeout_s: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            primary_key: None,
            fallback_key: None,
            streaming_timeout_s: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Batch worker pool size.
    pub workers: usize,
    /// Concurrent STT calls within one job's transcribing stage.
    pub transcribe_concurrency: usize,
    /// Provider upload ceiling; segments never exceed this.
    pub max_segment_bytes: u64,
    pub segment_overlap_ms: u64,
    pub max_retries: u32,
    /// Resumable-upload chunk size handed to clients.
    pub upload_chunk_size: u64,
    pub max_file_size: u64,
    pub upload_session_ttl_s: u64,
    pub max_duration_hours: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            transcribe_concurrency: 4,
            max_segment_bytes: 24 * 1024 * 1024,
            segment_overlap_ms: 750,
            max_retries: 3,
            upload_chunk_size: 5 * 1024 * 1024,
            max_file_size: 2 * 1024 * 1024 * 1024,
            upload_session_ttl_s: 24 * 3600,
            max_duration_hours: 8,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub limits: LimitsConfig,
    pub live: LiveConfig,
    pub stt: SttConfig,
    pub pipeline: PipelineConfig,
    pub redis_url: Option<String>,
}

impl Config {
    /// Read the environment envelope; unknown keys are ignored, absent
    /// keys fall back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();

        if let Some(v) = env("STORAGE_TYPE") {
            cfg.storage.kind = match v.to_lowercase().as_str() {
                "local" => StorageKind::Local,
                "s3" => StorageKind::S3,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "STORAGE_TYPE".into(),
                        value: v,
                    })
                }
            };
        }
        if let Some(v) = env("S3_BUCKET_NAME") {
            cfg.storage.s3_bucket = v;
        }
        if let Some(v) = env("LOCAL_STORAGE_DIR") {
            cfg.storage.local_dir = v;
        }
        cfg.redis_url = env("REDIS_URL");

        if let Some(v) = env("CACHE_ENABLED") {
            cfg.cache.enabled = parse_bool("CACHE_ENABLED", &v)?;
        }
        if let Some(v) = env("CACHE_TYPE") {
            cfg.cache.kind = match v.to_lowercase().as_str() {
                "redis" => CacheKind::Redis,
                "memory" => CacheKind::Memory,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "CACHE_TYPE".into(),
                        value: v,
                    })
                }
            };
        }
        if let Some(v) = env("CACHE_DEFAULT_TTL") {
            cfg.cache.default_ttl_s = parse_num("CACHE_DEFAULT_TTL", &v)?;
        }
        if let Some(v) = env("CACHE_MAX_SIZE") {
            cfg.cache.max_size = parse_num("CACHE_MAX_SIZE", &v)?;
        }

        if let Some(v) = env("RATE_LIMITING_ENABLED") {
            cfg.limits.rate_limiting_enabled = parse_bool("RATE_LIMITING_ENABLED", &v)?;
        }
        if let Some(v) = env("QUOTA_ENABLED") {
            cfg.limits.quota_enabled = parse_bool("QUOTA_ENABLED", &v)?;
        }

        if let Some(v) = env("AUDIO_CHUNK_MS") {
            cfg.live.chunk_ms = parse_num("AUDIO_CHUNK_MS", &v)?;
        }
        if let Some(v) = env("AUDIO_OVERLAP_MS") {
            cfg.live.overlap_ms = parse_num("AUDIO_OVERLAP_MS", &v)?;
        }
        if let Some(v) = env("COMMIT_WINDOW_MS") {
            cfg.live.commit_window_ms = parse_num("COMMIT_WINDOW_MS", &v)?;
        }
        if let Some(v) = env("MEETING_IDLE_TIMEOUT_SEC") {
            cfg.live.idle_timeout_s = parse_num("MEETING_IDLE_TIMEOUT_SEC", &v)?;
        }

        cfg.stt.primary_key = env("STT_PRIMARY_KEY");
        cfg.stt.fallback_key = env("STT_FALLBACK_KEY");

        Ok(cfg)
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.into(),
            value: value.into(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.into(),
        value: value.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.storage.kind, StorageKind::Local);
        assert_eq!(cfg.live.chunk_ms, 5000);
        assert_eq!(cfg.live.overlap_ms, 750);
        assert_eq!(cfg.live.commit_window_ms, 2500);
        assert_eq!(cfg.live.idle_timeout_s, 90);
        assert_eq!(cfg.live.state_ttl_s, 86_400);
        assert!(cfg.limits.rate_limiting_enabled);
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("K", "true").unwrap());
        assert!(!parse_bool("K", "0").unwrap());
        assert!(parse_bool("K", "maybe").is_err());
    }
}
