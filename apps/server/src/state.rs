//! Shared service record and API error mapping.
//!
//! Every service is constructed once here and passed through axum state;
//! there are no process-global singletons.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use murmur_blobstore::{LocalStore, ObjectStore, S3Store, Storage};
use murmur_cache::{Cache, MemoryCache, RedisCache};
use murmur_config::{CacheKind, Config, StorageKind};
use murmur_ingest::IngestService;
use murmur_limits::{LimitClass, QuotaManager, RateLimiter, Tier};
use murmur_live::{
    ChunkStore, EventSink, InMemoryEventSink, LiveService, MemoryChunkStore, RedisChunkStore,
    RedisEventSink,
};
use murmur_pipeline::{
    Checkpointer, JobQueue, JobService, PipelineServices, TurnTakingDiarizer,
};
use murmur_store::Database;
use murmur_stt::{HttpSttProvider, SttFacade, SttProvider};
use murmur_transcript::CoreError;

pub struct CoreServices {
    pub config: Config,
    pub storage: Storage,
    pub cache: Cache,
    pub rate: Arc<RateLimiter>,
    pub quota: Arc<QuotaManager>,
    pub ingest: IngestService,
    pub live: LiveService,
    pub jobs: JobService,
    pub pipeline: PipelineServices,
}

impl CoreServices {
    pub async fn build(config: Config) -> anyhow::Result<Arc<Self>> {
        let backend: Arc<dyn ObjectStore> = match config.storage.kind {
            StorageKind::Local => Arc::new(LocalStore::new(&config.storage.local_dir)?),
            StorageKind::S3 => Arc::new(
                S3Store::new(
                    config.storage.s3_bucket.clone(),
                    config.storage.s3_region.clone(),
                )
                .await,
            ),
        };
        let storage = Storage::new(backend);

        let redis_conn = match &config.redis_url {
            Some(url) => {
                let client = redis::Client::open(url.as_str())?;
                let conn = client.get_connection_manager().await?;
                tracing::info!("connected to redis");
                Some(conn)
            }
            None => None,
        };

        let cache = if !config.cache.enabled {
            Cache::disabled()
        } else {
            match (config.cache.kind, redis_conn.clone()) {
                (CacheKind::Redis, Some(conn)) => Cache::new(Arc::new(RedisCache::new(conn))),
                (CacheKind::Redis, None) => {
                    tracing::warn!("CACHE_TYPE=redis but no REDIS_URL, using memory cache");
                    Cache::new(Arc::new(MemoryCache::new(config.cache.max_size)))
                }
                (CacheKind::Memory, _) => {
                    Cache::new(Arc::new(MemoryCache::new(config.cache.max_size)))
                }
            }
        };

        let chunk_store: Arc<dyn ChunkStore> = match redis_conn.clone() {
            Some(conn) => Arc::new(RedisChunkStore::new(conn, config.live.state_ttl_s)),
            None => Arc::new(MemoryChunkStore::new()),
        };
        let events: Arc<dyn EventSink> = match redis_conn {
            Some(conn) => Arc::new(RedisEventSink::new(conn)),
            None => Arc::new(InMemoryEventSink::new()),
        };

        let primary: Arc<dyn SttProvider> = Arc::new(HttpSttProvider::new(
            "primary",
            config.stt.primary_key.clone().unwrap_or_default(),
        ));
        if config.stt.primary_key.is_none() {
            tracing::warn!("no STT_PRIMARY_KEY configured, provider calls will fail");
        }
        let fallback: Option<Arc<dyn SttProvider>> = config
            .stt
            .fallback_key
            .clone()
            .map(|key| Arc::new(HttpSttProvider::new("fallback", key)) as Arc<dyn SttProvider>);
        let stt = Arc::new(SttFacade::new(primary, fallback));

        let db_path = std::path::Path::new(&config.storage.local_dir).join("murmur.db");
        let database = Arc::new(Database::open(&db_path)?);

        let rate = Arc::new(RateLimiter::new(config.limits.rate_limiting_enabled));
        let quota = Arc::new(QuotaManager::new(config.limits.quota_enabled));

        let pipeline = PipelineServices {
            repo: database.clone(),
            checkpointer: Checkpointer::new(database.clone()),
            storage: storage.clone(),
            stt: stt.clone(),
            cache: cache.clone(),
            diarizer: Arc::new(TurnTakingDiarizer::default()),
            rate: rate.clone(),
            quota: quota.clone(),
            queue: Arc::new(JobQueue::new()),
            cfg: config.pipeline.clone(),
        };

        let ingest = IngestService::new(database, storage.clone(), config.pipeline.clone());
        let live = LiveService::new(
            chunk_store,
            events,
            stt,
            storage.clone(),
            config.live.clone(),
            Duration::from_secs(config.stt.streaming_timeout_s),
        );
        let jobs = JobService::new(pipeline.clone());

        Ok(Arc::new(Self {
            config,
            storage,
            cache,
            rate,
            quota,
            ingest,
            live,
            jobs,
            pipeline,
        }))
    }
}

/// The authenticated caller, as established by the outer auth layer.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: String,
    pub tier: Tier,
}

pub fn caller_from_headers(headers: &HeaderMap) -> Caller {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
        .to_string();
    let tier = headers
        .get("x-user-tier")
        .and_then(|v| v.to_str().ok())
        .map(Tier::parse)
        .unwrap_or(Tier::Free);
    Caller { user_id, tier }
}

/// Response-side form of [`CoreError`], with optional structured detail
/// (e.g. the full quota violation list).
#[derive(Debug)]
pub struct ApiError {
    pub error: CoreError,
    pub detail: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(error: CoreError) -> Self {
        Self {
            error,
            detail: None,
        }
    }

    pub fn rate_limited(retry_after_s: u64) -> Self {
        Self::new(CoreError::RateLimited { retry_after_s })
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::new(err)
    }
}

impl From<murmur_ingest::IngestError> for ApiError {
    fn from(err: murmur_ingest::IngestError) -> Self {
        ApiError::new(err.into())
    }
}

impl From<murmur_live::LiveError> for ApiError {
    fn from(err: murmur_live::LiveError) -> Self {
        ApiError::new(err.into())
    }
}

impl From<murmur_stt::SttError> for ApiError {
    fn from(err: murmur_stt::SttError) -> Self {
        ApiError::new(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.error {
            CoreError::InvalidInput(_) | CoreError::IntegrityMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoreError::ProviderBadMedia(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.error, "request failed");
        }

        let mut body = serde_json::json!({
            "error": self.error.code(),
            "message": self.error.to_string(),
        });
        if let CoreError::RateLimited { retry_after_s } = &self.error {
            body["retry_after"] = serde_json::json!(retry_after_s);
        }
        if let Some(detail) = self.detail {
            if let (Some(target), Some(extra)) = (body.as_object_mut(), detail.as_object()) {
                for (key, value) in extra {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Admission guard for time-based limit classes.
pub fn check_rate(
    services: &CoreServices,
    caller: &Caller,
    class: LimitClass,
) -> ApiResult<()> {
    let decision = services.rate.check(&caller.user_id, class, 1);
    if !decision.allowed {
        return Err(ApiError::rate_limited(decision.retry_after_s.unwrap_or(60)));
    }
    Ok(())
}
