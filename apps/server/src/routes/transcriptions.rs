//! Batch transcription job endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use murmur_limits::LimitClass;
use murmur_pipeline::{JobStatus, Stage};
use murmur_transcript::{ArtifactKind, CoreError};
use serde::Deserialize;

use crate::state::{caller_from_headers, check_rate, ApiError, ApiResult, CoreServices};

pub fn router() -> Router<Arc<CoreServices>> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/:job_id", get(job_status).delete(delete_job))
        .route("/:job_id/download", get(download))
        .route("/:job_id/retry", post(retry_job))
        .route("/:job_id/cancel", post(cancel_job))
}

async fn job_status(
    State(services): State<Arc<CoreServices>>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiGeneral)?;

    let job = services.jobs.get(&job_id, &caller.user_id).await?;

    let mut download_urls = serde_json::Map::new();
    if job.status == JobStatus::Complete {
        for kind in ArtifactKind::ALL {
            if let Ok(url) = services
                .jobs
                .download_url(&job_id, &caller.user_id, kind)
                .await
            {
                download_urls.insert(kind.as_str().to_string(), serde_json::Value::String(url));
            }
        }
    }

    Ok(Json(serde_json::json!({
        "job_id": job.job_id,
        "status": job.status,
        "current_stage": job.current_stage,
        "progress": job.progress_fraction() * 100.0,
        "stage_progress": job.stage_progress,
        "durations": job.stage_durations,
        "retry_count": job.retry_count,
        "error_code": job.error_code,
        "error_message": job.error_message,
        "estimated_completion_s": job.estimated_completion_s(),
        "detected_language": job.detected_language,
        "total_duration_s": job.total_duration_s,
        "word_count": job.word_count,
        "download_urls": download_urls,
    })))
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    #[serde(default = "default_format")]
    format: String,
}

fn default_format() -> String {
    "txt".to_string()
}

async fn download(
    State(services): State<Arc<CoreServices>>,
    Path(job_id): Path<String>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> ApiResult<Redirect> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiGeneral)?;

    let kind = ArtifactKind::parse(&query.format).ok_or_else(|| {
        ApiError::new(CoreError::InvalidInput(format!(
            "unsupported format: {}",
            query.format
        )))
    })?;
    let url = services
        .jobs
        .download_url(&job_id, &caller.user_id, kind)
        .await?;
    Ok(Redirect::temporary(&url))
}

#[derive(Debug, Default, Deserialize)]
struct RetryBody {
    #[serde(default)]
    from_stage: Option<String>,
}

async fn retry_job(
    State(services): State<Arc<CoreServices>>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<RetryBody>>,
) -> ApiResult<impl IntoResponse> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiTranscription)?;

    let from_stage = match body.and_then(|Json(b)| b.from_stage) {
        Some(raw) => Some(Stage::parse(&raw).ok_or_else(|| {
            ApiError::new(CoreError::InvalidInput(format!("unknown stage: {raw}")))
        })?),
        None => None,
    };
    let job = services
        .jobs
        .retry(&job_id, &caller.user_id, from_stage)
        .await?;
    Ok(Json(serde_json::json!({
        "message": "job queued for retry",
        "job_id": job.job_id,
        "retry_count": job.retry_count,
        "from_stage": from_stage,
    })))
}

async fn cancel_job(
    State(services): State<Arc<CoreServices>>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiGeneral)?;
    services.jobs.cancel(&job_id, &caller.user_id).await?;
    Ok(Json(serde_json::json!({"message": "job cancelled"})))
}

async fn delete_job(
    State(services): State<Arc<CoreServices>>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiGeneral)?;
    services.jobs.delete(&job_id, &caller.user_id).await?;
    Ok(Json(serde_json::json!({"message": "job deleted"})))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

async fn list_jobs(
    State(services): State<Arc<CoreServices>>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiGeneral)?;

    let status = match query.status.as_deref() {
        Some(raw) => Some(JobStatus::parse(raw).ok_or_else(|| {
            ApiError::new(CoreError::InvalidInput(format!("unknown status: {raw}")))
        })?),
        None => None,
    };
    let limit = query.limit.clamp(1, 100);
    let jobs = services.jobs.list(&caller.user_id, status, limit).await?;
    Ok(Json(serde_json::json!({
        "total": jobs.len(),
        "filter": status,
        "jobs": jobs,
    })))
}
