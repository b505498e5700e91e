//! Resumable upload endpoints.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use murmur_ingest::NewSessionRequest;
use murmur_limits::{LimitClass, QuotaRequest};
use murmur_pipeline::NewJobRequest;
use murmur_transcript::CoreError;
use serde::{Deserialize, Serialize};

use crate::state::{caller_from_headers, check_rate, ApiError, ApiResult, CoreServices};

pub fn router() -> Router<Arc<CoreServices>> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/:upload_id/chunks/:idx", post(put_chunk))
        .route("/sessions/:upload_id/status", get(session_status))
        .route("/sessions/:upload_id/complete", post(complete_session))
        .route("/sessions/:upload_id", delete(cancel_session))
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    filename: String,
    total_size: u64,
    mime_type: String,
}

#[derive(Debug, Serialize)]
struct CreateSessionResponse {
    upload_id: String,
    chunk_size: u64,
    allowed_mime_types: Vec<String>,
    max_duration_hours: u32,
}

async fn create_session(
    State(services): State<Arc<CoreServices>>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<Json<CreateSessionResponse>> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiUpload)?;

    let quota = services.quota.check(
        &caller.user_id,
        caller.tier,
        QuotaRequest {
            file_size_mb: body.total_size as f64 / (1024.0 * 1024.0),
            ..Default::default()
        },
    );
    if !quota.allowed {
        return Err(
            ApiError::new(CoreError::InvalidInput("quota exceeded".to_string())).with_detail(
                serde_json::json!({
                    "violations": quota.violations,
                    "remaining": quota.remaining,
                }),
            ),
        );
    }

    let session = services.ingest.create_session(NewSessionRequest {
        owner_id: caller.user_id,
        filename: body.filename,
        total_size: body.total_size,
        mime_type: body.mime_type,
    })?;

    Ok(Json(CreateSessionResponse {
        upload_id: session.upload_id,
        chunk_size: session.chunk_size,
        allowed_mime_types: services.ingest.allowed_mime_types(),
        max_duration_hours: services.ingest.max_duration_hours(),
    }))
}

async fn read_chunk_field(mut multipart: Multipart) -> ApiResult<Bytes> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(CoreError::InvalidInput(format!("bad multipart body: {e}"))))?
    {
        let name = field.name().unwrap_or_default();
        if name == "chunk" || name == "file" {
            return field
                .bytes()
                .await
                .map_err(|e| ApiError::new(CoreError::InvalidInput(format!("chunk read: {e}"))));
        }
    }
    Err(ApiError::new(CoreError::InvalidInput(
        "missing chunk field".to_string(),
    )))
}

async fn put_chunk(
    State(services): State<Arc<CoreServices>>,
    Path((upload_id, idx)): Path<(String, u32)>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult<Json<murmur_ingest::ChunkAck>> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiGeneral)?;

    let data = read_chunk_field(multipart).await?;
    let ack = services
        .ingest
        .put_chunk(&upload_id, idx, data, &caller.user_id)
        .await?;
    Ok(Json(ack))
}

async fn session_status(
    State(services): State<Arc<CoreServices>>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<murmur_ingest::SessionProgress>> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiGeneral)?;
    Ok(Json(services.ingest.status(&upload_id, &caller.user_id)?))
}

#[derive(Debug, Default, Deserialize)]
struct CompleteBody {
    #[serde(default)]
    sha256: Option<String>,
}

#[derive(Debug, Serialize)]
struct CompleteResponse {
    job_id: String,
    upload_id: String,
    status: &'static str,
}

async fn complete_session(
    State(services): State<Arc<CoreServices>>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<CompleteBody>>,
) -> ApiResult<Json<CompleteResponse>> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiTranscription)?;

    let sha256 = body.and_then(|Json(b)| b.sha256);
    let assembled = services
        .ingest
        .finalize(&upload_id, &caller.user_id, sha256)
        .await?;

    // Estimate the audio minutes this job will consume and gate on
    // quota before admitting it to the pipeline.
    let minutes = match services.storage.get(&assembled.blob_key).await {
        Ok(blob) => {
            let filename = assembled.session.filename.clone();
            tokio::task::spawn_blocking(move || {
                murmur_pipeline::probe(blob.to_vec(), &filename)
                    .map(|p| p.duration_s / 60.0)
                    .unwrap_or(0.0)
            })
            .await
            .unwrap_or(0.0)
        }
        Err(_) => 0.0,
    };
    let quota = services.quota.check(
        &caller.user_id,
        caller.tier,
        QuotaRequest {
            minutes,
            jobs: 1,
            ..Default::default()
        },
    );
    if !quota.allowed {
        tracing::warn!(
            upload_id,
            violations = ?quota.violations,
            "transcription rejected by quota"
        );
        return Err(
            ApiError::rate_limited(3600).with_detail(serde_json::json!({
                "violations": quota.violations,
                "remaining": quota.remaining,
            })),
        );
    }

    let job = services
        .jobs
        .create_job(NewJobRequest {
            owner_id: caller.user_id,
            source_blob_key: assembled.blob_key,
            filename: assembled.session.filename,
            mime_type: assembled.session.mime_type,
            total_size: assembled.session.total_size,
            upload_id: Some(upload_id.clone()),
            language: None,
            enable_diarization: true,
        })
        .await?;

    Ok(Json(CompleteResponse {
        job_id: job.job_id,
        upload_id,
        status: "created",
    }))
}

async fn cancel_session(
    State(services): State<Arc<CoreServices>>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiGeneral)?;
    services.ingest.cancel(&upload_id, &caller.user_id).await?;
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({"message": "upload session cancelled"})),
    ))
}
