//! Streaming live-transcription endpoints.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use murmur_limits::LimitClass;
use murmur_live::{ChunkParams, EventKind};
use murmur_transcript::CoreError;
use serde::Deserialize;

use crate::state::{caller_from_headers, check_rate, ApiError, ApiResult, CoreServices};

pub fn router() -> Router<Arc<CoreServices>> {
    Router::new()
        .route("/:session_id/chunks/:idx", post(upload_chunk))
        .route("/:session_id/finalize", post(finalize_session))
        .route("/:session_id/live", get(live_transcript))
        .route("/:session_id/events", get(session_events))
}

struct ChunkUpload {
    audio: Bytes,
    params: ChunkParams,
}

async fn read_chunk_upload(mut multipart: Multipart) -> ApiResult<ChunkUpload> {
    let mut audio = None;
    let mut params = ChunkParams::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(CoreError::InvalidInput(format!("bad multipart body: {e}"))))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" | "audio" | "chunk" => {
                audio = Some(field.bytes().await.map_err(|e| {
                    ApiError::new(CoreError::InvalidInput(format!("audio read: {e}")))
                })?);
            }
            "sample_rate" => params.sample_rate = field.text().await.ok().and_then(|v| v.parse().ok()),
            "codec" => params.codec = field.text().await.ok().filter(|v| !v.is_empty()),
            "chunk_ms" => params.chunk_ms = field.text().await.ok().and_then(|v| v.parse().ok()),
            "overlap_ms" => params.overlap_ms = field.text().await.ok().and_then(|v| v.parse().ok()),
            _ => {}
        }
    }

    let audio = audio
        .ok_or_else(|| ApiError::new(CoreError::InvalidInput("missing audio field".to_string())))?;
    if audio.is_empty() {
        return Err(ApiError::new(CoreError::InvalidInput(
            "empty audio chunk".to_string(),
        )));
    }
    Ok(ChunkUpload { audio, params })
}

async fn upload_chunk(
    State(services): State<Arc<CoreServices>>,
    Path((session_id, idx)): Path<(String, u32)>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiGeneral)?;

    let upload = read_chunk_upload(multipart).await?;
    let size = upload.audio.len();
    services
        .live
        .upload_chunk(&session_id, idx, upload.audio, &caller.user_id, upload.params)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "message": "chunk uploaded and processing started",
            "session_id": session_id,
            "chunk_idx": idx,
            "file_size": size,
            "processing_started": true,
        })),
    ))
}

async fn finalize_session(
    State(services): State<Arc<CoreServices>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiTranscription)?;

    let finalized = services.live.finalize(&session_id, &caller.user_id).await?;
    let artifacts: serde_json::Map<String, serde_json::Value> = finalized
        .artifacts
        .iter()
        .map(|(kind, artifact)| {
            (
                format!("{kind}_url"),
                serde_json::Value::String(artifact.url.clone()),
            )
        })
        .collect();

    Ok(Json(serde_json::json!({
        "message": "session finalized successfully",
        "session_id": finalized.session_id,
        "transcript": {
            "text": finalized.transcript,
            "word_count": finalized.word_count,
            "duration_ms": finalized.duration_ms,
        },
        "artifacts": artifacts,
        "finalized_at": finalized.finalized_at,
    })))
}

async fn live_transcript(
    State(services): State<Arc<CoreServices>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiGeneral)?;

    services.live.verify_owner(&session_id, &caller.user_id).await?;
    let transcript = services.live.live_transcript(&session_id).await?;
    Ok(Json(transcript))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn session_events(
    State(services): State<Arc<CoreServices>>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let caller = caller_from_headers(&headers);
    check_rate(&services, &caller, LimitClass::ApiGeneral)?;
    services.live.verify_owner(&session_id, &caller.user_id).await?;

    let kind = match query.kind.as_deref() {
        Some(raw) => Some(EventKind::parse(raw).ok_or_else(|| {
            ApiError::new(CoreError::InvalidInput(format!("unknown event type: {raw}")))
        })?),
        None => None,
    };
    let events = services.live.events(&session_id, kind).await?;
    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "event_count": events.len(),
        "events": events,
    })))
}
