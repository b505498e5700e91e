//! The ingest operations: session creation, chunk puts, streaming
//! finalize, cancellation, and the expiry sweep.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use bytes::Bytes;
use chrono::{Duration, Utc};
use murmur_blobstore::{content_type_for, keys, BlobMetadata, Storage};
use murmur_config::PipelineConfig;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::repo::SessionRepository;
use crate::session::{SessionStatus, UploadSession};
use crate::{is_mime_allowed, IngestError, Result};

const ALLOWED_MIME_TYPES: [&str; 2] = ["audio/*", "video/*"];

#[derive(Debug, Clone)]
pub struct NewSessionRequest {
    pub owner_id: String,
    pub filename: String,
    pub total_size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkAck {
    pub chunk_index: u32,
    pub uploaded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionProgress {
    pub upload_id: String,
    pub status: SessionStatus,
    pub progress_percent: f64,
    pub chunks_uploaded: Vec<u32>,
    pub total_chunks: u32,
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// Result of a successful finalize, handed to job creation.
#[derive(Debug, Clone)]
pub struct AssembledUpload {
    pub session: UploadSession,
    pub blob_key: String,
    pub sha256: String,
}

pub struct IngestService {
    repo: Arc<dyn SessionRepository>,
    storage: Storage,
    cfg: PipelineConfig,
}

impl IngestService {
    pub fn new(repo: Arc<dyn SessionRepository>, storage: Storage, cfg: PipelineConfig) -> Self {
        Self { repo, storage, cfg }
    }

    pub fn chunk_size(&self) -> u64 {
        self.cfg.upload_chunk_size
    }

    pub fn allowed_mime_types(&self) -> Vec<String> {
        ALLOWED_MIME_TYPES.iter().map(|s| s.to_string()).collect()
    }

    pub fn max_duration_hours(&self) -> u32 {
        self.cfg.max_duration_hours
    }

    pub fn create_session(&self, request: NewSessionRequest) -> Result<UploadSession> {
        if request.total_size == 0 {
            return Err(IngestError::Invalid("total_size must be positive".into()));
        }
        if request.total_size > self.cfg.max_file_size {
            return Err(IngestError::Invalid(format!(
                "file too large, maximum is {} MB",
                self.cfg.max_file_size / (1024 * 1024)
            )));
        }
        if !is_mime_allowed(&request.mime_type, &ALLOWED_MIME_TYPES) {
            return Err(IngestError::Invalid(format!(
                "unsupported file type: {}",
                request.mime_type
            )));
        }
        if request.filename.trim().is_empty() {
            return Err(IngestError::Invalid("filename must not be empty".into()));
        }
        if request.filename.contains('/') || request.filename.contains('\\') {
            return Err(IngestError::Invalid(
                "filename must not contain path separators".into(),
            ));
        }

        let now = Utc::now();
        let session = UploadSession {
            upload_id: Uuid::new_v4().to_string(),
            owner_id: request.owner_id,
            filename: request.filename,
            total_size: request.total_size,
            mime_type: request.mime_type,
            chunk_size: self.cfg.upload_chunk_size,
            status: SessionStatus::Active,
            chunks_uploaded: Default::default(),
            final_blob_key: None,
            sha256: None,
            created_at: now,
            expires_at: now + Duration::seconds(self.cfg.upload_session_ttl_s as i64),
        };
        self.repo.create(&session)?;
        tracing::info!(
            upload_id = %session.upload_id,
            filename = %session.filename,
            total_size = session.total_size,
            total_chunks = session.total_chunks(),
            "created upload session"
        );
        Ok(session)
    }

    fn load_active(&self, upload_id: &str, owner_id: &str) -> Result<UploadSession> {
        let session = self
            .repo
            .get(upload_id)?
            .ok_or_else(|| IngestError::SessionNotFound(upload_id.to_string()))?;
        if session.owner_id != owner_id {
            return Err(IngestError::NotOwner);
        }
        if session.status != SessionStatus::Active {
            return Err(IngestError::NotActive(session.status.as_str().to_string()));
        }
        Ok(session)
    }

    /// Idempotent chunk put: a duplicate index acknowledges without a
    /// second write; a failed put never advances the session.
    pub async fn put_chunk(
        &self,
        upload_id: &str,
        idx: u32,
        data: Bytes,
        owner_id: &str,
    ) -> Result<ChunkAck> {
        let session = self.load_active(upload_id, owner_id)?;
        let total = session.total_chunks();
        if idx >= total {
            return Err(IngestError::InvalidChunkIndex { idx, total });
        }
        if session.chunks_uploaded.contains(&idx) {
            tracing::debug!(upload_id, idx, "duplicate chunk put, acknowledging");
            return Ok(ChunkAck {
                chunk_index: idx,
                uploaded: true,
            });
        }

        let expected = session.expected_chunk_size(idx);
        if data.len() as u64 != expected {
            return Err(IngestError::ChunkSizeMismatch {
                expected,
                actual: data.len() as u64,
            });
        }

        self.storage
            .put(
                &keys::upload_chunk(upload_id, idx),
                data,
                BlobMetadata {
                    content_type: "application/octet-stream".to_string(),
                    ..Default::default()
                },
            )
            .await?;
        self.repo.add_chunk(upload_id, idx)?;
        tracing::info!(upload_id, idx, total, "stored upload chunk");
        Ok(ChunkAck {
            chunk_index: idx,
            uploaded: true,
        })
    }

    pub fn status(&self, upload_id: &str, owner_id: &str) -> Result<SessionProgress> {
        let session = self
            .repo
            .get(upload_id)?
            .ok_or_else(|| IngestError::SessionNotFound(upload_id.to_string()))?;
        if session.owner_id != owner_id {
            return Err(IngestError::NotOwner);
        }
        let total_chunks = session.total_chunks();
        let uploaded = session.chunks_uploaded.len() as f64;
        Ok(SessionProgress {
            upload_id: session.upload_id.clone(),
            status: session.status,
            progress_percent: if total_chunks > 0 {
                uploaded / total_chunks as f64 * 100.0
            } else {
                0.0
            },
            chunks_uploaded: session.chunks_uploaded.iter().copied().collect(),
            total_chunks,
            bytes_uploaded: session.bytes_uploaded(),
            total_bytes: session.total_size,
            created_at: session.created_at,
            expires_at: session.expires_at,
        })
    }

    /// Concatenate all chunks into the final blob, hashing as we go.
    /// Memory stays bounded by one chunk. On any failure the session is
    /// left `Active` and the partial assembly is aborted.
    pub async fn finalize(
        &self,
        upload_id: &str,
        owner_id: &str,
        expected_sha256: Option<String>,
    ) -> Result<AssembledUpload> {
        let session = self.load_active(upload_id, owner_id)?;
        let missing = session.missing_chunks();
        if !missing.is_empty() {
            return Err(IngestError::MissingChunks(missing));
        }

        let final_key = format!("sessions/{upload_id}/{}", session.filename);
        let content_type = content_type_for(&session.filename);
        let mut writer = self.storage.begin_multipart(&final_key, content_type).await?;
        let mut hasher = Sha256::new();
        let mut assembled: u64 = 0;

        for idx in 0..session.total_chunks() {
            let chunk = match self.storage.get(&keys::upload_chunk(upload_id, idx)).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    writer.abort().await.ok();
                    return Err(e.into());
                }
            };
            hasher.update(&chunk);
            assembled += chunk.len() as u64;
            if let Err(e) = writer.write_part(chunk).await {
                writer.abort().await.ok();
                return Err(e.into());
            }
        }

        if assembled != session.total_size {
            writer.abort().await.ok();
            return Err(IngestError::SizeMismatch {
                expected: session.total_size,
                actual: assembled,
            });
        }

        let sha256 = hex::encode(hasher.finalize());
        if let Some(expected) = expected_sha256 {
            if !expected.eq_ignore_ascii_case(&sha256) {
                writer.abort().await.ok();
                tracing::warn!(upload_id, "sha256 mismatch on finalize");
                return Err(IngestError::IntegrityMismatch {
                    expected,
                    actual: sha256,
                });
            }
        }

        let blob_key = writer.finish().await?;
        self.repo.complete(upload_id, &blob_key, &sha256)?;
        self.delete_chunks(&session).await;

        let mut session = session;
        session.status = SessionStatus::Completed;
        session.final_blob_key = Some(blob_key.clone());
        session.sha256 = Some(sha256.clone());

        tracing::info!(upload_id, blob_key = %blob_key, size = assembled, "upload finalized");
        Ok(AssembledUpload {
            session,
            blob_key,
            sha256,
        })
    }

    pub async fn cancel(&self, upload_id: &str, owner_id: &str) -> Result<()> {
        let session = self
            .repo
            .get(upload_id)?
            .ok_or_else(|| IngestError::SessionNotFound(upload_id.to_string()))?;
        if session.owner_id != owner_id {
            return Err(IngestError::NotOwner);
        }
        if session.status.is_terminal() {
            return Ok(());
        }
        self.delete_chunks(&session).await;
        self.repo.set_status(upload_id, SessionStatus::Cancelled)?;
        tracing::info!(upload_id, "upload session cancelled");
        Ok(())
    }

    /// Expire overdue sessions and reclaim their chunk blobs. Returns how
    /// many sessions were expired.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let expired = self.repo.list_expired(Utc::now())?;
        let count = expired.len();
        for session in expired {
            self.delete_chunks(&session).await;
            self.repo
                .set_status(&session.upload_id, SessionStatus::Expired)?;
            tracing::info!(upload_id = %session.upload_id, "expired upload session");
        }
        Ok(count)
    }

    /// Signed (or local) URL for the assembled blob.
    pub async fn download_url(&self, blob_key: &str, ttl: StdDuration) -> Result<String> {
        Ok(self.storage.get_url(blob_key, ttl).await?)
    }

    async fn delete_chunks(&self, session: &UploadSession) {
        for idx in session.chunks_uploaded.iter() {
            self.storage
                .delete(&keys::upload_chunk(&session.upload_id, *idx))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemorySessionRepository;
    use murmur_blobstore::{LocalStore, ObjectStore};

    struct Fixture {
        service: IngestService,
        storage: Storage,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(dir.path()).unwrap());
        let storage = Storage::new(store);
        let cfg = PipelineConfig {
            upload_chunk_size: 4,
            max_file_size: 1024,
            ..Default::default()
        };
        Fixture {
            service: IngestService::new(Arc::new(MemorySessionRepository::new()), storage.clone(), cfg),
            storage,
            _dir: dir,
        }
    }

    fn request(total_size: u64) -> NewSessionRequest {
        NewSessionRequest {
            owner_id: "u1".to_string(),
            filename: "audio.wav".to_string(),
            total_size,
            mime_type: "audio/wav".to_string(),
        }
    }

    #[tokio::test]
    async fn test_full_upload_round_trip() {
        let fx = fixture();
        let session = fx.service.create_session(request(10)).unwrap();
        assert_eq!(session.total_chunks(), 3);

        fx.service
            .put_chunk(&session.upload_id, 0, Bytes::from_static(b"abcd"), "u1")
            .await
            .unwrap();
        fx.service
            .put_chunk(&session.upload_id, 2, Bytes::from_static(b"ij"), "u1")
            .await
            .unwrap();
        fx.service
            .put_chunk(&session.upload_id, 1, Bytes::from_static(b"efgh"), "u1")
            .await
            .unwrap();

        let assembled = fx
            .service
            .finalize(&session.upload_id, "u1", None)
            .await
            .unwrap();
        let blob = fx.storage.get(&assembled.blob_key).await.unwrap();
        assert_eq!(&blob[..], b"abcdefghij");

        let expected = hex::encode(Sha256::digest(b"abcdefghij"));
        assert_eq!(assembled.sha256, expected);

        // Chunk blobs are reclaimed after assembly.
        assert!(
            !fx.storage
                .exists(&keys::upload_chunk(&session.upload_id, 0))
                .await
        );
    }

    #[tokio::test]
    async fn test_duplicate_chunk_is_idempotent() {
        let fx = fixture();
        let session = fx.service.create_session(request(8)).unwrap();
        fx.service
            .put_chunk(&session.upload_id, 0, Bytes::from_static(b"aaaa"), "u1")
            .await
            .unwrap();
        let ack = fx
            .service
            .put_chunk(&session.upload_id, 0, Bytes::from_static(b"aaaa"), "u1")
            .await
            .unwrap();
        assert!(ack.uploaded);

        let progress = fx.service.status(&session.upload_id, "u1").unwrap();
        assert_eq!(progress.chunks_uploaded, vec![0]);
        assert_eq!(progress.bytes_uploaded, 4);
    }

    #[tokio::test]
    async fn test_chunk_validation() {
        let fx = fixture();
        let session = fx.service.create_session(request(8)).unwrap();

        let out_of_range = fx
            .service
            .put_chunk(&session.upload_id, 9, Bytes::from_static(b"aaaa"), "u1")
            .await;
        assert!(matches!(
            out_of_range,
            Err(IngestError::InvalidChunkIndex { idx: 9, total: 2 })
        ));

        let wrong_size = fx
            .service
            .put_chunk(&session.upload_id, 0, Bytes::from_static(b"toolong"), "u1")
            .await;
        assert!(matches!(
            wrong_size,
            Err(IngestError::ChunkSizeMismatch {
                expected: 4,
                actual: 7
            })
        ));
    }

    #[tokio::test]
    async fn test_finalize_enumerates_missing() {
        let fx = fixture();
        let session = fx.service.create_session(request(12)).unwrap();
        fx.service
            .put_chunk(&session.upload_id, 1, Bytes::from_static(b"bbbb"), "u1")
            .await
            .unwrap();

        let err = fx.service.finalize(&session.upload_id, "u1", None).await;
        match err {
            Err(IngestError::MissingChunks(missing)) => assert_eq!(missing, vec![0, 2]),
            other => panic!("expected MissingChunks, got {other:?}"),
        }
        // Session remains active for retry.
        let progress = fx.service.status(&session.upload_id, "u1").unwrap();
        assert_eq!(progress.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_integrity_mismatch_keeps_session_active() {
        let fx = fixture();
        let session = fx.service.create_session(request(4)).unwrap();
        fx.service
            .put_chunk(&session.upload_id, 0, Bytes::from_static(b"data"), "u1")
            .await
            .unwrap();

        let err = fx
            .service
            .finalize(&session.upload_id, "u1", Some("deadbeef".to_string()))
            .await;
        assert!(matches!(err, Err(IngestError::IntegrityMismatch { .. })));

        let progress = fx.service.status(&session.upload_id, "u1").unwrap();
        assert_eq!(progress.status, SessionStatus::Active);
        // The rejected assembly must not be observable.
        assert!(
            !fx.storage
                .exists(&format!("sessions/{}/audio.wav", session.upload_id))
                .await
        );

        // Retrying with the right hash succeeds without re-uploading.
        let expected = hex::encode(Sha256::digest(b"data"));
        let assembled = fx
            .service
            .finalize(&session.upload_id, "u1", Some(expected))
            .await
            .unwrap();
        assert_eq!(assembled.session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_rejects_bad_session_requests() {
        let fx = fixture();
        assert!(fx.service.create_session(request(0)).is_err());
        assert!(fx.service.create_session(request(1_000_000)).is_err());
        let mut bad_mime = request(10);
        bad_mime.mime_type = "image/png".to_string();
        assert!(fx.service.create_session(bad_mime).is_err());
    }

    #[tokio::test]
    async fn test_ownership_enforced() {
        let fx = fixture();
        let session = fx.service.create_session(request(8)).unwrap();
        let err = fx
            .service
            .put_chunk(&session.upload_id, 0, Bytes::from_static(b"aaaa"), "intruder")
            .await;
        assert!(matches!(err, Err(IngestError::NotOwner)));
        assert!(matches!(
            fx.service.status(&session.upload_id, "intruder"),
            Err(IngestError::NotOwner)
        ));
    }

    #[tokio::test]
    async fn test_cancel_reclaims_chunks() {
        let fx = fixture();
        let session = fx.service.create_session(request(8)).unwrap();
        fx.service
            .put_chunk(&session.upload_id, 0, Bytes::from_static(b"aaaa"), "u1")
            .await
            .unwrap();

        fx.service.cancel(&session.upload_id, "u1").await.unwrap();
        let progress = fx.service.status(&session.upload_id, "u1").unwrap();
        assert_eq!(progress.status, SessionStatus::Cancelled);
        assert!(
            !fx.storage
                .exists(&keys::upload_chunk(&session.upload_id, 0))
                .await
        );

        // Terminal sessions refuse further chunks.
        let err = fx
            .service
            .put_chunk(&session.upload_id, 1, Bytes::from_static(b"bbbb"), "u1")
            .await;
        assert!(matches!(err, Err(IngestError::NotActive(_))));
    }
}
