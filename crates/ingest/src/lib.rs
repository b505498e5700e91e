//! Resumable chunked ingest.
//!
//! Upload sessions accept fixed-size chunks in any order, tolerate
//! duplicates, and are sealed by a streaming finalize that concatenates
//! chunks with an SHA-256 running hash. A failed finalize leaves the
//! session active so the client retries without re-uploading.

mod repo;
mod service;
mod session;

pub use repo::{MemorySessionRepository, SessionRepository};
pub use service::{AssembledUpload, ChunkAck, IngestService, NewSessionRequest, SessionProgress};
pub use session::{SessionStatus, UploadSession};

use murmur_transcript::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("session repository error: {0}")]
    Repo(String),
    #[error("upload session not found: {0}")]
    SessionNotFound(String),
    #[error("upload session owned by another user")]
    NotOwner,
    #[error("upload session is not active (status: {0})")]
    NotActive(String),
    #[error("invalid chunk index {idx}, session has {total} chunks")]
    InvalidChunkIndex { idx: u32, total: u32 },
    #[error("invalid chunk size, expected {expected} bytes, got {actual}")]
    ChunkSizeMismatch { expected: u64, actual: u64 },
    #[error("missing chunks: {0:?}")]
    MissingChunks(Vec<u32>),
    #[error("integrity check failed")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("assembled size {actual} does not match declared {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error(transparent)]
    Blob(#[from] murmur_blobstore::StoreError),
}

impl From<IngestError> for CoreError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::SessionNotFound(id) => CoreError::NotFound(format!("upload session {id}")),
            IngestError::NotOwner => CoreError::Forbidden("upload session access denied".into()),
            IngestError::NotActive(status) => {
                CoreError::InvalidInput(format!("upload session is {status}"))
            }
            IngestError::InvalidChunkIndex { idx, total } => {
                CoreError::InvalidInput(format!("chunk index {idx} out of range 0..{total}"))
            }
            IngestError::ChunkSizeMismatch { expected, actual } => CoreError::InvalidInput(
                format!("invalid chunk size, expected {expected} bytes, got {actual}"),
            ),
            IngestError::MissingChunks(missing) => {
                CoreError::InvalidInput(format!("missing chunks: {missing:?}"))
            }
            IngestError::IntegrityMismatch { expected, actual } => {
                CoreError::IntegrityMismatch { expected, actual }
            }
            IngestError::SizeMismatch { expected, actual } => CoreError::Internal(format!(
                "assembled {actual} bytes, declared {expected}"
            )),
            IngestError::Invalid(msg) => CoreError::InvalidInput(msg),
            IngestError::Blob(murmur_blobstore::StoreError::NotFound(_)) => {
                CoreError::NotFound("uploaded chunk".to_string())
            }
            other => CoreError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// MIME allow-list check with `type/*` wildcard support.
pub fn is_mime_allowed(mime_type: &str, allowed: &[&str]) -> bool {
    allowed.iter().any(|pattern| {
        if let Some(prefix) = pattern.strip_suffix("/*") {
            mime_type
                .split('/')
                .next()
                .is_some_and(|family| family == prefix)
        } else {
            *pattern == mime_type
        }
    })
}
