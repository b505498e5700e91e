//! Streaming live transcription.
//!
//! Audio chunks arrive over HTTP, are persisted, and flow through a
//! per-session dispatcher into the rolling-state merger, which emits
//! `partial`/`commit` events as words stabilize. Finalization collapses
//! the tail, emits `final`, and writes the four artifacts.

mod chunkstore;
mod dispatcher;
mod events;
mod merge;
mod state;

pub use chunkstore::{ChunkStore, MemoryChunkStore, RedisChunkStore};
pub use dispatcher::{ArtifactRef, ChunkParams, FinalizedSession, LiveService};
pub use events::{
    CommitEvent, EventEnvelope, EventKind, EventSink, InMemoryEventSink, PartialEvent,
    RedisEventSink,
};
pub use merge::{merge_chunk, resolve_overlap, MergeEvents};
pub use state::{ChunkRecord, RollingState};

use murmur_transcript::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("chunk store error: {0}")]
    Store(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session owned by another user")]
    NotOwner,
    #[error("blob storage error: {0}")]
    Blob(#[from] murmur_blobstore::StoreError),
}

impl From<redis::RedisError> for LiveError {
    fn from(err: redis::RedisError) -> Self {
        LiveError::Store(err.to_string())
    }
}

impl From<LiveError> for CoreError {
    fn from(err: LiveError) -> Self {
        match err {
            LiveError::SessionNotFound(sid) => CoreError::NotFound(format!("session {sid}")),
            LiveError::NotOwner => CoreError::Forbidden("session access denied".to_string()),
            LiveError::Blob(murmur_blobstore::StoreError::NotFound(_)) => {
                CoreError::NotFound("stored media".to_string())
            }
            other => CoreError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;
