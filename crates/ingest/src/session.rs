//! Upload-session record and its state machine.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status is monotonic: `Active` can move to any terminal state, terminal
/// states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "cancelled" => Some(SessionStatus::Cancelled),
            "expired" => Some(SessionStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != SessionStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: String,
    pub owner_id: String,
    pub filename: String,
    pub total_size: u64,
    pub mime_type: String,
    pub chunk_size: u64,
    pub status: SessionStatus,
    pub chunks_uploaded: BTreeSet<u32>,
    pub final_blob_key: Option<String>,
    pub sha256: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn total_chunks(&self) -> u32 {
        (self.total_size.div_ceil(self.chunk_size)) as u32
    }

    /// Expected byte count for a chunk; the last chunk carries the
    /// remainder when the total is not chunk-aligned.
    pub fn expected_chunk_size(&self, idx: u32) -> u64 {
        if idx + 1 == self.total_chunks() {
            let remainder = self.total_size % self.chunk_size;
            if remainder > 0 {
                return remainder;
            }
        }
        self.chunk_size
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks())
            .filter(|idx| !self.chunks_uploaded.contains(idx))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_chunks().is_empty()
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.chunks_uploaded
            .iter()
            .map(|idx| self.expected_chunk_size(*idx))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session(total_size: u64, chunk_size: u64) -> UploadSession {
        UploadSession {
            upload_id: "u-1".to_string(),
            owner_id: "user".to_string(),
            filename: "a.wav".to_string(),
            total_size,
            mime_type: "audio/wav".to_string(),
            chunk_size,
            status: SessionStatus::Active,
            chunks_uploaded: BTreeSet::new(),
            final_blob_key: None,
            sha256: None,
            created_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn test_chunk_math_unaligned() {
        let session = make_session(10_500, 5000);
        assert_eq!(session.total_chunks(), 3);
        assert_eq!(session.expected_chunk_size(0), 5000);
        assert_eq!(session.expected_chunk_size(2), 500);
    }

    #[test]
    fn test_chunk_math_exact_single() {
        // total_size == chunk_size: exactly one chunk of full size.
        let session = make_session(5000, 5000);
        assert_eq!(session.total_chunks(), 1);
        assert_eq!(session.expected_chunk_size(0), 5000);
    }

    #[test]
    fn test_missing_and_progress() {
        let mut session = make_session(10_000, 5000);
        assert_eq!(session.missing_chunks(), vec![0, 1]);
        session.chunks_uploaded.insert(1);
        assert_eq!(session.missing_chunks(), vec![0]);
        assert_eq!(session.bytes_uploaded(), 5000);
        session.chunks_uploaded.insert(0);
        assert!(session.is_complete());
    }
}
