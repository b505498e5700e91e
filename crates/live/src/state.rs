//! Per-session rolling transcript state and chunk metadata.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use murmur_transcript::Word;
use serde::{Deserialize, Serialize};

/// Metadata recorded for every uploaded streaming chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub idx: u32,
    pub blob_key: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    pub chunk_ms: u64,
    pub overlap_ms: u64,
    pub uploaded_at: DateTime<Utc>,
    pub owner_id: String,
}

/// The merger's working state for one session.
///
/// `committed_words ∪ tail_buffer` stays sorted by `start_ms` with no two
/// words sharing a start; `received_idx_set` never shrinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingState {
    pub last_committed_ms: u64,
    pub tail_buffer: Vec<Word>,
    pub received_idx_set: BTreeSet<u32>,
    pub last_seq: i64,
    pub updated_at: DateTime<Utc>,
    pub committed_words: Vec<Word>,
}

impl RollingState {
    pub fn new() -> Self {
        Self {
            last_committed_ms: 0,
            tail_buffer: Vec::new(),
            received_idx_set: BTreeSet::new(),
            last_seq: -1,
            updated_at: Utc::now(),
            committed_words: Vec::new(),
        }
    }

    /// Committed words followed by the volatile tail, sorted.
    pub fn full_words(&self) -> Vec<Word> {
        let mut words = self.committed_words.clone();
        words.extend(self.tail_buffer.iter().cloned());
        words.sort_by_key(|w| w.start_ms);
        words
    }

    pub fn full_text(&self) -> String {
        murmur_transcript::join_words(&self.full_words())
    }
}

impl Default for RollingState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_words_interleaves_sorted() {
        let mut state = RollingState::new();
        state.committed_words = vec![Word::new("a", 0, 200, 0.9)];
        state.tail_buffer = vec![Word::new("b", 200, 400, 0.9)];
        let words = state.full_words();
        assert_eq!(words.len(), 2);
        assert_eq!(state.full_text(), "a b");
    }

    #[test]
    fn test_serde_round_trip() {
        let mut state = RollingState::new();
        state.received_idx_set.insert(3);
        state.last_seq = 3;
        let json = serde_json::to_string(&state).unwrap();
        let back: RollingState = serde_json::from_str(&json).unwrap();
        assert!(back.received_idx_set.contains(&3));
        assert_eq!(back.last_seq, 3);
    }
}
