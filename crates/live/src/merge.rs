//! The rolling-state merger.
//!
//! Each newly transcribed chunk is reconciled with the session tail
//! buffer: words inside the symmetric overlap window around the chunk
//! boundary are kept from whichever side has the higher mean confidence
//! (new wins only past a 10 % margin), then everything whose `end_ms` has
//! fallen behind the commit boundary moves to the permanent transcript.
//! Committed words are never revised.

use murmur_transcript::{join_words, mean_confidence, Word};
use serde::{Deserialize, Serialize};

use crate::events::{CommitEvent, PartialEvent};
use crate::state::RollingState;

/// New words must beat the existing overlap's mean confidence by this
/// margin; ties keep the existing words.
const CONFIDENCE_MARGIN: f32 = 0.1;

#[derive(Debug, Clone, Copy)]
pub struct MergeConfig {
    pub chunk_ms: u64,
    pub overlap_ms: u64,
    pub commit_window_ms: u64,
}

impl From<&murmur_config::LiveConfig> for MergeConfig {
    fn from(cfg: &murmur_config::LiveConfig) -> Self {
        Self {
            chunk_ms: cfg.chunk_ms,
            overlap_ms: cfg.overlap_ms,
            commit_window_ms: cfg.commit_window_ms,
        }
    }
}

/// Events produced by one upsert. Either side may be absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeEvents {
    pub partial: Option<PartialEvent>,
    pub commit: Option<CommitEvent>,
}

/// Merge one transcribed chunk into the rolling state.
///
/// Idempotent per `chunk_idx`: a replayed index returns empty events
/// without mutation. An empty word list is a complete no-op (the index is
/// not recorded, so a later retry of the same chunk can land).
pub fn merge_chunk(
    state: &mut RollingState,
    cfg: MergeConfig,
    chunk_idx: u32,
    words: Vec<Word>,
    avg_confidence: f32,
    chunk_start_ms: u64,
) -> MergeEvents {
    if state.received_idx_set.contains(&chunk_idx) {
        tracing::debug!(chunk_idx, "chunk already merged, skipping");
        return MergeEvents::default();
    }
    if words.is_empty() {
        tracing::debug!(chunk_idx, "empty transcription, nothing to merge");
        return MergeEvents::default();
    }

    state.received_idx_set.insert(chunk_idx);
    state.last_seq = state.last_seq.max(chunk_idx as i64);

    let overlap_start = chunk_start_ms.saturating_sub(cfg.overlap_ms);
    let overlap_end = chunk_start_ms + cfg.overlap_ms;
    let tail = std::mem::take(&mut state.tail_buffer);
    state.tail_buffer = resolve_overlap(tail, words, overlap_start, overlap_end, avg_confidence);

    let commit_boundary_ms =
        (chunk_start_ms + chunk_idx as u64 * cfg.chunk_ms).saturating_sub(cfg.commit_window_ms);

    let (stable, tail): (Vec<Word>, Vec<Word>) = std::mem::take(&mut state.tail_buffer)
        .into_iter()
        .partition(|w| w.end_ms <= commit_boundary_ms);
    state.tail_buffer = tail;

    let mut events = MergeEvents::default();

    if !stable.is_empty() {
        let start_ms = stable[0].start_ms;
        let end_ms = stable[stable.len() - 1].end_ms;
        state.last_committed_ms = state.last_committed_ms.max(end_ms);
        events.commit = Some(CommitEvent {
            text: join_words(&stable),
            start_ms,
            end_ms,
            word_count: stable.len(),
        });
        // Out-of-order arrivals can commit an earlier region after a
        // later one; the permanent list stays sorted regardless.
        state.committed_words.extend(stable);
        state.committed_words.sort_by_key(|w| w.start_ms);
        tracing::debug!(
            chunk_idx,
            commit_boundary_ms,
            last_committed_ms = state.last_committed_ms,
            "committed stable words"
        );
    }

    if !state.tail_buffer.is_empty() {
        events.partial = Some(PartialEvent {
            text: join_words(&state.tail_buffer),
            words: state.tail_buffer.clone(),
            start_ms: state.tail_buffer[0].start_ms,
            end_ms: state.tail_buffer[state.tail_buffer.len() - 1].end_ms,
        });
    }

    state.updated_at = chrono::Utc::now();
    events
}

/// Confidence-based reconciliation of the overlap window.
///
/// When only one side has words touching the window, everything is kept
/// and ordered. Collisions at the same `start_ms` keep the earlier-listed
/// word, and existing words sort ahead of new ones.
pub fn resolve_overlap(
    existing: Vec<Word>,
    new: Vec<Word>,
    overlap_start_ms: u64,
    overlap_end_ms: u64,
    new_avg_confidence: f32,
) -> Vec<Word> {
    if existing.is_empty() {
        return murmur_transcript::sort_and_dedup(new);
    }
    if new.is_empty() {
        return murmur_transcript::sort_and_dedup(existing);
    }

    let in_window = |w: &Word| w.overlaps(overlap_start_ms, overlap_end_ms);
    let (existing_overlap, existing_rest): (Vec<Word>, Vec<Word>) =
        existing.into_iter().partition(in_window);
    let (new_overlap, new_rest): (Vec<Word>, Vec<Word>) = new.into_iter().partition(in_window);

    let mut combined = Vec::new();
    if existing_overlap.is_empty() || new_overlap.is_empty() {
        combined.extend(existing_overlap);
        combined.extend(existing_rest);
        combined.extend(new_overlap);
        combined.extend(new_rest);
    } else {
        let existing_conf = mean_confidence(&existing_overlap).unwrap_or(0.8);
        let new_wins = new_avg_confidence > existing_conf + CONFIDENCE_MARGIN;
        tracing::debug!(
            existing_conf,
            new_avg_confidence,
            new_wins,
            "resolving overlap window"
        );
        combined.extend(existing_rest);
        if new_wins {
            combined.extend(new_overlap);
        } else {
            combined.extend(existing_overlap);
        }
        combined.extend(new_rest);
    }

    murmur_transcript::sort_and_dedup(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> MergeConfig {
        MergeConfig {
            chunk_ms: 5000,
            overlap_ms: 750,
            commit_window_ms: 2500,
        }
    }

    fn make_word(text: &str, start_ms: u64, end_ms: u64, confidence: f32) -> Word {
        Word::new(text, start_ms, end_ms, confidence)
    }

    #[test]
    fn test_first_chunk_stays_in_tail() {
        let mut state = RollingState::new();
        let events = merge_chunk(
            &mut state,
            cfg(),
            0,
            vec![
                make_word("the", 0, 200, 0.6),
                make_word("cat", 200, 400, 0.6),
            ],
            0.6,
            0,
        );
        // Boundary is 0 - 2500, clamped to 0: nothing commits yet.
        assert!(events.commit.is_none());
        let partial = events.partial.unwrap();
        assert_eq!(partial.text, "the cat");
        assert_eq!(state.tail_buffer.len(), 2);
        assert!(state.committed_words.is_empty());
    }

    #[test]
    fn test_new_overlap_wins_with_margin() {
        let mut state = RollingState::new();
        state.tail_buffer = vec![
            make_word("the", 0, 200, 0.6),
            make_word("cat", 200, 400, 0.6),
        ];
        state.received_idx_set.insert(0);

        // Overlapping re-recognition of "cat" plus a continuation, at
        // much higher confidence, arriving on chunk 1.
        let events = merge_chunk(
            &mut state,
            cfg(),
            1,
            vec![
                make_word("cat", 200, 400, 0.9),
                make_word("sat", 400, 600, 0.9),
            ],
            0.9,
            5000,
        );

        // Boundary 5000 + 5000 - 2500 = 7500: everything commits.
        let commit = events.commit.unwrap();
        assert_eq!(commit.text, "the cat sat");
        assert_eq!(commit.word_count, 3);
        assert_eq!(state.committed_words.len(), 3);
        assert!(state.tail_buffer.is_empty());
        assert_eq!(state.last_committed_ms, 600);

        let cats = state
            .committed_words
            .iter()
            .filter(|w| w.text == "cat")
            .count();
        assert_eq!(cats, 1, "overlap resolution must not duplicate words");
    }

    #[test]
    fn test_existing_wins_within_margin() {
        let mut state = RollingState::new();
        state.tail_buffer = vec![
            make_word("the", 0, 200, 0.6),
            make_word("cat", 200, 400, 0.6),
        ];
        state.received_idx_set.insert(0);

        let events = merge_chunk(
            &mut state,
            cfg(),
            1,
            vec![
                make_word("cap", 200, 400, 0.65),
                make_word("sat", 400, 600, 0.65),
            ],
            0.65,
            5000,
        );

        // 0.65 is within 0.1 of 0.6: the existing "cat" is kept.
        let commit = events.commit.unwrap();
        assert_eq!(commit.text, "the cat sat");
        let committed = &state.committed_words;
        assert!(committed.iter().any(|w| w.text == "cat"));
        assert!(!committed.iter().any(|w| w.text == "cap"));
    }

    #[test]
    fn test_equal_confidence_keeps_existing() {
        let merged = resolve_overlap(
            vec![make_word("cat", 200, 400, 0.6)],
            vec![make_word("cap", 210, 400, 0.7)],
            0,
            750,
            0.7,
        );
        // 0.7 does not exceed 0.6 + 0.1 strictly.
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "cat");
    }

    #[test]
    fn test_idempotent_upsert() {
        let mut state = RollingState::new();
        let words = vec![make_word("hello", 0, 400, 0.8)];
        let first = merge_chunk(&mut state, cfg(), 0, words.clone(), 0.8, 0);
        let snapshot = state.clone();
        let second = merge_chunk(&mut state, cfg(), 0, words, 0.8, 0);

        assert!(first.partial.is_some());
        assert!(second.partial.is_none() && second.commit.is_none());
        assert_eq!(state.tail_buffer, snapshot.tail_buffer);
        assert_eq!(state.committed_words, snapshot.committed_words);
    }

    #[test]
    fn test_empty_words_is_noop() {
        let mut state = RollingState::new();
        let events = merge_chunk(&mut state, cfg(), 0, Vec::new(), 0.0, 0);
        assert!(events.partial.is_none() && events.commit.is_none());
        assert!(
            !state.received_idx_set.contains(&0),
            "a retried chunk 0 with words must still be accepted later"
        );
    }

    #[test]
    fn test_commits_are_monotonic() {
        let mut state = RollingState::new();
        let mut last_commit_start = 0;
        for idx in 0..4u32 {
            let base = idx as u64 * 5000;
            let words = vec![
                make_word("w1", base, base + 1000, 0.8),
                make_word("w2", base + 1000, base + 2000, 0.8),
            ];
            let events = merge_chunk(&mut state, cfg(), idx, words, 0.8, base);
            if let Some(commit) = events.commit {
                assert!(commit.start_ms >= last_commit_start);
                last_commit_start = commit.start_ms;
            }
        }
        let committed = &state.committed_words;
        for pair in committed.windows(2) {
            assert!(pair[0].start_ms < pair[1].start_ms);
            assert!(pair[0].end_ms <= state.last_committed_ms);
        }
    }

    #[test]
    fn test_out_of_order_chunks_keep_union_sorted() {
        let mut state = RollingState::new();
        for idx in [2u32, 0, 1] {
            let base = idx as u64 * 5000;
            let words = vec![make_word(&format!("w{idx}"), base, base + 900, 0.8)];
            merge_chunk(&mut state, cfg(), idx, words, 0.8, base);
        }
        let all = state.full_words();
        assert_eq!(all.len(), 3);
        for pair in all.windows(2) {
            assert!(pair[0].start_ms < pair[1].start_ms);
        }
        assert_eq!(state.last_seq, 2);
        assert_eq!(state.received_idx_set.len(), 3);
    }
}
